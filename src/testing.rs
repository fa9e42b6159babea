//! Scripted `CdpTransport` for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdp_adapter::{AdapterError, CdpTransport, TransportEvent};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub(crate) type Handler = Box<dyn Fn(&str, &Value) -> Result<Value, AdapterError> + Send + Sync>;

pub(crate) struct MockTransport {
    events_tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    commands: Mutex<Vec<(String, Value)>>,
    handler: Handler,
    latency: Mutex<HashMap<String, Duration>>,
}

impl MockTransport {
    pub fn with_handler(handler: Handler) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            events_tx: Mutex::new(Some(tx)),
            events_rx: tokio::sync::Mutex::new(rx),
            commands: Mutex::new(Vec::new()),
            handler,
            latency: Mutex::new(HashMap::new()),
        })
    }

    /// Answers like a cooperative runtime: breakpoints get fresh ids,
    /// everything else returns `{}`.
    pub fn runtime() -> Arc<Self> {
        let next = AtomicU64::new(1);
        Self::with_handler(Box::new(move |method, _params| match method {
            "Debugger.setBreakpointByUrl" => {
                let id = next.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "breakpointId": format!("bp-{id}"), "locations": [] }))
            }
            _ => Ok(json!({})),
        }))
    }

    pub fn delay(&self, method: &str, latency: Duration) {
        self.latency.lock().insert(method.to_string(), latency);
    }

    pub fn push_event(&self, method: &str, params: Value) {
        if let Some(tx) = self.events_tx.lock().as_ref() {
            let _ = tx.send(TransportEvent {
                method: method.to_string(),
                params,
            });
        }
    }

    pub fn end_events(&self) {
        self.events_tx.lock().take();
    }

    pub fn commands(&self) -> Vec<(String, Value)> {
        self.commands.lock().clone()
    }

    pub fn sent(&self, method: &str) -> Vec<Value> {
        self.commands
            .lock()
            .iter()
            .filter(|(name, _)| name == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.sent(method).len()
    }
}

#[async_trait]
impl CdpTransport for MockTransport {
    async fn next_event(&self) -> Option<TransportEvent> {
        let mut guard = self.events_rx.lock().await;
        guard.recv().await
    }

    async fn send_command(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        self.commands
            .lock()
            .push((method.to_string(), params.clone()));
        let latency = self.latency.lock().get(method).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        (self.handler)(method, &params)
    }

    fn is_closed(&self) -> bool {
        self.events_tx.lock().is_none()
    }

    fn close(&self) {
        self.end_events();
    }
}
