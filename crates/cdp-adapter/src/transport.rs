use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::channel::{MessageChannel, WebSocketChannel};
use crate::config::TransportConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::metrics;

/// Asynchronous notification pushed by the runtime.
#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    /// Next runtime notification, in delivery order. `None` once closed.
    async fn next_event(&self) -> Option<TransportEvent>;

    async fn send_command(&self, method: &str, params: Value) -> Result<Value, AdapterError>;

    async fn send_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, AdapterError> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.send_command(method, params))
                .await
                .map_err(|_| {
                    AdapterError::new(AdapterErrorKind::Timeout)
                        .with_hint(format!("{method} timed out after {}ms", limit.as_millis()))
                })?,
            None => self.send_command(method, params).await,
        }
    }

    fn is_closed(&self) -> bool {
        false
    }

    /// Ask the transport to shut down; pending requests fail with `ConnectionClosed`.
    fn close(&self) {}
}

pub type ClosedCallback = Box<dyn FnOnce() + Send + 'static>;

type Responder = oneshot::Sender<Result<Value, AdapterError>>;

enum ControlMessage {
    Send {
        id: u64,
        method: String,
        params: Value,
        responder: Responder,
    },
    Cancel {
        id: u64,
    },
    Shutdown,
}

struct PendingRequest {
    method: String,
    responder: Responder,
}

/// Transport speaking CDP envelopes over any [`MessageChannel`].
pub struct SocketTransport {
    next_id: AtomicU64,
    command_tx: mpsc::UnboundedSender<ControlMessage>,
    events_rx: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    closed: Arc<AtomicBool>,
    default_timeout: Option<Duration>,
}

/// Connects to the runtime's inspector socket described by `cfg`.
pub async fn connect_websocket(
    cfg: &TransportConfig,
    on_closed: Option<ClosedCallback>,
) -> Result<SocketTransport, AdapterError> {
    let url = cfg.websocket_url.as_deref().ok_or_else(|| {
        AdapterError::new(AdapterErrorKind::Internal).with_hint("no websocket url configured")
    })?;
    url::Url::parse(url).map_err(|err| {
        AdapterError::new(AdapterErrorKind::Internal)
            .with_hint(format!("invalid websocket url {url}: {err}"))
    })?;
    let channel = WebSocketChannel::connect(url).await?;
    info!(target: "cdp-transport", %url, "runtime connection established");
    Ok(SocketTransport::new(channel, cfg, on_closed))
}

impl SocketTransport {
    /// Spawns the I/O loop; must be called inside a tokio runtime.
    pub fn new<C: MessageChannel>(
        channel: C,
        cfg: &TransportConfig,
        on_closed: Option<ClosedCallback>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let loop_closed = closed.clone();
        tokio::spawn(async move {
            Self::run_loop(channel, command_rx, events_tx).await;
            loop_closed.store(true, Ordering::SeqCst);
            if let Some(callback) = on_closed {
                callback();
            }
            debug!(target: "cdp-transport", "transport loop exited");
        });

        Self {
            next_id: AtomicU64::new(1),
            command_tx,
            events_rx: Mutex::new(events_rx),
            closed,
            default_timeout: cfg.default_timeout(),
        }
    }

    async fn send_internal(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, AdapterError> {
        if self.is_closed() {
            return Err(AdapterError::closed());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (resp_tx, resp_rx) = oneshot::channel();
        self.command_tx
            .send(ControlMessage::Send {
                id,
                method: method.to_string(),
                params,
                responder: resp_tx,
            })
            .map_err(|_| AdapterError::closed())?;

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, resp_rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let _ = self.command_tx.send(ControlMessage::Cancel { id });
                    return Err(AdapterError::new(AdapterErrorKind::Timeout)
                        .with_hint(format!("{method} (id {id}) timed out")));
                }
            },
            None => resp_rx.await,
        };

        match outcome {
            Ok(result) => result,
            Err(_) => Err(AdapterError::closed()),
        }
    }

    async fn run_loop<C: MessageChannel>(
        mut channel: C,
        mut command_rx: mpsc::UnboundedReceiver<ControlMessage>,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let mut inflight: HashMap<u64, PendingRequest> = HashMap::new();

        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(ControlMessage::Send { id, method, params, responder }) => {
                            if let Err(err) =
                                Self::handle_command(&mut channel, id, method, params, responder, &mut inflight).await
                            {
                                warn!(target: "cdp-transport", ?err, "failed to write command");
                                break;
                            }
                        }
                        Some(ControlMessage::Cancel { id }) => {
                            if let Some(pending) = inflight.remove(&id) {
                                debug!(target: "cdp-transport", id, method = %pending.method, "discarding timed out request");
                            }
                        }
                        Some(ControlMessage::Shutdown) | None => break,
                    }
                }
                frame = channel.recv_text() => {
                    match frame {
                        Some(Ok(text)) => Self::handle_frame(&text, &mut inflight, &events_tx),
                        Some(Err(err)) => {
                            warn!(target: "cdp-transport", ?err, "transport read failed");
                            break;
                        }
                        None => {
                            info!(target: "cdp-transport", "cdp connection closed by peer");
                            break;
                        }
                    }
                }
            }
        }

        for (_, pending) in inflight.drain() {
            let _ = pending.responder.send(Err(AdapterError::closed()));
        }
    }

    async fn handle_command<C: MessageChannel>(
        channel: &mut C,
        id: u64,
        method: String,
        params: Value,
        responder: Responder,
        inflight: &mut HashMap<u64, PendingRequest>,
    ) -> Result<(), AdapterError> {
        let envelope = json!({ "id": id, "method": method, "params": params });
        debug!(target: "cdp-transport", id, %method, "sending command");
        inflight.insert(id, PendingRequest { method, responder });

        if let Err(err) = channel.send_text(envelope.to_string()).await {
            if let Some(pending) = inflight.remove(&id) {
                let _ = pending.responder.send(Err(err.clone()));
            }
            return Err(err);
        }
        Ok(())
    }

    fn handle_frame(
        text: &str,
        inflight: &mut HashMap<u64, PendingRequest>,
        events_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        let message: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                warn!(target: "cdp-transport", ?err, "dropping malformed frame");
                return;
            }
        };

        let is_response = message.get("result").is_some() || message.get("error").is_some();
        if is_response {
            match message.get("id").and_then(Value::as_u64) {
                Some(id) => Self::handle_response(id, message, inflight),
                None => warn!(target: "cdp-transport", "response without numeric id"),
            }
            return;
        }

        match message.get("method").and_then(Value::as_str) {
            Some(method) => {
                metrics::record_event();
                let event = TransportEvent {
                    method: method.to_string(),
                    params: message.get("params").cloned().unwrap_or(Value::Null),
                };
                if events_tx.send(event).is_err() {
                    debug!(target: "cdp-transport", %method, "event dropped, no consumer");
                }
            }
            None => warn!(target: "cdp-transport", "frame is neither response nor event"),
        }
    }

    fn handle_response(id: u64, mut message: Value, inflight: &mut HashMap<u64, PendingRequest>) {
        let Some(pending) = inflight.remove(&id) else {
            debug!(target: "cdp-transport", id, "dropping response with no pending request");
            return;
        };

        let result = match message.get_mut("error").map(Value::take) {
            Some(error) => Err(AdapterError::protocol(error)),
            None => Ok(message
                .get_mut("result")
                .map(Value::take)
                .unwrap_or(Value::Null)),
        };
        let _ = pending.responder.send(result);
    }
}

#[async_trait]
impl CdpTransport for SocketTransport {
    async fn next_event(&self) -> Option<TransportEvent> {
        let mut guard = self.events_rx.lock().await;
        guard.recv().await
    }

    async fn send_command(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        self.send_with_timeout(method, params, self.default_timeout)
            .await
    }

    async fn send_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, AdapterError> {
        let start = Instant::now();
        metrics::record_command(method);
        match self.send_internal(method, params, timeout).await {
            Ok(value) => {
                metrics::record_command_success(method, start.elapsed());
                Ok(value)
            }
            Err(err) => {
                metrics::record_command_failure(method);
                Err(err)
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        let _ = self.command_tx.send(ControlMessage::Shutdown);
    }
}
