//! Session Orchestrator.
//!
//! Owns the transport, the source-map registry, the breakpoint controller and
//! the variable store for one runtime connection. Runtime notifications are
//! handled one at a time, in delivery order, by a single event loop; DAP
//! requests run on the caller's task and only touch shared state through
//! short, non-awaiting critical sections.

mod events;
mod profiler;
mod requests;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cdp_adapter::transport::ClosedCallback;
use cdp_adapter::{connect_websocket, CdpTransport, TransportConfig};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::breakpoints::{BreakpointController, BreakpointRecord};
use crate::config::BridgeConfig;
use crate::dap::{self, BreakpointEventBody, DebugEvent};
use crate::errors::BridgeResult;
use crate::source_maps::{HttpSourceMapFetcher, SharedRegistry, SourceMapFetcher, SourceMapRegistry};
use crate::variables::{CdpPropertySource, RemoteObject, VariableStore};
use crate::EventBus;

pub use profiler::{annotate_profile, FileProfileSink, ProfileSink};

/// Thread reported when the runtime has not announced any context yet.
pub const DEFAULT_THREAD_ID: u64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    Paused,
    Closed,
}

/// Line/column base the DAP client asked for in `initialize`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientConvention {
    pub lines_start_at1: bool,
    pub columns_start_at1: bool,
}

impl ClientConvention {
    pub fn line_to_client(&self, line: u32) -> u32 {
        if self.lines_start_at1 {
            line
        } else {
            line.saturating_sub(1)
        }
    }

    pub fn line_from_client(&self, line: u32) -> u32 {
        if self.lines_start_at1 {
            line
        } else {
            line + 1
        }
    }

    pub fn column_to_client(&self, column: u32) -> u32 {
        if self.columns_start_at1 {
            column + 1
        } else {
            column
        }
    }

    pub fn column_from_client(&self, column: u32) -> u32 {
        if self.columns_start_at1 {
            column.saturating_sub(1)
        } else {
            column
        }
    }

    pub(crate) fn breakpoint(&self, record: &BreakpointRecord) -> dap::Breakpoint {
        let state = record.state();
        dap::Breakpoint {
            id: record.id(),
            verified: state.verified,
            line: self.line_to_client(record.line()),
            column: record.column().map(|column| self.column_to_client(column)),
            source: Some(dap::Source::from_path(record.source_path())),
            message: (!state.verified).then(|| "no generated position yet".to_string()),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Location {
    pub script_id: String,
    pub line_number: u32,
    #[serde(default)]
    pub column_number: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct CdpScope {
    #[serde(rename = "type")]
    pub kind: String,
    pub object: RemoteObject,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CallFrame {
    pub call_frame_id: String,
    #[serde(default)]
    pub function_name: String,
    pub location: Location,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub scope_chain: Vec<CdpScope>,
    #[serde(default)]
    pub return_value: Option<RemoteObject>,
}

#[derive(Clone, Debug)]
pub(crate) struct PausedState {
    pub thread_id: u64,
    /// DAP frame id paired with the runtime frame, innermost first.
    pub frames: Vec<(u64, CallFrame)>,
    pub exception: Option<RemoteObject>,
}

impl PausedState {
    pub fn frame(&self, frame_id: u64) -> Option<&CallFrame> {
        self.frames
            .iter()
            .find(|(id, _)| *id == frame_id)
            .map(|(_, frame)| frame)
    }
}

pub(crate) struct SessionInner {
    pub config: BridgeConfig,
    pub transport: Arc<dyn CdpTransport>,
    pub registry: SharedRegistry,
    pub breakpoints: BreakpointController,
    pub variables: VariableStore,
    pub properties: CdpPropertySource,
    pub fetcher: Arc<dyn SourceMapFetcher>,
    pub profile_sink: Arc<dyn ProfileSink>,
    pub events: EventBus,
    pub convention: Arc<Mutex<ClientConvention>>,
    pub state: Mutex<SessionState>,
    pub contexts: Mutex<BTreeMap<u64, String>>,
    pub scripts: Mutex<HashMap<String, String>>,
    pub pause: Mutex<Option<PausedState>>,
    pub next_frame_id: AtomicU64,
    pub stepping: AtomicBool,
    pub terminated: AtomicBool,
    pub shutdown: CancellationToken,
}

impl SessionInner {
    pub fn emit(&self, event: DebugEvent) {
        trace!(target: "debug-session", ?event, "emit");
        let _ = self.events.send(event);
    }

    pub fn convention(&self) -> ClientConvention {
        *self.convention.lock()
    }

    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        if *current != SessionState::Closed {
            *current = state;
        }
    }

    pub fn current_thread(&self) -> u64 {
        self.contexts
            .lock()
            .keys()
            .next()
            .copied()
            .unwrap_or(DEFAULT_THREAD_ID)
    }

    /// Emits `terminated` once per session.
    pub fn terminate(&self) {
        *self.state.lock() = SessionState::Closed;
        if !self.terminated.swap(true, Ordering::SeqCst) {
            info!(target: "debug-session", "session terminated");
            self.emit(DebugEvent::Terminated);
        }
    }
}

struct HandshakeStep {
    method: &'static str,
    params: Value,
    required: bool,
}

fn handshake_steps() -> Vec<HandshakeStep> {
    vec![
        HandshakeStep {
            method: "Runtime.enable",
            params: json!({}),
            required: true,
        },
        HandshakeStep {
            method: "Debugger.enable",
            params: json!({}),
            required: true,
        },
        HandshakeStep {
            method: "Debugger.setPauseOnExceptions",
            params: json!({ "state": "none" }),
            required: false,
        },
        HandshakeStep {
            method: "Debugger.setAsyncCallStackDepth",
            params: json!({ "maxDepth": 32 }),
            required: false,
        },
        HandshakeStep {
            method: "Runtime.runIfWaitingForDebugger",
            params: json!({}),
            required: false,
        },
    ]
}

pub struct SessionBuilder {
    config: BridgeConfig,
    transport: Arc<dyn CdpTransport>,
    fetcher: Option<Arc<dyn SourceMapFetcher>>,
    profile_sink: Option<Arc<dyn ProfileSink>>,
    events: Option<EventBus>,
}

impl SessionBuilder {
    pub fn fetcher(mut self, fetcher: Arc<dyn SourceMapFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn profile_sink(mut self, sink: Arc<dyn ProfileSink>) -> Self {
        self.profile_sink = Some(sink);
        self
    }

    pub fn events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Runs the handshake and starts consuming runtime events.
    pub async fn start(self) -> BridgeResult<DebugSession> {
        let config = self.config;
        let timeout = config.command_timeout();
        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpSourceMapFetcher::new(config.source_map_fetch_timeout())?),
        };
        let profile_sink = self
            .profile_sink
            .unwrap_or_else(|| Arc::new(FileProfileSink::new(config.profile_dir())));
        let events = self
            .events
            .unwrap_or_else(|| crate::event_bus(config.event_buffer).0);

        let convention = Arc::new(Mutex::new(ClientConvention {
            lines_start_at1: config.lines_start_at1,
            columns_start_at1: config.columns_start_at1,
        }));
        let registry: SharedRegistry = Arc::new(RwLock::new(SourceMapRegistry::new(
            config.prelude_line_count,
            config.source_map_aliases.clone(),
        )));

        let listener_bus = events.clone();
        let listener_convention = convention.clone();
        let breakpoints = BreakpointController::new(self.transport.clone(), registry.clone(), timeout)
            .with_listener(Arc::new(move |record: &BreakpointRecord| {
                let breakpoint = listener_convention.lock().breakpoint(record);
                let _ = listener_bus.send(DebugEvent::Breakpoint(BreakpointEventBody {
                    reason: "changed".to_string(),
                    breakpoint,
                }));
            }));

        let inner = Arc::new(SessionInner {
            properties: CdpPropertySource::new(self.transport.clone(), timeout),
            transport: self.transport,
            registry,
            breakpoints,
            variables: VariableStore::new(),
            fetcher,
            profile_sink,
            events,
            convention,
            state: Mutex::new(SessionState::Connecting),
            contexts: Mutex::new(BTreeMap::new()),
            scripts: Mutex::new(HashMap::new()),
            pause: Mutex::new(None),
            next_frame_id: AtomicU64::new(1),
            stepping: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            config,
        });

        for step in handshake_steps() {
            let result = inner
                .transport
                .send_with_timeout(step.method, step.params, timeout)
                .await;
            match result {
                Ok(_) => debug!(target: "debug-session", method = step.method, "handshake step done"),
                Err(err) if step.required => {
                    warn!(target: "debug-session", method = step.method, ?err, "handshake failed");
                    return Err(err.into());
                }
                Err(err) => debug!(target: "debug-session", method = step.method, ?err, "optional handshake step failed"),
            }
        }

        inner.set_state(SessionState::Ready);
        let loop_task = tokio::spawn(event_loop(Arc::clone(&inner)));
        info!(target: "debug-session", "debug session ready");
        inner.emit(DebugEvent::Initialized);

        Ok(DebugSession {
            inner,
            tasks: Mutex::new(vec![loop_task]),
        })
    }
}

async fn event_loop(inner: Arc<SessionInner>) {
    debug!(target: "debug-session", "event loop entered");
    loop {
        select! {
            _ = inner.shutdown.cancelled() => break,
            event = inner.transport.next_event() => match event {
                Some(event) => inner.handle_event(event).await,
                None => {
                    info!(target: "debug-session", "runtime connection closed");
                    inner.terminate();
                    break;
                }
            }
        }
    }
    debug!(target: "debug-session", "event loop exiting");
}

pub struct DebugSession {
    inner: Arc<SessionInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DebugSession {
    pub fn builder(transport: Arc<dyn CdpTransport>, config: BridgeConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            transport,
            fetcher: None,
            profile_sink: None,
            events: None,
        }
    }

    /// Connects to the runtime's WebSocket endpoint and starts a session on it.
    pub async fn connect(
        config: BridgeConfig,
        transport_config: TransportConfig,
        events: EventBus,
    ) -> BridgeResult<Self> {
        let on_closed: ClosedCallback = Box::new(|| {
            info!(target: "debug-session", "runtime socket closed");
        });
        let transport = connect_websocket(&transport_config, Some(on_closed)).await?;
        Self::builder(Arc::new(transport), config)
            .events(events)
            .start()
            .await
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DebugEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn registry(&self) -> SharedRegistry {
        self.inner.registry.clone()
    }

    pub fn breakpoints(&self) -> &BreakpointController {
        &self.inner.breakpoints
    }

    pub fn variable_store(&self) -> &VariableStore {
        &self.inner.variables
    }

    /// Stops the event loop and waits for it to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}
