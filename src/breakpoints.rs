//! Breakpoint Controller.
//!
//! Breakpoints are tracked per original source path. Each record owns a FIFO
//! of runtime operations (`add`, `reset`, `delete`): a new operation waits for
//! the previous one on the same record, so a `delete` issued right after a
//! pending `add` removes exactly the breakpoint that `add` created. Operations
//! on different records run independently, except that an `add` waits for
//! removals still pending on the same source path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cdp_adapter::CdpTransport;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::Future;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::source_maps::SharedRegistry;

type OpFuture = Shared<BoxFuture<'static, ()>>;

/// Called whenever a reset flips a record's verified state.
pub type BreakpointListener = Arc<dyn Fn(&BreakpointRecord) + Send + Sync>;

/// A requested breakpoint in internal coordinates (1-based line, 0-based column).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakpointRequest {
    pub line: u32,
    pub column: Option<u32>,
    pub condition: Option<String>,
}

impl BreakpointRequest {
    pub fn at_line(line: u32) -> Self {
        Self {
            line,
            column: None,
            condition: None,
        }
    }
}

/// Result of [`BreakpointController::set_breakpoints`].
#[derive(Debug, Default)]
pub struct BreakpointUpdate {
    /// One record per requested position, in request order.
    pub records: Vec<Arc<BreakpointRecord>>,
    /// Records dropped by this call; their removal is queued.
    pub removed: Vec<Arc<BreakpointRecord>>,
}

impl BreakpointUpdate {
    /// Waits for every removal and add this update queued.
    pub async fn settled(&self) {
        for record in self.removed.iter().chain(&self.records) {
            record.settled().await;
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BreakpointState {
    pub verified: bool,
    pub runtime_id: Option<String>,
}

pub struct BreakpointRecord {
    id: u64,
    source_path: String,
    line: u32,
    column: Option<u32>,
    condition: Option<String>,
    state: Mutex<BreakpointState>,
    tail: Mutex<OpFuture>,
}

impl BreakpointRecord {
    fn new(id: u64, source_path: &str, request: &BreakpointRequest) -> Self {
        Self {
            id,
            source_path: source_path.to_string(),
            line: request.line,
            column: request.column,
            condition: request.condition.clone(),
            state: Mutex::new(BreakpointState::default()),
            tail: Mutex::new(futures::future::ready(()).boxed().shared()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn column(&self) -> Option<u32> {
        self.column
    }

    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    pub fn state(&self) -> BreakpointState {
        self.state.lock().clone()
    }

    pub fn is_verified(&self) -> bool {
        self.state.lock().verified
    }

    /// Resolves once every operation queued so far on this record has run.
    pub fn settled(&self) -> impl Future<Output = ()> + Send + 'static {
        self.tail.lock().clone()
    }

    fn matches(&self, request: &BreakpointRequest) -> bool {
        self.line == request.line
            && self.column == request.column
            && self.condition == request.condition
    }

    fn enqueue<F>(&self, op: F) -> OpFuture
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tail = self.tail.lock();
        let previous = tail.clone();
        let next = async move {
            previous.await;
            op.await;
        }
        .boxed()
        .shared();
        *tail = next.clone();
        tokio::spawn(next.clone());
        next
    }
}

impl std::fmt::Debug for BreakpointRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakpointRecord")
            .field("id", &self.id)
            .field("source_path", &self.source_path)
            .field("line", &self.line)
            .field("column", &self.column)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[derive(Clone)]
struct OpContext {
    transport: Arc<dyn CdpTransport>,
    registry: SharedRegistry,
    timeout: Option<Duration>,
    listener: Option<BreakpointListener>,
}

impl OpContext {
    async fn add(&self, record: &BreakpointRecord) {
        let column = record.column.unwrap_or(0);
        let generated = self
            .registry
            .read()
            .to_generated(&record.source_path, record.line, column);
        let Some(generated) = generated else {
            debug!(
                target: "breakpoints",
                path = %record.source_path,
                line = record.line,
                "no generated position yet"
            );
            return;
        };

        let params = json!({
            "url": generated.source_url,
            "lineNumber": generated.line.saturating_sub(1),
            "columnNumber": generated.column,
            "condition": record.condition.clone().unwrap_or_default(),
        });
        match self
            .transport
            .send_with_timeout("Debugger.setBreakpointByUrl", params, self.timeout)
            .await
        {
            Ok(result) => match result.get("breakpointId").and_then(Value::as_str) {
                Some(runtime_id) => {
                    let mut state = record.state.lock();
                    state.runtime_id = Some(runtime_id.to_string());
                    state.verified = true;
                    info!(
                        target: "breakpoints",
                        id = record.id,
                        runtime_id,
                        path = %record.source_path,
                        line = record.line,
                        "breakpoint set"
                    );
                }
                None => warn!(target: "breakpoints", id = record.id, "runtime returned no breakpointId"),
            },
            Err(err) => warn!(
                target: "breakpoints",
                id = record.id,
                path = %record.source_path,
                ?err,
                "failed to set breakpoint"
            ),
        }
    }

    async fn remove(&self, record: &BreakpointRecord) {
        let runtime_id = {
            let mut state = record.state.lock();
            state.verified = false;
            state.runtime_id.take()
        };
        let Some(runtime_id) = runtime_id else {
            return;
        };
        if let Err(err) = self
            .transport
            .send_with_timeout(
                "Debugger.removeBreakpoint",
                json!({ "breakpointId": runtime_id }),
                self.timeout,
            )
            .await
        {
            warn!(target: "breakpoints", id = record.id, %runtime_id, ?err, "failed to remove breakpoint");
        }
    }

    async fn reset(&self, record: &BreakpointRecord) {
        let was_verified = record.is_verified();
        self.remove(record).await;
        self.add(record).await;
        if was_verified != record.is_verified() {
            if let Some(listener) = &self.listener {
                listener(record);
            }
        }
    }
}

pub struct BreakpointController {
    ctx: OpContext,
    tracked: Mutex<HashMap<String, Vec<Arc<BreakpointRecord>>>>,
    removals: Mutex<HashMap<String, Vec<OpFuture>>>,
    next_id: AtomicU64,
}

impl BreakpointController {
    pub fn new(
        transport: Arc<dyn CdpTransport>,
        registry: SharedRegistry,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            ctx: OpContext {
                transport,
                registry,
                timeout,
                listener: None,
            },
            tracked: Mutex::new(HashMap::new()),
            removals: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_listener(mut self, listener: BreakpointListener) -> Self {
        self.ctx.listener = Some(listener);
        self
    }

    /// Replaces the tracked set for `source_path`. Await
    /// [`BreakpointUpdate::settled`] before reading verification.
    pub fn set_breakpoints(
        &self,
        source_path: &str,
        requested: &[BreakpointRequest],
    ) -> BreakpointUpdate {
        let mut tracked = self.tracked.lock();
        let mut previous = tracked.remove(source_path).unwrap_or_default();
        let mut kept: Vec<Arc<BreakpointRecord>> = Vec::with_capacity(requested.len());
        let mut fresh: Vec<Arc<BreakpointRecord>> = Vec::new();
        let mut records = Vec::with_capacity(requested.len());

        for request in requested {
            if let Some(existing) = kept.iter().find(|record| record.matches(request)) {
                records.push(existing.clone());
                continue;
            }
            let record = match previous.iter().position(|record| record.matches(request)) {
                Some(idx) => previous.remove(idx),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    let record = Arc::new(BreakpointRecord::new(id, source_path, request));
                    fresh.push(record.clone());
                    record
                }
            };
            kept.push(record.clone());
            records.push(record);
        }

        let pending = {
            let mut removals = self.removals.lock();
            let pending = removals.entry(source_path.to_string()).or_default();
            pending.retain(|removal| removal.peek().is_none());
            pending.extend(previous.iter().map(|dropped| self.enqueue_delete(dropped)));
            let snapshot = pending.clone();
            if pending.is_empty() {
                removals.remove(source_path);
            }
            snapshot
        };
        for record in &fresh {
            self.enqueue_add(record, pending.clone());
        }

        debug!(
            target: "breakpoints",
            path = source_path,
            tracked = kept.len(),
            removed = previous.len(),
            "breakpoints updated"
        );
        if !kept.is_empty() {
            tracked.insert(source_path.to_string(), kept);
        }
        BreakpointUpdate {
            records,
            removed: previous,
        }
    }

    /// Re-binds every tracked breakpoint in `source_path` against the maps
    /// currently registered. Call after the script covering it (re)parses.
    pub fn reset_in_source(&self, source_path: &str) -> Vec<Arc<BreakpointRecord>> {
        let records = self
            .tracked
            .lock()
            .get(source_path)
            .cloned()
            .unwrap_or_default();
        for record in &records {
            let ctx = self.ctx.clone();
            let task_record = record.clone();
            let _ = record.enqueue(async move { ctx.reset(&task_record).await });
        }
        records
    }

    pub fn records(&self, source_path: &str) -> Vec<Arc<BreakpointRecord>> {
        self.tracked
            .lock()
            .get(source_path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tracked_sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.tracked.lock().keys().cloned().collect();
        sources.sort();
        sources
    }

    fn enqueue_add(&self, record: &Arc<BreakpointRecord>, after: Vec<OpFuture>) {
        let ctx = self.ctx.clone();
        let task_record = record.clone();
        let _ = record.enqueue(async move {
            futures::future::join_all(after).await;
            ctx.add(&task_record).await;
        });
    }

    fn enqueue_delete(&self, record: &Arc<BreakpointRecord>) -> OpFuture {
        let ctx = self.ctx.clone();
        let task_record = record.clone();
        record.enqueue(async move { ctx.remove(&task_record).await })
    }
}
