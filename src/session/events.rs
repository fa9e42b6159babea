use std::sync::atomic::Ordering;

use cdp_adapter::TransportEvent;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{CallFrame, PausedState, SessionInner, SessionState};
use crate::dap::{
    ContinuedEventBody, DebugEvent, OutputEventBody, Source, StoppedEventBody, ThreadEventBody,
};
use crate::errors::{BridgeError, BridgeResult};
use crate::variables::{PropertyDescriptor, RemoteObject};

impl SessionInner {
    pub(crate) async fn handle_event(&self, event: TransportEvent) {
        let method = event.method.clone();
        if let Err(err) = self.process_event(event).await {
            warn!(target: "debug-session", %method, ?err, "event handling failed");
        }
    }

    async fn process_event(&self, event: TransportEvent) -> BridgeResult<()> {
        match event.method.as_str() {
            "Runtime.executionContextCreated" => self.on_context_created(&event.params),
            "Runtime.executionContextDestroyed" => self.on_context_destroyed(&event.params),
            "Runtime.executionContextsCleared" => self.on_contexts_cleared(),
            "Debugger.scriptParsed" => self.on_script_parsed(&event.params).await,
            "Debugger.paused" => self.on_paused(event.params),
            "Debugger.resumed" => self.on_resumed(),
            "Runtime.consoleAPICalled" => self.on_console_api_called(event.params),
            other => {
                debug!(target: "debug-session", method = other, "ignoring runtime event");
                Ok(())
            }
        }
    }

    fn on_context_created(&self, params: &Value) -> BridgeResult<()> {
        let context = &params["context"];
        let Some(id) = context["id"].as_u64() else {
            return Ok(());
        };
        let name = context["name"]
            .as_str()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("context {id}"));
        info!(target: "debug-session", id, %name, "execution context created");
        self.contexts.lock().insert(id, name);
        self.emit(DebugEvent::Thread(ThreadEventBody {
            reason: "started".to_string(),
            thread_id: id,
        }));
        Ok(())
    }

    fn on_context_destroyed(&self, params: &Value) -> BridgeResult<()> {
        let Some(id) = params["executionContextId"].as_u64() else {
            return Ok(());
        };
        if self.contexts.lock().remove(&id).is_some() {
            self.emit(DebugEvent::Thread(ThreadEventBody {
                reason: "exited".to_string(),
                thread_id: id,
            }));
        }
        Ok(())
    }

    /// Hot reload: everything tied to the old scripts goes. Breakpoints stay
    /// tracked and re-bind as the new scripts parse.
    fn on_contexts_cleared(&self) -> BridgeResult<()> {
        self.registry.write().clear();
        self.scripts.lock().clear();
        self.variables.clear();
        self.variables.clear_ephemeral();
        self.pause.lock().take();
        self.set_state(SessionState::Ready);

        let exited: Vec<u64> = std::mem::take(&mut *self.contexts.lock())
            .into_keys()
            .collect();
        info!(target: "debug-session", contexts = exited.len(), "execution contexts cleared");
        for thread_id in exited {
            self.emit(DebugEvent::Thread(ThreadEventBody {
                reason: "exited".to_string(),
                thread_id,
            }));
        }
        Ok(())
    }

    async fn on_script_parsed(&self, params: &Value) -> BridgeResult<()> {
        let script_id = params["scriptId"].as_str().unwrap_or_default().to_string();
        let url = params["url"].as_str().unwrap_or_default().to_string();
        if !url.is_empty() {
            self.scripts.lock().insert(script_id.clone(), url.clone());
        }

        let source_map_url = params["sourceMapURL"].as_str().unwrap_or_default();
        if source_map_url.is_empty() {
            debug!(target: "source-maps", %script_id, %url, "script has no source map");
            return Ok(());
        }

        let map_data = match self.fetcher.fetch(&url, source_map_url).await {
            Ok(data) => data,
            Err(err) => {
                warn!(target: "source-maps", %script_id, %url, ?err, "source map unavailable");
                return Ok(());
            }
        };

        let registered = {
            let mut registry = self.registry.write();
            let is_main_bundle = registry.is_empty();
            registry
                .register(&map_data, &url, &script_id, is_main_bundle)
                .map(|_| registry.sources_for_script(&script_id))
        };
        let sources = match registered {
            Ok(sources) => sources,
            Err(err) => {
                warn!(target: "source-maps", %script_id, %url, ?err, "source map rejected");
                return Ok(());
            }
        };

        for tracked in self.breakpoints.tracked_sources() {
            if sources.binary_search(&tracked).is_ok() {
                self.breakpoints.reset_in_source(&tracked);
            }
        }
        Ok(())
    }

    fn on_paused(&self, params: Value) -> BridgeResult<()> {
        let frames: Vec<CallFrame> =
            serde_json::from_value(params.get("callFrames").cloned().unwrap_or_default())
                .map_err(BridgeError::payload)?;
        let reason = params["reason"].as_str().unwrap_or("other");
        let hit_breakpoint = params["hitBreakpoints"]
            .as_array()
            .is_some_and(|hits| !hits.is_empty());
        let stepping = self.stepping.swap(false, Ordering::SeqCst);

        let exception = match reason {
            "exception" | "promiseRejection" => params
                .get("data")
                .cloned()
                .and_then(|data| serde_json::from_value::<RemoteObject>(data).ok()),
            _ => None,
        };
        let dap_reason = if hit_breakpoint {
            "breakpoint"
        } else if exception.is_some() {
            "exception"
        } else if reason == "debugCommand" || (reason == "other" && stepping) {
            "step"
        } else {
            "pause"
        };

        let thread_id = self.current_thread();
        let frames = frames
            .into_iter()
            .map(|frame| (self.next_frame_id.fetch_add(1, Ordering::SeqCst), frame))
            .collect::<Vec<_>>();
        let description = exception.as_ref().map(RemoteObject::display);
        info!(
            target: "debug-session",
            reason = dap_reason,
            frames = frames.len(),
            "runtime paused"
        );

        *self.pause.lock() = Some(PausedState {
            thread_id,
            frames,
            exception,
        });
        self.set_state(SessionState::Paused);
        self.emit(DebugEvent::Stopped(StoppedEventBody {
            reason: dap_reason.to_string(),
            thread_id,
            description,
            all_threads_stopped: true,
        }));
        Ok(())
    }

    fn on_resumed(&self) -> BridgeResult<()> {
        self.variables.clear();
        let thread_id = self
            .pause
            .lock()
            .take()
            .map(|pause| pause.thread_id)
            .unwrap_or_else(|| self.current_thread());
        self.set_state(SessionState::Ready);
        self.emit(DebugEvent::Continued(ContinuedEventBody {
            thread_id,
            all_threads_continued: true,
        }));
        Ok(())
    }

    fn on_console_api_called(&self, params: Value) -> BridgeResult<()> {
        let kind = params["type"].as_str().unwrap_or("log").to_string();
        let mut args: Vec<RemoteObject> =
            serde_json::from_value(params.get("args").cloned().unwrap_or_default())
                .map_err(BridgeError::payload)?;

        let position =
            strip_position_metadata(&mut args).or_else(|| top_stack_position(&params));

        let mut output = args
            .iter()
            .map(|arg| match (arg.kind.as_str(), &arg.value) {
                ("string", Some(Value::String(text))) => text.clone(),
                _ => arg.display(),
            })
            .collect::<Vec<_>>()
            .join(" ");
        output.push('\n');

        let variables_reference = args
            .iter()
            .any(|arg| arg.expandable_id().is_some())
            .then(|| {
                let descriptors = args
                    .iter()
                    .enumerate()
                    .map(|(idx, arg)| PropertyDescriptor::named(idx.to_string(), arg.clone()))
                    .collect();
                self.variables.push_ephemeral(descriptors)
            });

        let mut body = OutputEventBody {
            category: console_category(&kind).to_string(),
            output,
            source: None,
            line: None,
            column: None,
            variables_reference,
        };
        if let Some((script, line, column)) = position {
            self.attach_original_position(&mut body, &script, line, column);
        }
        self.emit(DebugEvent::Output(body));
        Ok(())
    }

    /// Fills the output's source position from a generated position when a
    /// loaded map resolves it.
    pub(crate) fn attach_original_position(
        &self,
        body: &mut OutputEventBody,
        script: &str,
        line: u32,
        column: u32,
    ) {
        let original = self.registry.read().to_original(script, line, column);
        if !original.is_resolved() {
            return;
        }
        let convention = self.convention();
        body.source = Some(Source::from_path(original.source_url));
        body.line = Some(convention.line_to_client(original.line));
        body.column = Some(convention.column_to_client(original.column));
    }
}

fn console_category(kind: &str) -> &'static str {
    match kind {
        "error" | "assert" | "warning" => "stderr",
        _ => "stdout",
    }
}

/// Removes trailing `(url, line, column)` arguments appended as call-site
/// metadata. Both come from a JS stack trace and are 1-based; the column is
/// returned 0-based.
fn strip_position_metadata(args: &mut Vec<RemoteObject>) -> Option<(String, u32, u32)> {
    let n = args.len();
    if n < 4 {
        return None;
    }
    let url = match (&args[n - 3].kind[..], &args[n - 3].value) {
        ("string", Some(Value::String(url))) => url.clone(),
        _ => return None,
    };
    let number = |arg: &RemoteObject| -> Option<u32> {
        if arg.kind != "number" {
            return None;
        }
        arg.value.as_ref()?.as_u64().and_then(|v| u32::try_from(v).ok())
    };
    let line = number(&args[n - 2])?;
    let column = number(&args[n - 1])?.saturating_sub(1);
    args.truncate(n - 3);
    Some((url, line, column))
}

fn top_stack_position(params: &Value) -> Option<(String, u32, u32)> {
    let frame = params["stackTrace"]["callFrames"].as_array()?.first()?;
    let script = frame["scriptId"]
        .as_str()
        .filter(|id| !id.is_empty())
        .or_else(|| frame["url"].as_str())?
        .to_string();
    let line = frame["lineNumber"].as_u64()? as u32 + 1;
    let column = frame["columnNumber"].as_u64().unwrap_or(0) as u32;
    Some((script, line, column))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(values: Value) -> Vec<RemoteObject> {
        serde_json::from_value(values).unwrap()
    }

    #[test]
    fn strips_trailing_call_site() {
        let mut list = args(json!([
            { "type": "string", "value": "hello" },
            { "type": "string", "value": "http://localhost:8081/index.bundle" },
            { "type": "number", "value": 4, "description": "4" },
            { "type": "number", "value": 12, "description": "12" }
        ]));
        let position = strip_position_metadata(&mut list);
        assert_eq!(
            position,
            Some(("http://localhost:8081/index.bundle".to_string(), 4, 11))
        );
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn keeps_arguments_that_are_not_metadata() {
        let mut list = args(json!([
            { "type": "string", "value": "a" },
            { "type": "string", "value": "b" },
            { "type": "number", "value": 1.5, "description": "1.5" },
            { "type": "number", "value": 2, "description": "2" }
        ]));
        assert_eq!(strip_position_metadata(&mut list), None);
        assert_eq!(list.len(), 4);

        let mut short = args(json!([
            { "type": "string", "value": "x" },
            { "type": "number", "value": 1 },
            { "type": "number", "value": 2 }
        ]));
        assert_eq!(strip_position_metadata(&mut short), None);
    }

    #[test]
    fn top_frame_is_converted_to_one_based_lines() {
        let params = json!({
            "stackTrace": { "callFrames": [
                { "scriptId": "7", "url": "http://x/index.bundle", "lineNumber": 3, "columnNumber": 2 }
            ]}
        });
        assert_eq!(top_stack_position(&params), Some(("7".to_string(), 4, 2)));
        assert_eq!(top_stack_position(&json!({})), None);
    }

    #[test]
    fn warnings_and_errors_go_to_stderr() {
        assert_eq!(console_category("warning"), "stderr");
        assert_eq!(console_category("assert"), "stderr");
        assert_eq!(console_category("info"), "stdout");
    }
}
