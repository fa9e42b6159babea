use std::sync::atomic::Ordering;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{CallFrame, DebugSession, SessionState};
use crate::breakpoints::BreakpointRequest;
use crate::dap::{
    Capabilities, ContinueResponse, DebugEvent, DisconnectArguments, EvaluateArguments,
    EvaluateResponse, InitializeArguments, LogArguments, OutputEventBody, Scope, ScopesArguments,
    ScopesResponse, SetBreakpointsArguments, SetBreakpointsResponse, Source, StackFrame,
    StackTraceArguments, StackTraceResponse, StopProfilingResponse, Thread, ThreadArguments,
    ThreadsResponse, VariablesArguments, VariablesResponse,
};
use crate::errors::{BridgeError, BridgeResult};
use crate::variables::RemoteObject;

impl DebugSession {
    pub fn initialize(&self, args: InitializeArguments) -> Capabilities {
        {
            let mut convention = self.inner.convention.lock();
            if let Some(lines) = args.lines_start_at1 {
                convention.lines_start_at1 = lines;
            }
            if let Some(columns) = args.columns_start_at1 {
                convention.columns_start_at1 = columns;
            }
        }
        debug!(target: "debug-session", adapter = ?args.adapter_id, "client initialized");
        Capabilities {
            supports_configuration_done_request: true,
            supports_evaluate_for_hovers: true,
            supports_conditional_breakpoints: true,
            supports_delayed_stack_trace_loading: true,
            supports_terminate_request: false,
        }
    }

    pub async fn set_breakpoints(
        &self,
        args: SetBreakpointsArguments,
    ) -> BridgeResult<SetBreakpointsResponse> {
        let path = args
            .source
            .path
            .clone()
            .ok_or_else(|| BridgeError::invalid("setBreakpoints requires source.path"))?;
        let convention = self.inner.convention();
        let requested: Vec<BreakpointRequest> = args
            .breakpoints
            .iter()
            .map(|bp| BreakpointRequest {
                line: convention.line_from_client(bp.line),
                column: bp.column.map(|column| convention.column_from_client(column)),
                condition: bp.condition.clone().filter(|c| !c.trim().is_empty()),
            })
            .collect();

        let update = self.inner.breakpoints.set_breakpoints(&path, &requested);
        update.settled().await;

        let convention = self.inner.convention();
        Ok(SetBreakpointsResponse {
            breakpoints: update
                .records
                .iter()
                .map(|record| convention.breakpoint(record))
                .collect(),
        })
    }

    pub fn threads(&self) -> ThreadsResponse {
        let contexts = self.inner.contexts.lock();
        let threads = contexts
            .iter()
            .map(|(id, name)| Thread {
                id: *id,
                name: name.clone(),
            })
            .collect();
        ThreadsResponse { threads }
    }

    pub fn stack_trace(&self, args: StackTraceArguments) -> BridgeResult<StackTraceResponse> {
        let frames = {
            let pause = self.inner.pause.lock();
            let pause = pause.as_ref().ok_or(BridgeError::NotPaused)?;
            pause.frames.clone()
        };
        let total_frames = frames.len();
        let start = args.start_frame.unwrap_or(0).min(total_frames);
        let levels = match args.levels {
            Some(0) | None => total_frames,
            Some(levels) => levels,
        };

        let stack_frames = frames
            .iter()
            .skip(start)
            .take(levels)
            .map(|(frame_id, frame)| self.stack_frame(*frame_id, frame))
            .collect();
        Ok(StackTraceResponse {
            stack_frames,
            total_frames,
        })
    }

    fn stack_frame(&self, frame_id: u64, frame: &CallFrame) -> StackFrame {
        let convention = self.inner.convention();
        let line = frame.location.line_number + 1;
        let column = frame.location.column_number;
        let original = self
            .inner
            .registry
            .read()
            .to_original(&frame.location.script_id, line, column);
        let name = if frame.function_name.is_empty() {
            "(anonymous)".to_string()
        } else {
            frame.function_name.clone()
        };

        if original.is_resolved() {
            return StackFrame {
                id: frame_id,
                name,
                source: Some(Source::from_path(original.source_url)),
                line: convention.line_to_client(original.line),
                column: convention.column_to_client(original.column),
                presentation_hint: None,
            };
        }

        let script_url = self
            .inner
            .scripts
            .lock()
            .get(&frame.location.script_id)
            .cloned()
            .unwrap_or_else(|| frame.url.clone());
        StackFrame {
            id: frame_id,
            name,
            source: (!script_url.is_empty()).then(|| Source::from_path(script_url)),
            line: convention.line_to_client(line),
            column: convention.column_to_client(column),
            presentation_hint: Some("subtle".to_string()),
        }
    }

    pub fn scopes(&self, args: ScopesArguments) -> BridgeResult<ScopesResponse> {
        let (frame, is_top, exception) = {
            let pause = self.inner.pause.lock();
            let pause = pause.as_ref().ok_or(BridgeError::NotPaused)?;
            let frame = pause
                .frame(args.frame_id)
                .cloned()
                .ok_or(BridgeError::UnknownFrame(args.frame_id))?;
            let is_top = pause.frames.first().map(|(id, _)| *id) == Some(args.frame_id);
            (frame, is_top, pause.exception.clone())
        };

        let variables = &self.inner.variables;
        let mut scopes = Vec::new();

        if is_top {
            if let Some(exception) = exception {
                let reference = variables.push_cached(vec![variables.variable("exception", &exception)]);
                scopes.push(Scope {
                    name: "Exception".to_string(),
                    variables_reference: reference,
                    expensive: false,
                    presentation_hint: None,
                });
            }
            if let Some(return_value) = &frame.return_value {
                let reference =
                    variables.push_cached(vec![variables.variable("returnValue", return_value)]);
                scopes.push(Scope {
                    name: "Return value".to_string(),
                    variables_reference: reference,
                    expensive: false,
                    presentation_hint: None,
                });
            }
        }

        for scope in &frame.scope_chain {
            let Some(object_id) = scope.object.object_id.as_deref() else {
                continue;
            };
            let name = match &scope.name {
                Some(name) if !name.is_empty() => format!("{} ({name})", scope_title(&scope.kind)),
                _ => scope_title(&scope.kind),
            };
            scopes.push(Scope {
                name,
                variables_reference: variables.adapt_runtime_id(object_id),
                expensive: scope.kind == "global",
                presentation_hint: (scope.kind == "local").then(|| "locals".to_string()),
            });
        }

        Ok(ScopesResponse { scopes })
    }

    pub async fn variables(&self, args: VariablesArguments) -> BridgeResult<VariablesResponse> {
        let variables = self
            .inner
            .variables
            .get(&args, &self.inner.properties)
            .await?;
        Ok(VariablesResponse { variables })
    }

    pub async fn continue_(&self, _args: ThreadArguments) -> BridgeResult<ContinueResponse> {
        self.send("Debugger.resume", json!({})).await?;
        Ok(ContinueResponse {
            all_threads_continued: true,
        })
    }

    pub async fn next(&self, _args: ThreadArguments) -> BridgeResult<()> {
        self.step("Debugger.stepOver").await
    }

    pub async fn step_in(&self, _args: ThreadArguments) -> BridgeResult<()> {
        self.step("Debugger.stepInto").await
    }

    pub async fn step_out(&self, _args: ThreadArguments) -> BridgeResult<()> {
        self.step("Debugger.stepOut").await
    }

    pub async fn pause(&self, _args: ThreadArguments) -> BridgeResult<()> {
        self.send("Debugger.pause", json!({})).await?;
        Ok(())
    }

    async fn step(&self, method: &str) -> BridgeResult<()> {
        if self.inner.pause.lock().is_none() {
            return Err(BridgeError::NotPaused);
        }
        self.inner.stepping.store(true, Ordering::SeqCst);
        if let Err(err) = self.send(method, json!({})).await {
            self.inner.stepping.store(false, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }

    pub async fn evaluate(&self, args: EvaluateArguments) -> BridgeResult<EvaluateResponse> {
        let result = match args.frame_id {
            Some(frame_id) => {
                let call_frame_id = {
                    let pause = self.inner.pause.lock();
                    let pause = pause.as_ref().ok_or(BridgeError::NotPaused)?;
                    pause
                        .frame(frame_id)
                        .map(|frame| frame.call_frame_id.clone())
                        .ok_or(BridgeError::UnknownFrame(frame_id))?
                };
                self.send(
                    "Debugger.evaluateOnCallFrame",
                    json!({
                        "callFrameId": call_frame_id,
                        "expression": args.expression,
                        "silent": true,
                    }),
                )
                .await?
            }
            None => {
                self.send(
                    "Runtime.evaluate",
                    json!({ "expression": args.expression, "silent": true }),
                )
                .await?
            }
        };

        let value: RemoteObject =
            serde_json::from_value(result.get("result").cloned().unwrap_or_default())
                .map_err(BridgeError::payload)?;
        let variable = self.inner.variables.variable("", &value);
        Ok(EvaluateResponse {
            result: variable.value,
            type_name: variable.type_name,
            variables_reference: variable.variables_reference,
            indexed_variables: variable.indexed_variables,
        })
    }

    /// Forwards a log line; `source` is a generated position translated when a
    /// loaded map covers it.
    pub fn log(&self, args: LogArguments) {
        let category = match args.kind.as_deref() {
            Some("error") | Some("warn") | Some("warning") => "stderr",
            _ => "stdout",
        };
        let mut output = args.message;
        if !output.ends_with('\n') {
            output.push('\n');
        }
        let mut body = OutputEventBody {
            category: category.to_string(),
            output,
            source: None,
            line: None,
            column: None,
            variables_reference: None,
        };
        if let Some(source) = args.source {
            self.inner
                .attach_original_position(&mut body, &source.url, source.line, source.column);
        }
        self.inner.emit(DebugEvent::Output(body));
    }

    pub async fn start_profiling(&self) -> BridgeResult<()> {
        self.inner.start_profiling().await
    }

    pub async fn stop_profiling(&self) -> BridgeResult<StopProfilingResponse> {
        self.inner.stop_profiling().await
    }

    pub async fn disconnect(&self, args: DisconnectArguments) -> BridgeResult<()> {
        if self.state() == SessionState::Paused {
            if let Err(err) = self.send("Debugger.resume", json!({})).await {
                debug!(target: "debug-session", ?err, "resume on disconnect failed");
            }
        }
        info!(target: "debug-session", restart = args.restart, "client disconnected");
        self.shutdown().await;
        self.inner.transport.close();
        self.inner.terminate();
        Ok(())
    }

    /// JSON entry point: runs DAP `command` with raw `arguments` and returns
    /// the response body.
    pub async fn dispatch(&self, command: &str, arguments: Value) -> BridgeResult<Value> {
        if self.state() == SessionState::Closed && command != "disconnect" {
            return Err(BridgeError::Closed);
        }
        let result = match command {
            "initialize" => body(self.initialize(parse(arguments)?)),
            "configurationDone" => Ok(Value::Null),
            "setBreakpoints" => body(self.set_breakpoints(parse(arguments)?).await?),
            "threads" => body(self.threads()),
            "stackTrace" => body(self.stack_trace(parse(arguments)?)?),
            "scopes" => body(self.scopes(parse(arguments)?)?),
            "variables" => body(self.variables(parse(arguments)?).await?),
            "continue" => body(self.continue_(parse(arguments)?).await?),
            "next" => self.next(parse(arguments)?).await.map(|_| Value::Null),
            "stepIn" => self.step_in(parse(arguments)?).await.map(|_| Value::Null),
            "stepOut" => self.step_out(parse(arguments)?).await.map(|_| Value::Null),
            "pause" => self.pause(parse(arguments)?).await.map(|_| Value::Null),
            "evaluate" => body(self.evaluate(parse(arguments)?).await?),
            "log" => {
                self.log(parse(arguments)?);
                Ok(Value::Null)
            }
            "startProfiling" => self.start_profiling().await.map(|_| Value::Null),
            "stopProfiling" => body(self.stop_profiling().await?),
            "disconnect" => self.disconnect(parse(arguments)?).await.map(|_| Value::Null),
            other => Err(BridgeError::UnsupportedCommand(other.to_string())),
        };
        if let Err(err) = &result {
            warn!(target: "debug-session", command, code = err.code(), %err, "request failed");
        }
        result
    }

    async fn send(&self, method: &str, params: Value) -> BridgeResult<Value> {
        Ok(self
            .inner
            .transport
            .send_with_timeout(method, params, self.inner.config.command_timeout())
            .await?)
    }
}

fn parse<T: DeserializeOwned>(arguments: Value) -> BridgeResult<T> {
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments
    };
    serde_json::from_value(arguments).map_err(BridgeError::arguments)
}

fn body<T: Serialize>(response: T) -> BridgeResult<Value> {
    serde_json::to_value(response).map_err(BridgeError::payload)
}

fn scope_title(kind: &str) -> String {
    let mut chars = kind.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Scope".to_string(),
    }
}
