//! Scriptable mock CDP runtime
//!
//! An in-process protocol peer speaking the NUL-delimited pipe transport
//! over a duplex stream. It answers Target/Debugger/Runtime commands from
//! tables the test configures and lets the test fire events at any moment.
//! Integration tests drive the full adapter against it; no browser needed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::cdp::CdpConnection;

/// Behavior tables and the command log
#[derive(Default)]
pub struct MockState {
    /// expression -> Runtime.evaluate / Debugger.evaluateOnCallFrame result
    pub eval_results: HashMap<String, Value>,
    /// objectId -> Runtime.getProperties result
    pub object_properties: HashMap<String, Value>,
    /// objectId -> Runtime.callFunctionOn result
    pub call_function_results: HashMap<String, Value>,
    /// stackTraceId -> Debugger.getStackTrace result
    pub stack_traces: HashMap<String, Value>,
    /// scriptId -> script source text
    pub script_sources: HashMap<String, String>,
    /// Locations reported by Debugger.setBreakpointByUrl responses
    pub url_breakpoint_locations: Vec<Value>,
    /// Every command received: (method, sessionId, params)
    pub commands: Vec<(String, Option<String>, Value)>,
    next_breakpoint: u64,
}

/// Test-side handle: configure behavior, emit events, inspect commands
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
    outbound: mpsc::UnboundedSender<String>,
}

impl MockHandle {
    /// Mutate the behavior tables
    pub fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Fire a CDP event at the adapter
    pub fn emit(&self, session_id: Option<&str>, method: &str, params: Value) {
        let mut message = json!({ "method": method, "params": params });
        if let Some(session_id) = session_id {
            message["sessionId"] = json!(session_id);
        }
        let _ = self.outbound.send(message.to_string());
    }

    /// Announce an attached target; `via_session` is the parent session the
    /// event is delivered on (None for the root)
    pub fn announce_target(
        &self,
        via_session: Option<&str>,
        session_id: &str,
        target_id: &str,
        target_type: &str,
        url: &str,
        waiting_for_debugger: bool,
    ) {
        self.emit(
            via_session,
            "Target.attachedToTarget",
            json!({
                "sessionId": session_id,
                "targetInfo": {
                    "targetId": target_id,
                    "type": target_type,
                    "title": "",
                    "url": url,
                    "attached": true,
                },
                "waitingForDebugger": waiting_for_debugger,
            }),
        );
    }

    /// Detach a target
    pub fn detach_target(&self, via_session: Option<&str>, session_id: &str, target_id: &str) {
        self.emit(
            via_session,
            "Target.detachedFromTarget",
            json!({ "sessionId": session_id, "targetId": target_id }),
        );
    }

    /// Announce a parsed script
    pub fn script_parsed(
        &self,
        session_id: &str,
        script_id: &str,
        url: &str,
        source_map_url: Option<&str>,
    ) {
        let mut params = json!({
            "scriptId": script_id,
            "url": url,
            "startLine": 0,
            "startColumn": 0,
            "executionContextId": 1,
            "hash": format!("hash-{script_id}"),
        });
        if let Some(map_url) = source_map_url {
            params["sourceMapURL"] = json!(map_url);
        }
        self.emit(Some(session_id), "Debugger.scriptParsed", params);
    }

    /// Pause the given session
    pub fn pause(&self, session_id: &str, params: Value) {
        self.emit(Some(session_id), "Debugger.paused", params);
    }

    /// Commands received so far for a method: (sessionId, params)
    pub fn commands(&self, method: &str) -> Vec<(Option<String>, Value)> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(m, _, _)| m == method)
            .map(|(_, sid, params)| (sid.clone(), params.clone()))
            .collect()
    }

    /// Methods of all commands received so far, in arrival order
    pub fn command_log(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .map(|(m, _, _)| m.clone())
            .collect()
    }

    /// Wait until at least `count` commands with this method have arrived
    pub async fn wait_for_command(&self, method: &str, count: usize) -> Vec<(Option<String>, Value)> {
        for _ in 0..500 {
            let seen = self.commands(method);
            if seen.len() >= count {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {count}x {method}; log: {:?}", self.command_log());
    }
}

/// The mock peer plus the adapter-side connection
pub struct MockRuntime;

impl MockRuntime {
    /// Start a mock runtime; returns the adapter-side connection and the
    /// test-side handle
    pub fn start() -> (CdpConnection, MockHandle) {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let connection = CdpConnection::from_pipe(near);

        let state = Arc::new(Mutex::new(MockState::default()));
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let handle = MockHandle {
            state: state.clone(),
            outbound,
        };

        let (mut read_half, mut write_half) = tokio::io::split(far);

        // Writer: responses and test-fired events share one ordered stream
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if write_half.write_all(text.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.write_all(&[0]).await.is_err() {
                    break;
                }
            }
        });

        // Reader: answer every command from the behavior tables
        let reader_state = state;
        let reader_outbound = handle.outbound.clone();
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 8192];
            loop {
                match read_half.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        while let Some(pos) = buf.iter().position(|&b| b == 0) {
                            let frame: Vec<u8> = buf.drain(..=pos).collect();
                            let Ok(message) =
                                serde_json::from_slice::<Value>(&frame[..frame.len() - 1])
                            else {
                                continue;
                            };
                            let response = respond(&reader_state, &message);
                            let _ = reader_outbound.send(response.to_string());
                        }
                    }
                }
            }
        });

        (connection, handle)
    }
}

fn respond(state: &Arc<Mutex<MockState>>, message: &Value) -> Value {
    let id = message["id"].clone();
    let session_id = message["sessionId"].as_str().map(str::to_string);
    let method = message["method"].as_str().unwrap_or_default().to_string();
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    let mut state = state.lock().unwrap();
    state
        .commands
        .push((method.clone(), session_id.clone(), params.clone()));

    let result = match method.as_str() {
        "Debugger.enable" => json!({ "debuggerId": "mock-debugger" }),
        "Debugger.setBreakpointByUrl" => {
            state.next_breakpoint += 1;
            json!({
                "breakpointId": format!("url-bp-{}", state.next_breakpoint),
                "locations": state.url_breakpoint_locations.clone(),
            })
        }
        "Debugger.setBreakpoint" => {
            state.next_breakpoint += 1;
            json!({
                "breakpointId": format!("bp-{}", state.next_breakpoint),
                "actualLocation": params["location"].clone(),
            })
        }
        "Runtime.evaluate" | "Debugger.evaluateOnCallFrame" => {
            let expression = params["expression"].as_str().unwrap_or_default();
            state
                .eval_results
                .get(expression)
                .cloned()
                .unwrap_or_else(|| json!({ "result": { "type": "undefined" } }))
        }
        "Runtime.getProperties" => {
            let object_id = params["objectId"].as_str().unwrap_or_default();
            state
                .object_properties
                .get(object_id)
                .cloned()
                .unwrap_or_else(|| json!({ "result": [] }))
        }
        "Runtime.callFunctionOn" => {
            let object_id = params["objectId"].as_str().unwrap_or_default();
            state
                .call_function_results
                .get(object_id)
                .cloned()
                .unwrap_or_else(|| json!({ "result": { "type": "undefined" } }))
        }
        "Debugger.getStackTrace" => {
            let trace_id = params["stackTraceId"]["id"].as_str().unwrap_or_default();
            match state.stack_traces.get(trace_id) {
                Some(result) => result.clone(),
                None => {
                    return json!({
                        "id": id,
                        "sessionId": session_id,
                        "error": { "code": -32000, "message": "unknown stack trace id" },
                    })
                }
            }
        }
        "Debugger.getScriptSource" => {
            let script_id = params["scriptId"].as_str().unwrap_or_default();
            json!({
                "scriptSource": state.script_sources.get(script_id).cloned().unwrap_or_default()
            })
        }
        "Debugger.getPossibleBreakpoints" => json!({ "locations": [] }),
        _ => json!({}),
    };

    json!({ "id": id, "sessionId": session_id, "result": result })
}
