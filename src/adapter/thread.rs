//! One CDP execution context exposed as a DAP thread
//!
//! A thread owns its session's Debugger and Runtime domains: the script
//! table, the pause state machine, stepping and evaluation. CDP events for
//! the session are processed strictly in arrival order.
//!
//! States: Initializing -> Running <-> Paused -> Disposed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use crate::cdp::protocol::{
    ConsoleApiCalledEvent, EvaluateResult, ExceptionThrownEvent, ExecutionContextDestroyedEvent,
    PausedEvent, ScriptParsedEvent,
};
use crate::cdp::{CdpEvent, CdpSession};
use crate::common::{Error, Result, Settings};
use crate::dap::{self, DapSink};
use crate::sourcemap::{fetch, SourceMap};
use crate::sources::{RawLocation, ScriptSkipper, Source, SourceContainer, UiLocation};

use super::context::AdapterContext;
use super::stack::StackTrace;
use super::variables::{render_remote_object, VariableStore};

/// A compiled unit loaded into the runtime
pub struct Script {
    pub script_id: String,
    pub url: String,
    pub hash: String,
    pub start_line: u32,
    pub start_column: u32,
    pub execution_context_id: i64,
    pub source_map_url: Option<String>,
    pub source: Arc<Source>,
}

/// Installed by the breakpoint manager; invoked for each parsed script
/// whose map resolved authored sources, and awaited before the runtime is
/// allowed to resume
#[async_trait]
pub trait ScriptSourceMapHandler: Send + Sync {
    /// Returns true when the thread should stay paused so the user sees
    /// the stop
    async fn source_map_loaded(&self, thread: &Arc<Thread>, script: &Arc<Script>) -> bool;
}

/// Maps runtime breakpoint ids hit by a pause to DAP breakpoint ids
pub trait BreakpointHitFeedback: Send + Sync {
    fn breakpoints_hit(&self, runtime_ids: &[String]) -> Vec<i64>;
}

enum ThreadState {
    Initializing,
    Running,
    Paused(PauseDetails),
    Disposed,
}

struct PauseDetails {
    stack: Arc<StackTrace>,
    top_call_frame_id: Option<String>,
}

pub struct Thread {
    dap_id: i64,
    name: Mutex<String>,
    session: CdpSession,
    sources: Arc<SourceContainer>,
    skipper: Arc<ScriptSkipper>,
    dap: DapSink,
    context: Arc<AdapterContext>,
    settings: Settings,
    variables: VariableStore,
    state: Mutex<ThreadState>,
    scripts: Mutex<HashMap<String, Arc<Script>>>,
    /// Wrapper offset subtracted from breakpoint positions on the way down
    default_script_offset: Option<(u32, u32)>,
    source_map_handler: Mutex<Option<Arc<dyn ScriptSourceMapHandler>>>,
    hit_feedback: Mutex<Option<Arc<dyn BreakpointHitFeedback>>>,
    /// Stop reason to report for the pause a step or pause request causes
    expected_pause_reason: Mutex<Option<String>>,
    /// Per-script stay-paused decisions made while reconciling source maps
    remain_paused_hints: Mutex<HashMap<String, bool>>,
}

impl Thread {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        session: CdpSession,
        sources: Arc<SourceContainer>,
        skipper: Arc<ScriptSkipper>,
        dap: DapSink,
        context: Arc<AdapterContext>,
        settings: Settings,
        default_script_offset: Option<(u32, u32)>,
    ) -> Arc<Thread> {
        let dap_id = context.next_thread_id();
        let variables = VariableStore::new(
            context.clone(),
            session.clone(),
            settings.variables.array_chunk,
        );
        Arc::new(Thread {
            dap_id,
            name: Mutex::new(name),
            session,
            sources,
            skipper,
            dap,
            context,
            settings,
            variables,
            state: Mutex::new(ThreadState::Initializing),
            scripts: Mutex::new(HashMap::new()),
            default_script_offset,
            source_map_handler: Mutex::new(None),
            hit_feedback: Mutex::new(None),
            expected_pause_reason: Mutex::new(None),
            remain_paused_hints: Mutex::new(HashMap::new()),
        })
    }

    pub fn dap_id(&self) -> i64 {
        self.dap_id
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn session(&self) -> &CdpSession {
        &self.session
    }

    pub fn context(&self) -> &Arc<AdapterContext> {
        &self.context
    }

    pub fn skipper(&self) -> &ScriptSkipper {
        &self.skipper
    }

    pub fn sources(&self) -> &Arc<SourceContainer> {
        &self.sources
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    pub fn default_script_offset(&self) -> Option<(u32, u32)> {
        self.default_script_offset
    }

    pub fn script(&self, script_id: &str) -> Option<Arc<Script>> {
        self.scripts.lock().unwrap().get(script_id).cloned()
    }

    pub fn is_paused(&self) -> bool {
        matches!(*self.state.lock().unwrap(), ThreadState::Paused(_))
    }

    /// Install the single per-script source-map callback
    pub fn set_script_source_map_handler(&self, handler: Arc<dyn ScriptSourceMapHandler>) {
        *self.source_map_handler.lock().unwrap() = Some(handler);
    }

    /// Install the pause-statistics callback
    pub fn set_breakpoint_hit_feedback(&self, feedback: Arc<dyn BreakpointHitFeedback>) {
        *self.hit_feedback.lock().unwrap() = Some(feedback);
    }

    /// Enable the Debugger and Runtime domains and the source-map
    /// instrumentation pause
    pub async fn initialize(&self) -> Result<()> {
        self.session
            .request("Runtime.enable", json!({}))
            .await
            .ok_or(Error::CdpDisconnected)?;
        self.session
            .request("Debugger.enable", json!({}))
            .await
            .ok_or(Error::CdpDisconnected)?;
        self.session
            .request("Debugger.setAsyncCallStackDepth", json!({ "maxDepth": 32 }))
            .await;

        if !self.skipper.is_empty() {
            self.session
                .request(
                    "Debugger.setBlackboxPatterns",
                    json!({ "patterns": self.skipper.cdp_patterns() }),
                )
                .await;
        }

        if self.settings.breakpoints.pause_for_source_maps {
            self.session
                .request(
                    "Debugger.setInstrumentationBreakpoint",
                    json!({ "instrumentation": "beforeScriptWithSourceMapExecution" }),
                )
                .await;
        }

        *self.state.lock().unwrap() = ThreadState::Running;
        Ok(())
    }

    /// Let a target that attached with waitForDebuggerOnStart start running
    pub async fn run_if_waiting(&self) {
        self.session
            .request("Runtime.runIfWaitingForDebugger", json!({}))
            .await;
    }

    /// Process one CDP event; the caller delivers them in arrival order
    pub async fn handle_event(self: &Arc<Self>, event: CdpEvent) {
        match event.method.as_str() {
            "Debugger.scriptParsed" => {
                match serde_json::from_value::<ScriptParsedEvent>(event.params) {
                    Ok(params) => self.on_script_parsed(params).await,
                    Err(e) => tracing::warn!("bad scriptParsed payload: {e}"),
                }
            }
            "Debugger.paused" => match serde_json::from_value::<PausedEvent>(event.params) {
                Ok(params) => self.on_paused(params).await,
                Err(e) => tracing::warn!("bad paused payload: {e}"),
            },
            "Debugger.resumed" => self.on_resumed(),
            "Runtime.consoleAPICalled" => {
                if let Ok(params) = serde_json::from_value::<ConsoleApiCalledEvent>(event.params) {
                    self.on_console_api_called(params);
                }
            }
            "Runtime.exceptionThrown" => {
                if let Ok(params) = serde_json::from_value::<ExceptionThrownEvent>(event.params) {
                    self.on_exception_thrown(params);
                }
            }
            "Runtime.executionContextDestroyed" => {
                if let Ok(params) =
                    serde_json::from_value::<ExecutionContextDestroyedEvent>(event.params)
                {
                    self.on_execution_context_destroyed(params.execution_context_id);
                }
            }
            "Runtime.executionContextsCleared" => self.clear_scripts(),
            "Debugger.breakpointResolved" => {
                // Routed by the target manager to the breakpoint manager;
                // nothing to track here.
            }
            other => tracing::trace!(method = other, "unhandled CDP event"),
        }
    }

    async fn on_script_parsed(self: &Arc<Self>, params: ScriptParsedEvent) {
        let (source, fresh) =
            self.sources
                .add_runtime_source(&params.url, &params.script_id, &self.session);
        if fresh {
            self.dap.send_event(dap::Event::LoadedSource(dap::LoadedSourceEventBody {
                reason: "new".to_string(),
                source: source.to_dap(),
            }));
        }

        let script = Arc::new(Script {
            script_id: params.script_id.clone(),
            url: params.url.clone(),
            hash: params.hash.clone(),
            start_line: params.start_line,
            start_column: params.start_column,
            execution_context_id: params.execution_context_id,
            source_map_url: params.source_map_url.clone(),
            source: source.clone(),
        });
        self.scripts
            .lock()
            .unwrap()
            .insert(params.script_id.clone(), script.clone());

        let Some(map_url) = &params.source_map_url else {
            return;
        };
        let map_url = resolve_map_url(&params.url, map_url);

        match self.load_source_map(&map_url).await {
            Ok(map) => {
                let fresh_authored = self.sources.attach_source_map(&source, map);
                for authored in &fresh_authored {
                    self.dap
                        .send_event(dap::Event::LoadedSource(dap::LoadedSourceEventBody {
                            reason: "new".to_string(),
                            source: authored.to_dap(),
                        }));
                }

                // Breakpoint reconciliation gates the script's execution:
                // the instrumentation pause that follows is not released
                // until this completes.
                let handler = self.source_map_handler.lock().unwrap().clone();
                if let Some(handler) = handler {
                    let remain = handler.source_map_loaded(self, &script).await;
                    if remain {
                        self.remain_paused_hints
                            .lock()
                            .unwrap()
                            .insert(script.script_id.clone(), true);
                    }
                }
            }
            Err(e) => tracing::warn!(url = %map_url, "source map unavailable: {e}"),
        }
    }

    async fn load_source_map(&self, map_url: &str) -> Result<Arc<SourceMap>> {
        let body = fetch::fetch(map_url).await?;
        SourceMap::parse(&body, map_url)
    }

    async fn on_paused(self: &Arc<Self>, params: PausedEvent) {
        if params.reason == "instrumentation" {
            let script_id = params
                .data
                .as_ref()
                .and_then(|d| d.get("scriptId"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let remain = script_id
                .and_then(|id| self.remain_paused_hints.lock().unwrap().remove(&id))
                .unwrap_or(false);
            if !remain {
                self.session.request("Debugger.resume", json!({})).await;
                return;
            }
        }

        let stack = StackTrace::from_pause(self, &params);
        let top_call_frame_id = params
            .call_frames
            .first()
            .map(|f| f.call_frame_id.clone());
        *self.state.lock().unwrap() = ThreadState::Paused(PauseDetails {
            stack,
            top_call_frame_id,
        });

        let hit_breakpoint_ids = self
            .hit_feedback
            .lock()
            .unwrap()
            .as_ref()
            .map(|feedback| feedback.breakpoints_hit(&params.hit_breakpoints))
            .unwrap_or_default();

        let reason = self.stop_reason(&params);
        let description = params
            .data
            .as_ref()
            .and_then(|d| d.get("description"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        self.dap.send_event(dap::Event::Stopped(dap::StoppedEventBody {
            reason,
            description,
            thread_id: self.dap_id,
            text: None,
            all_threads_stopped: false,
            hit_breakpoint_ids,
        }));
    }

    fn stop_reason(&self, params: &PausedEvent) -> String {
        if !params.hit_breakpoints.is_empty() {
            return "breakpoint".to_string();
        }
        if let Some(expected) = self.expected_pause_reason.lock().unwrap().take() {
            return expected;
        }
        match params.reason.as_str() {
            "exception" | "promiseRejection" | "assert" | "OOM" => "exception".to_string(),
            "debugCommand" => "pause".to_string(),
            "instrumentation" => "entry".to_string(),
            _ => "pause".to_string(),
        }
    }

    fn on_resumed(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, ThreadState::Disposed) {
            return;
        }
        *state = ThreadState::Running;
        drop(state);

        // Frame ids and variable references only live for one pause
        self.variables.clear();
        self.dap
            .send_event(dap::Event::Continued(dap::ContinuedEventBody {
                thread_id: self.dap_id,
                all_threads_continued: false,
            }));
    }

    fn on_console_api_called(&self, params: ConsoleApiCalledEvent) {
        let category = match params.call_type.as_str() {
            "error" | "assert" => "stderr",
            "warning" => "console",
            _ => "stdout",
        };
        let output = params
            .args
            .iter()
            .map(render_remote_object)
            .collect::<Vec<_>>()
            .join(" ");

        let location = params
            .stack_trace
            .as_ref()
            .and_then(|st| st.call_frames.first())
            .and_then(|frame| {
                self.ui_location_of_raw(&RawLocation {
                    script_id: frame.script_id.clone(),
                    line: frame.line_number,
                    column: frame.column_number,
                })
            });

        self.dap.send_event(dap::Event::Output(dap::OutputEventBody {
            category: Some(category.to_string()),
            output: format!("{output}\n"),
            source: location.as_ref().map(|l| l.source.to_dap()),
            line: location.as_ref().map(|l| l.line as i64),
            column: location.as_ref().map(|l| l.column as i64),
        }));
    }

    fn on_exception_thrown(&self, params: ExceptionThrownEvent) {
        self.dap.send_event(dap::Event::Output(dap::OutputEventBody {
            category: Some("stderr".to_string()),
            output: format!("{}\n", params.exception_details.description()),
            ..Default::default()
        }));
    }

    fn on_execution_context_destroyed(&self, execution_context_id: i64) {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.retain(|script_id, script| {
            if script.execution_context_id == execution_context_id {
                script.source.remove_script_id(script_id);
                false
            } else {
                true
            }
        });
    }

    fn clear_scripts(&self) {
        let mut scripts = self.scripts.lock().unwrap();
        for (script_id, script) in scripts.drain() {
            script.source.remove_script_id(&script_id);
        }
    }

    // === DAP operations ===

    pub async fn resume(&self) -> Result<()> {
        self.session
            .request("Debugger.resume", json!({}))
            .await
            .ok_or(Error::CdpDisconnected)?;
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        *self.expected_pause_reason.lock().unwrap() = Some("pause".to_string());
        self.session
            .request("Debugger.pause", json!({}))
            .await
            .ok_or(Error::CdpDisconnected)?;
        Ok(())
    }

    pub async fn step_over(&self) -> Result<()> {
        self.step("Debugger.stepOver").await
    }

    pub async fn step_in(&self) -> Result<()> {
        self.step("Debugger.stepInto").await
    }

    pub async fn step_out(&self) -> Result<()> {
        self.step("Debugger.stepOut").await
    }

    async fn step(&self, method: &str) -> Result<()> {
        *self.expected_pause_reason.lock().unwrap() = Some("step".to_string());
        self.session
            .request(method, json!({}))
            .await
            .ok_or(Error::CdpDisconnected)?;
        Ok(())
    }

    /// Current pause's stack, materialized to at least `levels` frames
    pub async fn stack_trace(
        self: &Arc<Self>,
        args: &dap::StackTraceArguments,
    ) -> Result<dap::StackTraceResponseBody> {
        let stack = match &*self.state.lock().unwrap() {
            ThreadState::Paused(details) => details.stack.clone(),
            _ => return Err(Error::Internal("thread is not paused".to_string())),
        };

        let start = args.start_frame.unwrap_or(0).max(0) as usize;
        let levels = args.levels.filter(|&l| l > 0).unwrap_or(20) as usize;

        let frames = stack.frames(self, start + levels).await;
        let total = frames.len() as i64 + if stack.has_more() { 1 } else { 0 };
        let stack_frames = frames
            .iter()
            .skip(start)
            .take(levels)
            .map(|f| f.to_dap())
            .collect();

        Ok(dap::StackTraceResponseBody {
            stack_frames,
            total_frames: Some(total),
        })
    }

    /// Whether a frame id belongs to the current pause
    pub fn has_frame(&self, frame_id: i64) -> bool {
        match &*self.state.lock().unwrap() {
            ThreadState::Paused(details) => details.stack.frame_by_id(frame_id).is_some(),
            _ => false,
        }
    }

    pub fn scopes(&self, frame_id: i64) -> Result<dap::ScopesResponseBody> {
        let stack = match &*self.state.lock().unwrap() {
            ThreadState::Paused(details) => details.stack.clone(),
            _ => return Err(Error::FrameNotFound(frame_id)),
        };
        let frame = stack
            .frame_by_id(frame_id)
            .ok_or(Error::FrameNotFound(frame_id))?;

        let mut scopes = Vec::new();
        for scope in &frame.scope_chain {
            let name = match scope.scope_type.as_str() {
                "local" => "Local",
                "closure" => "Closure",
                "global" => "Global",
                "catch" => "Catch",
                "block" => "Block",
                "script" => "Script",
                "with" => "With",
                "module" => "Module",
                other => other,
            };
            scopes.push(dap::Scope {
                name: scope
                    .name
                    .as_ref()
                    .map(|n| format!("{name} ({n})"))
                    .unwrap_or_else(|| name.to_string()),
                presentation_hint: match scope.scope_type.as_str() {
                    "local" => Some("locals".to_string()),
                    _ => None,
                },
                variables_reference: self.variables.create_scope_reference(&scope.object),
                expensive: scope.scope_type == "global",
                line: scope
                    .start_location
                    .as_ref()
                    .map(|l| l.line_number as i64 + 1),
                column: scope
                    .start_location
                    .as_ref()
                    .and_then(|l| l.column_number)
                    .map(|c| c as i64 + 1),
            });
        }
        Ok(dap::ScopesResponseBody { scopes })
    }

    /// Evaluate an expression, on the selected call frame while paused,
    /// against the global context otherwise
    pub async fn evaluate(&self, args: &dap::EvaluateArguments) -> Result<dap::EvaluateResponseBody> {
        let call_frame_id = {
            let state = self.state.lock().unwrap();
            match &*state {
                ThreadState::Paused(details) => match args.frame_id {
                    Some(frame_id) => details
                        .stack
                        .frame_by_id(frame_id)
                        .and_then(|f| f.call_frame_id.clone()),
                    None => details.top_call_frame_id.clone(),
                },
                _ => None,
            }
        };

        let include_command_line_api = args.context.as_deref() == Some("repl");
        let result: EvaluateResult = match call_frame_id {
            Some(call_frame_id) => self
                .session
                .command(
                    "Debugger.evaluateOnCallFrame",
                    json!({
                        "callFrameId": call_frame_id,
                        "expression": args.expression,
                        "objectGroup": "repl",
                        "includeCommandLineAPI": include_command_line_api,
                        "generatePreview": true,
                    }),
                )
                .await,
            None => self
                .session
                .command(
                    "Runtime.evaluate",
                    json!({
                        "expression": args.expression,
                        "objectGroup": "repl",
                        "includeCommandLineAPI": include_command_line_api,
                        "generatePreview": true,
                    }),
                )
                .await,
        }
        .ok_or_else(|| Error::EvaluateFailed("evaluation failed".to_string()))?;

        if let Some(details) = &result.exception_details {
            return Err(Error::EvaluateFailed(details.description()));
        }

        let variable = self.variables.variable_for_object("", &result.result);
        Ok(dap::EvaluateResponseBody {
            result: variable.value,
            result_type: variable.variable_type,
            variables_reference: variable.variables_reference,
            named_variables: variable.named_variables,
            indexed_variables: variable.indexed_variables,
        })
    }

    /// Translate a runtime position to the location shown to the user
    pub fn ui_location_of_raw(&self, raw: &RawLocation) -> Option<UiLocation> {
        let script = self.script(&raw.script_id)?;
        let location = UiLocation::new(script.source.clone(), raw.line + 1, raw.column + 1);
        Some(self.sources.preferred_ui_location(location))
    }

    /// Release everything owned by this thread
    pub fn dispose(&self) {
        *self.state.lock().unwrap() = ThreadState::Disposed;
        self.variables.clear();
        self.clear_scripts();
        self.session.unsubscribe();
    }
}

/// Resolve a possibly-relative source map URL against its script's URL
fn resolve_map_url(script_url: &str, map_url: &str) -> String {
    if map_url.starts_with("data:") {
        return map_url.to_string();
    }
    if let Ok(base) = url::Url::parse(script_url) {
        if let Ok(resolved) = base.join(map_url) {
            return resolved.to_string();
        }
    }
    map_url.to_string()
}
