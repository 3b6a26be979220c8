//! Desired-vs-installed breakpoint reconciliation
//!
//! A Breakpoint is a user intent: pause at this source position. The
//! manager keeps that intent consistent with the breakpoints actually
//! installed in the runtime across script loads, source-map discovery and
//! concurrent set operations.
//!
//! Three installation strategies run in parallel for every breakpoint: by
//! URL regex, by predicted compiled location, and by every currently-known
//! compiled sibling location. A per-breakpoint `(url, line, column)` key
//! makes them idempotent against each other.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;

use crate::cdp::protocol::{
    BreakpointResolvedEvent, Location, SetBreakpointByUrlResult, SetBreakpointResult,
};
use crate::cdp::CdpSession;
use crate::common::Result;
use crate::dap::{self, DapSink};
use crate::sources::{RawLocation, SourceContainer, UiLocation};

use super::context::AdapterContext;
use super::predictor::BreakpointPredictor;
use super::thread::{BreakpointHitFeedback, Script, ScriptSourceMapHandler, Thread};

/// A user-intent breakpoint
pub struct Breakpoint {
    dap_id: i64,
    /// The source exactly as the client described it
    source: dap::Source,
    line: i64,
    column: Option<i64>,
    /// Final runtime condition, including any log-point rewrite
    condition: Option<String>,
    state: Mutex<BreakpointState>,
    /// Read guards are in-flight setters; `remove` takes the write side and
    /// so waits for every active setter before uninstalling
    setters: RwLock<()>,
}

#[derive(Default)]
struct BreakpointState {
    /// Runtime ids currently representing this breakpoint
    runtime_ids: Vec<(String, CdpSession)>,
    /// Installation requests already issued, the idempotence key
    requested: HashSet<(String, u32, u32)>,
    /// First verified location, 1-based
    resolved: Option<(i64, i64)>,
    hit_count: u64,
    removed: bool,
}

impl Breakpoint {
    pub fn dap_id(&self) -> i64 {
        self.dap_id
    }

    pub fn is_verified(&self) -> bool {
        self.state.lock().unwrap().resolved.is_some()
    }

    /// Runtime ids currently installed for this breakpoint
    pub fn runtime_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .runtime_ids
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn hit_count(&self) -> u64 {
        self.state.lock().unwrap().hit_count
    }

    /// DAP view of this breakpoint
    pub fn to_dap(&self) -> dap::Breakpoint {
        let state = self.state.lock().unwrap();
        dap::Breakpoint {
            id: Some(self.dap_id),
            verified: state.resolved.is_some(),
            message: None,
            source: Some(self.source.clone()),
            line: Some(state.resolved.map(|(l, _)| l).unwrap_or(self.line)),
            column: state.resolved.map(|(_, c)| c).or(self.column),
        }
    }

    /// Record an installation request; false when this location was
    /// already requested by another strategy
    fn claim_location(&self, url: &str, line: u32, column: u32) -> bool {
        self.state
            .lock()
            .unwrap()
            .requested
            .insert((url.to_string(), line, column))
    }
}

enum SourceKey {
    Path(PathBuf),
    Reference(i64),
}

#[derive(Default)]
struct Indexes {
    by_path: HashMap<PathBuf, Vec<Arc<Breakpoint>>>,
    by_reference: HashMap<i64, Vec<Arc<Breakpoint>>>,
    /// Runtime breakpoint id -> owning breakpoint, the resolver index
    by_runtime_id: HashMap<String, Arc<Breakpoint>>,
}

pub struct BreakpointManager {
    context: Arc<AdapterContext>,
    sources: Arc<SourceContainer>,
    dap: DapSink,
    predictor: Option<Arc<BreakpointPredictor>>,
    inner: Mutex<Indexes>,
}

impl BreakpointManager {
    pub fn new(
        context: Arc<AdapterContext>,
        sources: Arc<SourceContainer>,
        dap: DapSink,
        predictor: Option<Arc<BreakpointPredictor>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            context,
            sources,
            dap,
            predictor,
            inner: Mutex::new(Indexes::default()),
        })
    }

    /// Resolves once the predictor has finished scanning the workspace;
    /// the launcher awaits this so breakpoints are installed before the
    /// program's first line runs
    pub async fn launch_blocker(&self) {
        if let Some(predictor) = &self.predictor {
            predictor.prepare().await;
        }
    }

    /// Replace the breakpoint set for one source
    ///
    /// The previous list is removed first, awaiting any in-flight setters,
    /// then every new breakpoint is installed on each attached thread.
    pub async fn set_breakpoints(
        &self,
        args: &dap::SetBreakpointsArguments,
        threads: &[Arc<Thread>],
    ) -> Result<dap::SetBreakpointsResponseBody> {
        let key = source_key(&args.source)?;

        let new: Vec<Arc<Breakpoint>> = args
            .breakpoints
            .iter()
            .map(|requested| {
                Arc::new(Breakpoint {
                    dap_id: self.context.next_breakpoint_id(),
                    source: args.source.clone(),
                    line: requested.line,
                    column: requested.column,
                    condition: effective_condition(requested),
                    state: Mutex::new(BreakpointState::default()),
                    setters: RwLock::new(()),
                })
            })
            .collect();

        let old = {
            let mut inner = self.inner.lock().unwrap();
            match &key {
                SourceKey::Path(path) => inner.by_path.insert(path.clone(), new.clone()),
                SourceKey::Reference(reference) => {
                    inner.by_reference.insert(*reference, new.clone())
                }
            }
            .unwrap_or_default()
        };

        for breakpoint in old {
            self.remove_breakpoint(&breakpoint).await;
        }

        for breakpoint in &new {
            for thread in threads {
                self.apply(breakpoint, thread).await;
            }
        }

        Ok(dap::SetBreakpointsResponseBody {
            breakpoints: new.iter().map(|b| b.to_dap()).collect(),
        })
    }

    /// Install every breakpoint currently known onto a newly-attached
    /// thread
    pub async fn apply_to_thread(&self, thread: &Arc<Thread>) {
        let breakpoints: Vec<Arc<Breakpoint>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .by_path
                .values()
                .chain(inner.by_reference.values())
                .flatten()
                .cloned()
                .collect()
        };
        for breakpoint in breakpoints {
            self.apply(&breakpoint, thread).await;
        }
    }

    /// Uninstall a breakpoint from the runtime
    pub async fn remove_breakpoint(&self, breakpoint: &Arc<Breakpoint>) {
        breakpoint.state.lock().unwrap().removed = true;

        // Wait out every in-flight setter before touching the runtime
        let _exclusive = breakpoint.setters.write().await;

        let runtime_ids = std::mem::take(&mut breakpoint.state.lock().unwrap().runtime_ids);
        for (runtime_id, session) in runtime_ids {
            if self
                .inner
                .lock()
                .unwrap()
                .by_runtime_id
                .remove(&runtime_id)
                .is_none()
            {
                // A double-remove race in the runtime is harmless; note it
                // and move on.
                tracing::warn!(id = %runtime_id, "removing unknown runtime breakpoint id");
            }
            session
                .request(
                    "Debugger.removeBreakpoint",
                    json!({ "breakpointId": runtime_id }),
                )
                .await;
        }
    }

    /// Run the three installation strategies for one breakpoint on one
    /// thread
    async fn apply(&self, breakpoint: &Arc<Breakpoint>, thread: &Arc<Thread>) {
        let _setter = breakpoint.setters.read().await;
        if breakpoint.state.lock().unwrap().removed {
            return;
        }

        tokio::join!(
            self.set_by_url(breakpoint, thread),
            self.set_predicted(breakpoint, thread),
            self.set_by_sibling(breakpoint, thread),
        );
    }

    /// Strategy 1: install by URL regex so the breakpoint also binds to
    /// scripts that load later
    async fn set_by_url(&self, breakpoint: &Arc<Breakpoint>, thread: &Arc<Thread>) {
        let url = match breakpoint.source.path.as_deref() {
            Some(path) => self
                .sources
                .resolver()
                .absolute_path_to_url(std::path::Path::new(path)),
            None => None,
        };
        let Some(url) = url else { return };

        let (line, column) = self.raw_position(breakpoint, thread);
        if !breakpoint.claim_location(&url, line, column) {
            return;
        }

        let result: Option<SetBreakpointByUrlResult> = thread
            .session()
            .command(
                "Debugger.setBreakpointByUrl",
                json!({
                    "urlRegex": url_to_regex(&url),
                    "lineNumber": line,
                    "columnNumber": column,
                    "condition": breakpoint.condition.clone().unwrap_or_default(),
                }),
            )
            .await;

        if let Some(result) = result {
            self.register_runtime_id(breakpoint, thread, &result.breakpoint_id);
            if let Some(location) = result.locations.first() {
                self.resolve(breakpoint, thread, location);
            }
        }
    }

    /// Strategy 2: install at locations predicted from workspace source
    /// maps, reaching scripts whose maps have not been seen yet
    async fn set_predicted(&self, breakpoint: &Arc<Breakpoint>, thread: &Arc<Thread>) {
        let Some(predictor) = &self.predictor else { return };
        let Some(path) = breakpoint.source.path.as_deref() else {
            return;
        };

        let (line, column) = self.raw_position(breakpoint, thread);
        let predicted = predictor
            .predicted_resolved_locations(std::path::Path::new(path), line, column)
            .await;

        for location in predicted {
            if !breakpoint.claim_location(&location.compiled_url, location.line, location.column) {
                continue;
            }
            let result: Option<SetBreakpointByUrlResult> = thread
                .session()
                .command(
                    "Debugger.setBreakpointByUrl",
                    json!({
                        "urlRegex": url_to_regex(&location.compiled_url),
                        "lineNumber": location.line,
                        "columnNumber": location.column,
                        "condition": breakpoint.condition.clone().unwrap_or_default(),
                    }),
                )
                .await;
            if let Some(result) = result {
                self.register_runtime_id(breakpoint, thread, &result.breakpoint_id);
                if let Some(resolved) = result.locations.first() {
                    self.resolve(breakpoint, thread, resolved);
                }
            }
        }
    }

    /// Strategy 3: install by script id at every currently-known compiled
    /// sibling of the requested location
    async fn set_by_sibling(&self, breakpoint: &Arc<Breakpoint>, thread: &Arc<Thread>) {
        let Some(requested) = self.requested_ui_location(breakpoint) else {
            return;
        };

        let compiled = self
            .sources
            .current_sibling_ui_locations(&requested, None)
            .into_iter()
            .filter(|l| !l.source.is_authored())
            .collect::<Vec<_>>();

        for location in compiled {
            self.set_at_compiled_location(breakpoint, thread, &location, None)
                .await;
        }
    }

    /// Source-map-driven update: a new script resolved authored sources,
    /// re-install every breakpoint of those sources by script id
    ///
    /// Returns true when a resolved location lands at line/column <= 1, in
    /// which case the thread should stay paused so the user sees the stop.
    async fn update_for_source_map(
        &self,
        thread: &Arc<Thread>,
        script: &Arc<Script>,
    ) -> bool {
        let authored = self.sources.authored_siblings(&script.source);
        let mut remain_paused = false;

        for source in authored {
            let breakpoints: Vec<Arc<Breakpoint>> = {
                let inner = self.inner.lock().unwrap();
                let mut found = Vec::new();
                if let Some(path) = source.absolute_path() {
                    if let Some(list) = inner.by_path.get(path) {
                        found.extend(list.iter().cloned());
                    }
                }
                if let Some(list) = inner.by_reference.get(&source.reference()) {
                    found.extend(list.iter().cloned());
                }
                found
            };

            for breakpoint in breakpoints {
                let _setter = breakpoint.setters.read().await;
                if breakpoint.state.lock().unwrap().removed {
                    continue;
                }

                let requested = UiLocation::new(
                    source.clone(),
                    breakpoint.line.max(1) as u32,
                    breakpoint.column.unwrap_or(1).max(1) as u32,
                );
                let locations = self
                    .sources
                    .current_sibling_ui_locations(&requested, Some(&script.source));
                for location in locations {
                    let resolved = self
                        .set_at_compiled_location(
                            &breakpoint,
                            thread,
                            &location,
                            Some(&script.script_id),
                        )
                        .await;
                    if let Some((line, column)) = resolved {
                        if line <= 1 && column <= 1 {
                            remain_paused = true;
                        }
                    }
                }
            }
        }

        remain_paused
    }

    /// Install by script id at one compiled location; returns the resolved
    /// 1-based position if the runtime reported one
    async fn set_at_compiled_location(
        &self,
        breakpoint: &Arc<Breakpoint>,
        thread: &Arc<Thread>,
        location: &UiLocation,
        only_script_id: Option<&str>,
    ) -> Option<(i64, i64)> {
        let mut resolved = None;
        for raw in self.sources.raw_locations(location) {
            if let Some(only) = only_script_id {
                if raw.script_id != only {
                    continue;
                }
            }
            let (line, column) =
                apply_script_offset(raw.line, raw.column, thread.default_script_offset());
            if !breakpoint.claim_location(location.source.url(), line, column) {
                continue;
            }

            let result: Option<SetBreakpointResult> = thread
                .session()
                .command(
                    "Debugger.setBreakpoint",
                    json!({
                        "location": {
                            "scriptId": raw.script_id,
                            "lineNumber": line,
                            "columnNumber": column,
                        },
                        "condition": breakpoint.condition.clone().unwrap_or_default(),
                    }),
                )
                .await;

            if let Some(result) = result {
                self.register_runtime_id(breakpoint, thread, &result.breakpoint_id);
                resolved = self.resolve(breakpoint, thread, &result.actual_location);
            }
        }
        resolved
    }

    fn register_runtime_id(
        &self,
        breakpoint: &Arc<Breakpoint>,
        thread: &Arc<Thread>,
        runtime_id: &str,
    ) {
        breakpoint
            .state
            .lock()
            .unwrap()
            .runtime_ids
            .push((runtime_id.to_string(), thread.session().clone()));
        self.inner
            .lock()
            .unwrap()
            .by_runtime_id
            .insert(runtime_id.to_string(), breakpoint.clone());
    }

    /// Record a resolved runtime location; the first one verifies the
    /// breakpoint and notifies the client
    fn resolve(
        &self,
        breakpoint: &Arc<Breakpoint>,
        thread: &Arc<Thread>,
        location: &Location,
    ) -> Option<(i64, i64)> {
        let raw = RawLocation {
            script_id: location.script_id.clone(),
            line: location.line_number,
            column: location.column_number.unwrap_or(0),
        };
        let ui_location = thread.ui_location_of_raw(&raw)?;
        let position = (ui_location.line as i64, ui_location.column as i64);

        let newly_verified = {
            let mut state = breakpoint.state.lock().unwrap();
            if state.resolved.is_none() {
                state.resolved = Some(position);
                true
            } else {
                false
            }
        };

        if newly_verified {
            self.dap
                .send_event(dap::Event::Breakpoint(dap::BreakpointEventBody {
                    reason: "changed".to_string(),
                    breakpoint: breakpoint.to_dap(),
                }));
        }
        Some(position)
    }

    /// The runtime confirmed a pending URL breakpoint against a script
    pub fn on_breakpoint_resolved(&self, thread: &Arc<Thread>, event: &BreakpointResolvedEvent) {
        let breakpoint = self
            .inner
            .lock()
            .unwrap()
            .by_runtime_id
            .get(&event.breakpoint_id)
            .cloned();
        match breakpoint {
            Some(breakpoint) => {
                self.resolve(&breakpoint, thread, &event.location);
            }
            None => {
                tracing::debug!(id = %event.breakpoint_id, "resolution for unknown breakpoint")
            }
        }
    }

    /// The requested location as a UiLocation in a registered source
    fn requested_ui_location(&self, breakpoint: &Arc<Breakpoint>) -> Option<UiLocation> {
        let source = self.sources.source_for_dap(&breakpoint.source)?;
        Some(UiLocation::new(
            source,
            breakpoint.line.max(1) as u32,
            breakpoint.column.unwrap_or(1).max(1) as u32,
        ))
    }

    /// DAP 1-based position converted to the runtime's 0-based coordinates
    fn raw_position(&self, breakpoint: &Arc<Breakpoint>, thread: &Arc<Thread>) -> (u32, u32) {
        let line = (breakpoint.line.max(1) - 1) as u32;
        let column = (breakpoint.column.unwrap_or(1).max(1) - 1) as u32;
        apply_script_offset(line, column, thread.default_script_offset())
    }
}

#[async_trait]
impl ScriptSourceMapHandler for BreakpointManager {
    async fn source_map_loaded(&self, thread: &Arc<Thread>, script: &Arc<Script>) -> bool {
        self.update_for_source_map(thread, script).await
    }
}

impl BreakpointHitFeedback for BreakpointManager {
    fn breakpoints_hit(&self, runtime_ids: &[String]) -> Vec<i64> {
        let inner = self.inner.lock().unwrap();
        let mut dap_ids = Vec::new();
        for runtime_id in runtime_ids {
            if let Some(breakpoint) = inner.by_runtime_id.get(runtime_id) {
                breakpoint.state.lock().unwrap().hit_count += 1;
                if !dap_ids.contains(&breakpoint.dap_id) {
                    dap_ids.push(breakpoint.dap_id);
                }
            }
        }
        dap_ids
    }
}

fn source_key(source: &dap::Source) -> Result<SourceKey> {
    if let Some(path) = &source.path {
        return Ok(SourceKey::Path(PathBuf::from(path)));
    }
    if let Some(reference) = source.source_reference.filter(|&r| r > 0) {
        return Ok(SourceKey::Reference(reference));
    }
    Err(crate::common::Error::DapProtocol(
        "setBreakpoints source has neither path nor sourceReference".to_string(),
    ))
}

/// Subtract the wrapper offset on the way down to the runtime
fn apply_script_offset(line: u32, column: u32, offset: Option<(u32, u32)>) -> (u32, u32) {
    match offset {
        Some((line_offset, column_offset)) => {
            let adjusted_line = line.saturating_sub(line_offset);
            let adjusted_column = if line <= line_offset {
                column.saturating_sub(column_offset)
            } else {
                column
            };
            (adjusted_line, adjusted_column)
        }
        None => (line, column),
    }
}

/// Case-insensitive fullmatch regex for a script URL
///
/// Escapes RE metacharacters and widens letters into character classes so
/// `file:` vs `/` normalization and case differences cannot miss.
fn url_to_regex(url: &str) -> String {
    let mut out = String::with_capacity(url.len() * 2);
    for c in url.chars() {
        match c {
            'a'..='z' => {
                out.push('[');
                out.push(c);
                out.push(c.to_ascii_uppercase());
                out.push(']');
            }
            'A'..='Z' => {
                out.push('[');
                out.push(c.to_ascii_lowercase());
                out.push(c);
                out.push(']');
            }
            '.' | '*' | '+' | '?' | '^' | '$' | '{' | '}' | '(' | ')' | '|' | '[' | ']'
            | '\\' | '/' => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

/// Rewrite a log message into a breakpoint condition that emits the
/// message and stays falsy
///
/// `{expr}` interpolations become template-literal substitutions.
fn log_message_expression(log_message: &str) -> String {
    let mut template = String::with_capacity(log_message.len() + 8);
    let mut chars = log_message.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => {
                let mut expression = String::new();
                let mut depth = 1;
                for inner in chars.by_ref() {
                    match inner {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    expression.push(inner);
                }
                template.push_str("${");
                template.push_str(&expression);
                template.push('}');
            }
            '`' => template.push_str("\\`"),
            '\\' => template.push_str("\\\\"),
            c => template.push(c),
        }
    }
    format!("console.log(`{template}`)\n//# sourceURL=logpoint.cdp")
}

/// The condition actually installed in the runtime
fn effective_condition(requested: &dap::SourceBreakpoint) -> Option<String> {
    let log = requested
        .log_message
        .as_deref()
        .filter(|m| !m.is_empty())
        .map(log_message_expression);
    match (&requested.condition, log) {
        (Some(condition), Some(log)) if !condition.is_empty() => {
            Some(format!("({condition}) && ({log})"))
        }
        (_, Some(log)) => Some(log),
        (Some(condition), None) if !condition.is_empty() => Some(condition.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_regex_is_case_insensitive_fullmatch() {
        let regex = url_to_regex("file:///App.JS");
        assert_eq!(
            regex,
            "[fF][iI][lL][eE]:\\/\\/\\/[aA][pP][pP]\\.[jJ][sS]"
        );
    }

    #[test]
    fn log_messages_become_falsy_console_calls() {
        let expression = log_message_expression("count is {i + 1}");
        assert_eq!(
            expression,
            "console.log(`count is ${i + 1}`)\n//# sourceURL=logpoint.cdp"
        );
    }

    #[test]
    fn conditions_combine_with_log_messages() {
        let condition = effective_condition(&dap::SourceBreakpoint {
            line: 1,
            column: None,
            condition: Some("x > 2".to_string()),
            hit_condition: None,
            log_message: Some("x={x}".to_string()),
        })
        .unwrap();
        assert!(condition.starts_with("(x > 2) && (console.log(`x=${x}`)"));
        assert!(condition.contains("//# sourceURL=logpoint.cdp"));
    }

    #[test]
    fn script_offset_applies_only_to_wrapped_lines() {
        let offset = Some((0, 62));
        assert_eq!(apply_script_offset(0, 10, offset), (0, 0));
        assert_eq!(apply_script_offset(0, 70, offset), (0, 8));
        assert_eq!(apply_script_offset(3, 10, offset), (3, 10));
        assert_eq!(apply_script_offset(3, 10, None), (3, 10));
    }
}
