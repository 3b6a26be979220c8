//! Typed CDP domain messages
//!
//! Strict variants for the Target, Debugger and Runtime traffic the adapter
//! relies on. Fields we do not consume are left out; serde ignores unknown
//! fields on the way in, so forward-compatible payloads pass through.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// === Runtime domain ===

/// Mirror of Runtime.RemoteObject
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    #[serde(rename = "type", default)]
    pub object_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unserializable_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

/// Mirror of Runtime.PropertyDescriptor
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(default)]
    pub value: Option<RemoteObject>,
    #[serde(default)]
    pub writable: Option<bool>,
    #[serde(default)]
    pub get: Option<RemoteObject>,
    #[serde(default)]
    pub set: Option<RemoteObject>,
    #[serde(default)]
    pub enumerable: bool,
    #[serde(default)]
    pub is_own: bool,
    #[serde(default)]
    pub was_thrown: bool,
}

/// Mirror of Runtime.InternalPropertyDescriptor
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalPropertyDescriptor {
    pub name: String,
    #[serde(default)]
    pub value: Option<RemoteObject>,
}

/// Mirror of Runtime.ExceptionDetails
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    pub text: String,
    pub line_number: u32,
    pub column_number: u32,
    #[serde(default)]
    pub script_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub exception: Option<RemoteObject>,
}

impl ExceptionDetails {
    /// The message shown to the user, preferring the thrown value's own
    /// description
    pub fn description(&self) -> String {
        self.exception
            .as_ref()
            .and_then(|e| e.description.clone())
            .unwrap_or_else(|| self.text.clone())
    }
}

/// Result of Runtime.evaluate / Runtime.callFunctionOn /
/// Debugger.evaluateOnCallFrame
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    pub result: RemoteObject,
    #[serde(default)]
    pub exception_details: Option<ExceptionDetails>,
}

/// Result of Runtime.getProperties
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPropertiesResult {
    #[serde(default)]
    pub result: Vec<PropertyDescriptor>,
    #[serde(default)]
    pub internal_properties: Vec<InternalPropertyDescriptor>,
    #[serde(default)]
    pub exception_details: Option<ExceptionDetails>,
}

/// One frame of a Runtime.StackTrace
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeCallFrame {
    pub function_name: String,
    pub script_id: String,
    pub url: String,
    pub line_number: u32,
    pub column_number: u32,
}

/// Mirror of Runtime.StackTraceId
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceId {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debugger_id: Option<String>,
}

/// Mirror of Runtime.StackTrace: an async parent chain
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStackTrace {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub call_frames: Vec<RuntimeCallFrame>,
    #[serde(default)]
    pub parent: Option<Box<RuntimeStackTrace>>,
    #[serde(default)]
    pub parent_id: Option<StackTraceId>,
}

/// Params of Runtime.consoleAPICalled
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleApiCalledEvent {
    #[serde(rename = "type", default)]
    pub call_type: String,
    #[serde(default)]
    pub args: Vec<RemoteObject>,
    #[serde(default)]
    pub stack_trace: Option<RuntimeStackTrace>,
}

/// Params of Runtime.exceptionThrown
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionThrownEvent {
    pub exception_details: ExceptionDetails,
}

/// Params of Runtime.executionContextDestroyed
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextDestroyedEvent {
    pub execution_context_id: i64,
}

// === Debugger domain ===

/// Mirror of Debugger.Location, 0-based
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub script_id: String,
    pub line_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_number: Option<u32>,
}

/// Mirror of Debugger.Scope
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebuggerScope {
    #[serde(rename = "type")]
    pub scope_type: String,
    pub object: RemoteObject,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub start_location: Option<Location>,
    #[serde(default)]
    pub end_location: Option<Location>,
}

/// Mirror of Debugger.CallFrame
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    pub call_frame_id: String,
    pub function_name: String,
    pub location: Location,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub scope_chain: Vec<DebuggerScope>,
    #[serde(default)]
    pub this: Option<RemoteObject>,
}

/// Params of Debugger.scriptParsed
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptParsedEvent {
    pub script_id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub start_line: u32,
    #[serde(default)]
    pub start_column: u32,
    #[serde(default)]
    pub execution_context_id: i64,
    #[serde(default)]
    pub hash: String,
    #[serde(rename = "sourceMapURL", default)]
    pub source_map_url: Option<String>,
}

/// Params of Debugger.paused
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedEvent {
    #[serde(default)]
    pub call_frames: Vec<CallFrame>,
    pub reason: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub hit_breakpoints: Vec<String>,
    #[serde(default)]
    pub async_stack_trace: Option<RuntimeStackTrace>,
    #[serde(default)]
    pub async_stack_trace_id: Option<StackTraceId>,
}

/// Params of Debugger.breakpointResolved
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointResolvedEvent {
    pub breakpoint_id: String,
    pub location: Location,
}

/// Result of Debugger.setBreakpointByUrl
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointByUrlResult {
    pub breakpoint_id: String,
    #[serde(default)]
    pub locations: Vec<Location>,
}

/// Result of Debugger.setBreakpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointResult {
    pub breakpoint_id: String,
    pub actual_location: Location,
}

/// Result of Debugger.getStackTrace
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetStackTraceResult {
    pub stack_trace: RuntimeStackTrace,
}

/// Result of Debugger.getScriptSource
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetScriptSourceResult {
    pub script_source: String,
}

/// Result of Debugger.getPossibleBreakpoints
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPossibleBreakpointsResult {
    #[serde(default)]
    pub locations: Vec<BreakLocation>,
}

/// Mirror of Debugger.BreakLocation
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakLocation {
    pub script_id: String,
    pub line_number: u32,
    #[serde(default)]
    pub column_number: Option<u32>,
}

// === Target domain ===

/// Mirror of Target.TargetInfo
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attached: bool,
}

/// Params of Target.attachedToTarget
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedToTargetEvent {
    pub session_id: String,
    pub target_info: TargetInfo,
    #[serde(default)]
    pub waiting_for_debugger: bool,
}

/// Params of Target.detachedFromTarget
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedFromTargetEvent {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
}
