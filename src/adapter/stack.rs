//! Lazy async-linked call stacks
//!
//! A pause carries its synchronous frames and, optionally, an async parent
//! chain. Inline chains are materialized eagerly; a trailing continuation
//! token defers further ancestors to `Debugger.getStackTrace`, fetched only
//! when the client asks for more frames than are already materialized.
//! Frames keep their ids until the owning thread resumes.

use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::cdp::protocol::{
    CallFrame, DebuggerScope, GetStackTraceResult, PausedEvent, RuntimeCallFrame,
    RuntimeStackTrace, StackTraceId,
};
use crate::dap;
use crate::sources::{RawLocation, UiLocation};

use super::thread::Thread;

/// One materialized stack frame
pub struct StackFrame {
    pub id: i64,
    pub name: String,
    pub raw_location: Option<RawLocation>,
    pub ui_location: Option<UiLocation>,
    /// Present on synchronous frames; enables scopes and frame evaluation
    pub call_frame_id: Option<String>,
    pub scope_chain: Vec<DebuggerScope>,
    pub is_async_separator: bool,
    pub skipped: bool,
}

impl StackFrame {
    pub fn to_dap(&self) -> dap::StackFrame {
        let (source, line, column) = match &self.ui_location {
            Some(location) => (
                Some(location.source.to_dap()),
                location.line as i64,
                location.column as i64,
            ),
            None => (None, 1, 1),
        };

        let presentation_hint = if self.is_async_separator {
            Some("label".to_string())
        } else if self.skipped {
            Some("subtle".to_string())
        } else {
            None
        };

        dap::StackFrame {
            id: self.id,
            name: self.name.clone(),
            source,
            line,
            column,
            presentation_hint,
        }
    }
}

/// A pause's call stack
pub struct StackTrace {
    frames: Mutex<Vec<Arc<StackFrame>>>,
    parent_id: Mutex<Option<StackTraceId>>,
}

impl StackTrace {
    /// Build from the frames a `Debugger.paused` event carries
    pub fn from_pause(thread: &Thread, event: &PausedEvent) -> Arc<StackTrace> {
        let mut frames = Vec::new();
        for call_frame in &event.call_frames {
            frames.push(sync_frame(thread, call_frame));
        }

        let mut parent_id = event.async_stack_trace_id.clone();
        if let Some(chain) = &event.async_stack_trace {
            parent_id = append_chain(thread, &mut frames, chain);
        }

        Arc::new(StackTrace {
            frames: Mutex::new(frames),
            parent_id: Mutex::new(parent_id),
        })
    }

    /// Frames materialized so far
    pub fn materialized(&self) -> Vec<Arc<StackFrame>> {
        self.frames.lock().unwrap().clone()
    }

    /// Whether a deferred parent chain remains
    pub fn has_more(&self) -> bool {
        self.parent_id.lock().unwrap().is_some()
    }

    pub fn frame_by_id(&self, id: i64) -> Option<Arc<StackFrame>> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.id == id)
            .cloned()
    }

    /// Ensure at least `limit` frames are materialized, following the
    /// continuation token as needed
    pub async fn frames(&self, thread: &Thread, limit: usize) -> Vec<Arc<StackFrame>> {
        loop {
            let materialized = self.frames.lock().unwrap().len();
            let parent = self.parent_id.lock().unwrap().clone();
            let Some(parent) = parent else { break };
            if materialized >= limit {
                break;
            }

            let result: Option<GetStackTraceResult> = thread
                .session()
                .command("Debugger.getStackTrace", json!({ "stackTraceId": parent }))
                .await;

            match result {
                Some(result) => {
                    let mut fetched = Vec::new();
                    let next = append_chain(thread, &mut fetched, &result.stack_trace);
                    self.frames.lock().unwrap().extend(fetched);
                    *self.parent_id.lock().unwrap() = next;
                }
                None => {
                    // Session gone or id expired: stop following the chain
                    *self.parent_id.lock().unwrap() = None;
                }
            }
        }

        self.materialized()
    }
}

/// Append an async chain and its eagerly-inlined parents; returns the
/// trailing continuation token, if any
fn append_chain(
    thread: &Thread,
    frames: &mut Vec<Arc<StackFrame>>,
    chain: &RuntimeStackTrace,
) -> Option<StackTraceId> {
    let mut current = chain;
    loop {
        frames.push(separator_frame(thread, current.description.as_deref()));

        let mut call_frames: &[RuntimeCallFrame] = &current.call_frames;
        // Consecutive "async function" chains repeat the continuation's own
        // frame; drop it to avoid duplicate entries.
        if current.description.as_deref() == Some("async function") && !call_frames.is_empty() {
            call_frames = &call_frames[1..];
        }
        for call_frame in call_frames {
            frames.push(async_frame(thread, call_frame));
        }

        match &current.parent {
            Some(parent) => current = parent,
            None => return current.parent_id.clone(),
        }
    }
}

fn sync_frame(thread: &Thread, call_frame: &CallFrame) -> Arc<StackFrame> {
    let raw = RawLocation {
        script_id: call_frame.location.script_id.clone(),
        line: call_frame.location.line_number,
        column: call_frame.location.column_number.unwrap_or(0),
    };
    let ui_location = thread.ui_location_of_raw(&raw);

    let name = if call_frame.function_name.is_empty() {
        "(anonymous)".to_string()
    } else {
        call_frame.function_name.clone()
    };

    Arc::new(StackFrame {
        id: thread.context().next_frame_id(),
        name,
        skipped: thread.skipper().is_skipped(&call_frame.url),
        raw_location: Some(raw),
        ui_location,
        call_frame_id: Some(call_frame.call_frame_id.clone()),
        scope_chain: call_frame.scope_chain.clone(),
        is_async_separator: false,
    })
}

fn async_frame(thread: &Thread, call_frame: &RuntimeCallFrame) -> Arc<StackFrame> {
    let raw = RawLocation {
        script_id: call_frame.script_id.clone(),
        line: call_frame.line_number,
        column: call_frame.column_number,
    };
    let ui_location = thread.ui_location_of_raw(&raw);

    let name = if call_frame.function_name.is_empty() {
        "(anonymous)".to_string()
    } else {
        call_frame.function_name.clone()
    };

    Arc::new(StackFrame {
        id: thread.context().next_frame_id(),
        name,
        skipped: thread.skipper().is_skipped(&call_frame.url),
        raw_location: Some(raw),
        ui_location,
        call_frame_id: None,
        scope_chain: Vec::new(),
        is_async_separator: false,
    })
}

fn separator_frame(thread: &Thread, description: Option<&str>) -> Arc<StackFrame> {
    Arc::new(StackFrame {
        id: thread.context().next_frame_id(),
        name: description.unwrap_or("async").to_string(),
        raw_location: None,
        ui_location: None,
        call_frame_id: None,
        scope_chain: Vec::new(),
        is_async_separator: true,
        skipped: false,
    })
}
