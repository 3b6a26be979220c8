//! Remote-object to DAP variable-tree materialization
//!
//! Every non-zero `variablesReference` handed to the client maps to a
//! handle here. References are allocated lazily while paused and the whole
//! store empties on resume.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::cdp::protocol::{EvaluateResult, GetPropertiesResult, RemoteObject};
use crate::cdp::CdpSession;
use crate::common::{Error, Result};
use crate::dap;

use super::context::AdapterContext;

#[derive(Clone)]
enum VariableHandle {
    /// A scope object of a paused call frame
    Scope { object_id: String },
    /// A plain remote object
    Object { object_id: String },
    /// A synthesized interval of a long array
    Slice {
        object_id: String,
        start: i64,
        count: i64,
    },
}

impl VariableHandle {
    fn object_id(&self) -> &str {
        match self {
            VariableHandle::Scope { object_id }
            | VariableHandle::Object { object_id }
            | VariableHandle::Slice { object_id, .. } => object_id,
        }
    }
}

pub struct VariableStore {
    context: Arc<AdapterContext>,
    session: CdpSession,
    array_chunk: usize,
    handles: Mutex<HashMap<i64, VariableHandle>>,
}

impl VariableStore {
    pub fn new(context: Arc<AdapterContext>, session: CdpSession, array_chunk: usize) -> Self {
        Self {
            context,
            session,
            array_chunk,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a reference for a remote object; leaves get 0
    pub fn create_reference(&self, object: &RemoteObject) -> i64 {
        let Some(object_id) = &object.object_id else {
            return 0;
        };
        self.insert(VariableHandle::Object {
            object_id: object_id.clone(),
        })
    }

    /// Allocate a reference for a call frame scope object
    pub fn create_scope_reference(&self, object: &RemoteObject) -> i64 {
        let Some(object_id) = &object.object_id else {
            return 0;
        };
        self.insert(VariableHandle::Scope {
            object_id: object_id.clone(),
        })
    }

    fn insert(&self, handle: VariableHandle) -> i64 {
        let reference = self.context.next_variables_reference();
        self.handles.lock().unwrap().insert(reference, handle);
        reference
    }

    /// Whether this store owns the reference
    pub fn contains(&self, reference: i64) -> bool {
        self.handles.lock().unwrap().contains_key(&reference)
    }

    /// Release every reference; called when the thread resumes
    pub fn clear(&self) {
        self.handles.lock().unwrap().clear();
    }

    /// Render a remote object as one DAP variable
    pub fn variable_for_object(&self, name: &str, object: &RemoteObject) -> dap::Variable {
        let indexed = array_length(object);
        let reference = match indexed {
            // Long arrays chunk into interval sub-containers
            Some(length) if length > self.array_chunk as i64 => {
                match &object.object_id {
                    Some(object_id) => self.insert(VariableHandle::Slice {
                        object_id: object_id.clone(),
                        start: 0,
                        count: length,
                    }),
                    None => 0,
                }
            }
            _ => self.create_reference(object),
        };

        dap::Variable {
            name: name.to_string(),
            value: render_remote_object(object),
            variable_type: Some(describe_type(object)),
            variables_reference: reference,
            named_variables: None,
            indexed_variables: indexed,
        }
    }

    /// Resolve a `variables` request
    pub async fn variables(&self, args: &dap::VariablesArguments) -> Result<Vec<dap::Variable>> {
        let handle = self
            .handles
            .lock()
            .unwrap()
            .get(&args.variables_reference)
            .cloned()
            .ok_or(Error::VariablesReferenceNotFound(args.variables_reference))?;

        match handle {
            VariableHandle::Slice {
                object_id,
                start,
                count,
            } => self.slice_variables(&object_id, start, count).await,
            VariableHandle::Scope { object_id } | VariableHandle::Object { object_id } => {
                self.object_variables(&object_id, args).await
            }
        }
    }

    async fn object_variables(
        &self,
        object_id: &str,
        args: &dap::VariablesArguments,
    ) -> Result<Vec<dap::Variable>> {
        let properties = self.get_properties(object_id).await?;

        let mut named = Vec::new();
        let mut indexed = Vec::new();
        for descriptor in &properties.result {
            if !descriptor.enumerable && descriptor.value.is_none() {
                continue;
            }
            let Some(value) = &descriptor.value else {
                continue;
            };
            let variable = self.variable_for_object(&descriptor.name, value);
            if descriptor.name.parse::<i64>().is_ok() {
                indexed.push(variable);
            } else {
                named.push(variable);
            }
        }

        // Internal properties ([[Prototype]] and friends) go last
        let mut internal = Vec::new();
        for descriptor in &properties.internal_properties {
            if let Some(value) = &descriptor.value {
                internal.push(self.variable_for_object(&descriptor.name, value));
            }
        }

        let filter = args.filter.as_deref();
        let mut out = Vec::new();
        if filter != Some("named") {
            let start = args.start.unwrap_or(0) as usize;
            let indexed_len = indexed.len();
            let count = args.count.map(|c| c as usize).unwrap_or(indexed_len);
            out.extend(indexed.into_iter().skip(start).take(count));
        }
        if filter != Some("indexed") {
            out.extend(named);
            out.extend(internal);
        }
        Ok(out)
    }

    async fn slice_variables(
        &self,
        object_id: &str,
        start: i64,
        count: i64,
    ) -> Result<Vec<dap::Variable>> {
        // Top-level slice handle: expose interval children without touching
        // the runtime
        if count > self.array_chunk as i64 {
            let mut out = Vec::new();
            let chunk = self.array_chunk as i64;
            let mut chunk_start = start;
            while chunk_start < start + count {
                let chunk_count = chunk.min(start + count - chunk_start);
                let reference = self.insert(VariableHandle::Slice {
                    object_id: object_id.to_string(),
                    start: chunk_start,
                    count: chunk_count,
                });
                out.push(dap::Variable {
                    name: format!("[{}..{}]", chunk_start, chunk_start + chunk_count - 1),
                    value: String::new(),
                    variable_type: None,
                    variables_reference: reference,
                    named_variables: None,
                    indexed_variables: Some(chunk_count),
                });
                chunk_start += chunk_count;
            }
            return Ok(out);
        }

        let properties = self.get_properties(object_id).await?;
        let mut out: Vec<(i64, dap::Variable)> = Vec::new();
        for descriptor in &properties.result {
            let Ok(index) = descriptor.name.parse::<i64>() else {
                continue;
            };
            if index < start || index >= start + count {
                continue;
            }
            let Some(value) = &descriptor.value else {
                continue;
            };
            out.push((index, self.variable_for_object(&descriptor.name, value)));
        }
        out.sort_by_key(|(index, _)| *index);
        Ok(out.into_iter().map(|(_, v)| v).collect())
    }

    async fn get_properties(&self, object_id: &str) -> Result<GetPropertiesResult> {
        self.session
            .command(
                "Runtime.getProperties",
                json!({
                    "objectId": object_id,
                    "ownProperties": true,
                    "accessorPropertiesOnly": false,
                    "generatePreview": true,
                }),
            )
            .await
            .ok_or(Error::CdpDisconnected)
    }

    /// Resolve a `setVariable` request
    ///
    /// The value is evaluated as an expression; on success the resulting
    /// remote object is assigned onto the parent through a setter function.
    /// Evaluation failures surface the runtime's error text verbatim.
    pub async fn set_variable(
        &self,
        args: &dap::SetVariableArguments,
    ) -> Result<dap::SetVariableResponseBody> {
        let handle = self
            .handles
            .lock()
            .unwrap()
            .get(&args.variables_reference)
            .cloned()
            .ok_or(Error::VariablesReferenceNotFound(args.variables_reference))?;

        let evaluated: EvaluateResult = self
            .session
            .command(
                "Runtime.evaluate",
                json!({
                    "expression": args.value,
                    "returnByValue": false,
                    "throwOnSideEffect": false,
                    "generatePreview": true,
                }),
            )
            .await
            .ok_or_else(|| Error::EvaluateFailed("evaluation failed".to_string()))?;

        if let Some(details) = &evaluated.exception_details {
            return Err(Error::EvaluateFailed(details.description()));
        }

        let value_argument = match &evaluated.result.object_id {
            Some(object_id) => json!({ "objectId": object_id }),
            None => match &evaluated.result.unserializable_value {
                Some(unserializable) => json!({ "unserializableValue": unserializable }),
                None => json!({ "value": evaluated.result.value }),
            },
        };

        let assigned: EvaluateResult = self
            .session
            .command(
                "Runtime.callFunctionOn",
                json!({
                    "objectId": handle.object_id(),
                    "functionDeclaration":
                        "function(name, value) { this[name] = value; return this[name]; }",
                    "arguments": [ { "value": args.name }, value_argument ],
                    "silent": true,
                }),
            )
            .await
            .ok_or_else(|| Error::EvaluateFailed("assignment failed".to_string()))?;

        if let Some(details) = &assigned.exception_details {
            return Err(Error::EvaluateFailed(details.description()));
        }

        Ok(dap::SetVariableResponseBody {
            value: render_remote_object(&assigned.result),
            variable_type: Some(describe_type(&assigned.result)),
            variables_reference: self.create_reference(&assigned.result),
        })
    }
}

/// Length of an array-like remote object, from its description
/// ("Array(3)") when present
fn array_length(object: &RemoteObject) -> Option<i64> {
    if object.subtype.as_deref() != Some("array") {
        return None;
    }
    let description = object.description.as_deref()?;
    let open = description.rfind('(')?;
    let close = description.rfind(')')?;
    description.get(open + 1..close)?.parse().ok()
}

/// Human-readable value for a remote object
pub fn render_remote_object(object: &RemoteObject) -> String {
    if let Some(description) = &object.description {
        return description.clone();
    }
    if let Some(unserializable) = &object.unserializable_value {
        return unserializable.clone();
    }
    match &object.value {
        Some(Value::String(s)) => format!("'{s}'"),
        Some(value) => value.to_string(),
        None => "undefined".to_string(),
    }
}

fn describe_type(object: &RemoteObject) -> String {
    match (&object.subtype, &object.class_name) {
        (Some(subtype), _) => subtype.clone(),
        (None, Some(class_name)) => class_name.clone(),
        (None, None) => object.object_type.clone(),
    }
}
