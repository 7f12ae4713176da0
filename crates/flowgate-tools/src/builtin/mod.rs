pub mod evidence;
pub mod graph;
pub mod lifecycle;

use serde::de::DeserializeOwned;
use serde::Serialize;

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::types::ToolResult;
use flowgate_workflow::NotReady;

/// Deserialize tool input, reporting problems as validation errors.
pub(crate) fn parse_input<T: DeserializeOwned>(input: serde_json::Value) -> Result<T> {
    serde_json::from_value(input).map_err(|e| FlowgateError::ToolValidation(e.to_string()))
}

pub(crate) fn success<T: Serialize>(value: &T) -> Result<ToolResult> {
    Ok(ToolResult::success(serde_json::to_value(value)?))
}

/// Serialize `value` and tag it with `"outcome": outcome`.
pub(crate) fn tagged<T: Serialize>(outcome: &str, value: &T) -> Result<serde_json::Value> {
    let mut content = serde_json::to_value(value)?;
    if let Some(obj) = content.as_object_mut() {
        obj.insert("outcome".into(), outcome.into());
    }
    Ok(content)
}

/// Ineligible node: a recoverable error result, not an `Err`.
pub(crate) fn not_ready(not_ready: &NotReady) -> Result<ToolResult> {
    Ok(ToolResult::error(tagged("not_ready", not_ready)?))
}
