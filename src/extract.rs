//! Dotted-path access into raw provider responses.
//!
//! Responses stay untyped JSON; this module is how callers reach into them.
//!
//! ```
//! use kagi_llm::extract::extract;
//! use serde_json::json;
//!
//! let response = json!({"a": {"b": [1, 2, 3]}});
//! assert_eq!(extract(&response, "a.b.1", None).unwrap(), json!(2));
//! assert_eq!(extract(&json!({"a": 1}), "a.b", Some(json!("X"))).unwrap(), json!("X"));
//! ```

use serde_json::Value;

use crate::error::LLMError;
use crate::types::SupplierKind;

/// Walks `path` through `response`.
///
/// Segments are separated by `.`. On an object a segment is a key; on an array it must
/// parse as an index. The first segment that cannot be resolved, for whatever reason,
/// yields `default`, or [`LLMError::PathNotFound`] when no default was given. An empty
/// path returns the whole response.
pub fn extract(response: &Value, path: &str, default: Option<Value>) -> Result<Value, LLMError> {
    match lookup(response, path) {
        Some(value) => Ok(value.clone()),
        None => default.ok_or_else(|| LLMError::PathNotFound {
            path: path.to_string(),
        }),
    }
}

/// Borrowing variant of [`extract`] without the default/error contract.
pub fn lookup<'a>(response: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(response);
    }
    path.split('.').try_fold(response, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index)),
        _ => None,
    })
}

/// Like [`extract`] but renders the value as text: strings verbatim, everything else as
/// compact JSON.
pub fn extract_text(response: &Value, path: &str, default: Option<&str>) -> Result<String, LLMError> {
    match lookup(response, path) {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(other) => Ok(other.to_string()),
        None => default
            .map(str::to_string)
            .ok_or_else(|| LLMError::PathNotFound {
                path: path.to_string(),
            }),
    }
}

/// Where the assistant's answer text lives in a chat response of the given supplier.
pub fn answer_path(supplier: SupplierKind) -> &'static str {
    match supplier {
        SupplierKind::OpenAiLike => "choices.0.message.content",
        SupplierKind::AnthropicLike => "content.0.text",
        SupplierKind::Generic => "0.generated_text",
    }
}

/// Extracts the assistant's answer from a chat response.
///
/// Only a string counts as an answer. A `null` or structured value at the answer path
/// (an OpenAI refusal, a tool call) gives [`LLMError::PathNotFound`].
pub fn extract_answer(response: &Value, supplier: SupplierKind) -> Result<String, LLMError> {
    let path = answer_path(supplier);
    if supplier == SupplierKind::Generic {
        // Some inference servers answer with a bare object instead of a one-element list.
        if let Some(Value::String(text)) = lookup(response, "generated_text") {
            return Ok(text.clone());
        }
    }
    match lookup(response, path) {
        Some(Value::String(text)) => Ok(text.clone()),
        _ => Err(LLMError::PathNotFound {
            path: path.to_string(),
        }),
    }
}
