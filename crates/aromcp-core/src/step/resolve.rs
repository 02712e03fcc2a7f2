//! Value resolution for step parameters and state updates.
//!
//! A configured value may be:
//! - a reserved source token (`stdout`, `stderr`, `returncode`,
//!   `full_output`, `success`, `errors`) bound to the previous step's
//!   result,
//! - a template string (a lone `{{ expr }}` region yields the evaluated
//!   value with its type preserved; mixed text renders to a string),
//! - any other JSON literal, resolved recursively through objects and
//!   arrays.

use serde_json::{Map, Value};

use crate::expression::ExpressionCache;
use crate::template::{self, TemplateError};

/// Reserved tokens bound to the immediately preceding step's result.
const SOURCE_TOKENS: &[&str] = &[
    "stdout",
    "stderr",
    "returncode",
    "full_output",
    "success",
    "errors",
];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("source token '{token}' has no preceding step result")]
    NoSourceResult { token: String },
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve one configured value against the evaluation scope.
pub fn resolve_value(
    value: &Value,
    scope: &Map<String, Value>,
    cache: &ExpressionCache,
    last_result: Option<&Value>,
) -> Result<Value, ResolveError> {
    match value {
        Value::String(s) => resolve_string(s, scope, cache, last_result),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, scope, cache, last_result))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                resolve_value(v, scope, cache, last_result).map(|v| (k.clone(), v))
            })
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn resolve_string(
    s: &str,
    scope: &Map<String, Value>,
    cache: &ExpressionCache,
    last_result: Option<&Value>,
) -> Result<Value, ResolveError> {
    // Reserved source tokens
    if SOURCE_TOKENS.contains(&s) {
        let result = last_result.ok_or_else(|| ResolveError::NoSourceResult {
            token: s.to_string(),
        })?;
        return Ok(match s {
            "full_output" => result
                .get("full_output")
                .cloned()
                .unwrap_or_else(|| result.clone()),
            token => result.get(token).cloned().unwrap_or(Value::Null),
        });
    }

    // A lone `{{ expr }}` region yields the value itself, type preserved
    let trimmed = s.trim();
    if let Some(inner) = lone_region(trimmed) {
        let mut resolved = Map::new();
        let rendered =
            template::render_tracked(trimmed, scope, cache, &mut resolved)?;
        return Ok(match resolved.remove(inner.trim()) {
            Some(value) => value,
            // Pure lookup of a missing identifier rendered empty
            None => Value::String(rendered),
        });
    }

    // Mixed text: template-render to a string
    Ok(Value::String(template::render(s, scope, cache)?))
}

/// `Some(inner)` when the string is exactly one `{{ ... }}` region.
fn lone_region(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
