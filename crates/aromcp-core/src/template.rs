//! `{{ expression }}` template substitution over step fields.
//!
//! Each `{{ ... }}` region is evaluated with the expression evaluator and
//! replaced by the string rendering of its value. A missing identifier in a
//! pure lookup renders the empty string; every other evaluation failure is a
//! `TemplateError` carrying the byte position of the region.
//!
//! Literal braces are written with the escape pair `\{\{` and `\}\}`.

use serde_json::{Map, Value};

use crate::expression::{self, ErrorKind, EvaluationError, ExpressionCache};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A template failed to render.
#[derive(Debug, Clone, thiserror::Error)]
#[error("template error at byte {position}: {cause}")]
pub struct TemplateError {
    /// Byte offset of the failing `{{` in the template.
    pub position: usize,
    #[source]
    pub cause: EvaluationError,
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Substitute every `{{ expr }}` region in `template` against `scope`.
pub fn render(
    template: &str,
    scope: &Map<String, Value>,
    cache: &ExpressionCache,
) -> Result<String, TemplateError> {
    render_tracked(template, scope, cache, &mut Map::new())
}

/// Like [`render`], additionally recording each evaluated expression and its
/// value into `resolved` (used to build the step payload context).
pub fn render_tracked(
    template: &str,
    scope: &Map<String, Value>,
    cache: &ExpressionCache,
    resolved: &mut Map<String, Value>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        // Escape pairs for literal braces
        if bytes[i..].starts_with(b"\\{\\{") {
            out.push_str("{{");
            i += 4;
            continue;
        }
        if bytes[i..].starts_with(b"\\}\\}") {
            out.push_str("}}");
            i += 4;
            continue;
        }
        if bytes[i..].starts_with(b"{{") {
            let open = i;
            let Some(rel_close) = template[open + 2..].find("}}") else {
                // No closing marker: emit the rest verbatim
                out.push_str(&template[open..]);
                break;
            };
            let close = open + 2 + rel_close;
            let source = template[open + 2..close].trim();

            let value = evaluate_region(source, scope, cache).map_err(|cause| TemplateError {
                position: open,
                cause,
            })?;
            if let Some(value) = &value {
                resolved.insert(source.to_string(), value.clone());
            }
            out.push_str(&render_value(value.as_ref()));
            i = close + 2;
            continue;
        }

        let ch = template[i..].chars().next().unwrap_or('\u{FFFD}');
        out.push(ch);
        i += ch.len_utf8();
    }

    Ok(out)
}

/// Evaluate one region. `Ok(None)` means a missing identifier in a pure
/// lookup, which renders as the empty string.
fn evaluate_region(
    source: &str,
    scope: &Map<String, Value>,
    cache: &ExpressionCache,
) -> Result<Option<Value>, EvaluationError> {
    let program = cache.compile(source)?;
    match program.evaluate(scope) {
        Ok(value) => Ok(Some(value)),
        Err(err)
            if err.kind == ErrorKind::UnknownIdentifier && program.is_pure_lookup() =>
        {
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn render_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(v) => expression::render_for_template(v),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
