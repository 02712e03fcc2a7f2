//! boa-backed evaluation.
//!
//! Each call builds a throwaway `boa_engine::Context`, injects the scope map
//! as global properties (the same injection pattern the engine's JS
//! embeddings in the wild use for their globals), sets the engine's runtime
//! limits, and evaluates the expression wrapped in parentheses so `{ ... }`
//! parses as an object literal rather than a block. Results convert back to
//! JSON with numbers normalized.
//!
//! `this` in sloppy-mode script code is the global object, and the flattened
//! scope registers every bare name alongside the namespace objects, so
//! `this.doubled` and `doubled` resolve to the same value by construction.

use std::time::Instant;

use boa_engine::property::Attribute;
use boa_engine::{Context, JsError, JsString, JsValue, Source};
use serde_json::{Map, Value};

use super::{number_value, ErrorKind, EvalOptions, EvaluationError};

/// Backstop on engine-internal iteration (builtins, method callbacks);
/// workflow expressions cannot write loops themselves.
const LOOP_ITERATION_BACKSTOP: u64 = 100_000;

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

pub(super) fn evaluate(
    source: &str,
    scope: &Map<String, Value>,
    options: &EvalOptions,
) -> Result<Value, EvaluationError> {
    let started = Instant::now();

    let mut context = Context::default();
    context.runtime_limits_mut().set_recursion_limit(options.max_depth);
    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(LOOP_ITERATION_BACKSTOP);

    for (key, value) in scope {
        let js_value = JsValue::from_json(value, &mut context).map_err(|err| {
            EvaluationError::new(
                ErrorKind::TypeError,
                0,
                format!("cannot inject scope value '{key}': {err}"),
            )
        })?;
        context
            .register_global_property(JsString::from(key.as_str()), js_value, Attribute::all())
            .map_err(|err| {
                EvaluationError::new(
                    ErrorKind::TypeError,
                    0,
                    format!("cannot register scope name '{key}': {err}"),
                )
            })?;
    }

    // Parenthesize so the expression is parsed as an expression
    let wrapped = format!("({source})");
    let result = context
        .eval(Source::from_bytes(wrapped.as_bytes()))
        .map_err(map_js_error)?;

    if started.elapsed() > options.timeout {
        return Err(EvaluationError::new(
            ErrorKind::Timeout,
            0,
            "evaluation exceeded its time budget",
        ));
    }

    to_value(result, &mut context)
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn to_value(result: JsValue, context: &mut Context) -> Result<Value, EvaluationError> {
    if result.is_undefined() {
        return Ok(Value::Null);
    }
    if let Some(n) = result.as_number() {
        // Covers NaN/Infinity, which JSON cannot represent
        return Ok(number_value(n));
    }
    if result.is_callable() {
        return Err(EvaluationError::new(
            ErrorKind::TypeError,
            0,
            "a function is not a value in this position",
        ));
    }
    let json = result.to_json(context).map_err(|err| {
        EvaluationError::new(
            ErrorKind::TypeError,
            0,
            format!("result is not representable as JSON: {err}"),
        )
    })?;
    Ok(normalize_numbers(json))
}

/// Numbers coming back from the engine are f64; integral ones normalize to
/// integers so `counter * 2` renders as `10`, not `10.0`.
fn normalize_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) => n.as_f64().map(number_value).unwrap_or(Value::Number(n)),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(normalize_numbers).collect())
        }
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_numbers(v)))
                .collect(),
        ),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_js_error(err: JsError) -> EvaluationError {
    let message = err.to_string();
    let kind = if message.starts_with("SyntaxError") {
        ErrorKind::Syntax
    } else if message.contains("is not defined") {
        ErrorKind::UnknownIdentifier
    } else if message.contains("recursion") || message.contains("call stack") {
        ErrorKind::DepthExceeded
    } else if message.contains("loop iteration") {
        ErrorKind::Timeout
    } else {
        ErrorKind::TypeError
    };
    EvaluationError::new(kind, 0, message)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
