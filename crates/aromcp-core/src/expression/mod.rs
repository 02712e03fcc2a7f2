//! Expression evaluator for workflow conditions and computed-field transforms.
//!
//! Expressions are the fixed ES5-ish subset the workflow YAML uses: literals,
//! member and index access, unary/binary/ternary operators, single-expression
//! arrow functions, array and string methods, `Object.keys/values/entries`,
//! and spread. Evaluation embeds the `boa_engine` JavaScript engine: the
//! scope map is injected as global properties of a throwaway `Context`, the
//! expression runs as a parenthesized script, and the result converts back
//! to JSON.
//!
//! The sandbox boundary has two layers: a lexical screen rejects forbidden
//! constructs (assignment, loops, `new`, `eval`, statements) before anything
//! reaches the engine, and boa's runtime limits cap recursion depth and
//! iteration counts. Each call also carries a wall-clock budget (default
//! 1000 ms). Arithmetic is IEEE-754 `f64`; non-finite results collapse to
//! `null`, which is falsy like the NaN it stands in for, and integral
//! results normalize to integers so templates render `10`, not `10.0`.

mod sandbox;
mod screen;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Category of an expression failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    UnknownIdentifier,
    TypeError,
    Timeout,
    DepthExceeded,
    ForbiddenConstruct,
}

/// Errors that can occur while screening or evaluating an expression.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?} at byte {position}: {message}")]
pub struct EvaluationError {
    pub kind: ErrorKind,
    pub message: String,
    /// Byte offset into the expression source; 0 when the engine does not
    /// report one.
    pub position: usize,
}

impl EvaluationError {
    pub(crate) fn new(kind: ErrorKind, position: usize, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            position,
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Evaluation limits.
#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// Wall-clock budget for one evaluation.
    pub timeout: Duration,
    /// Maximum recursion depth inside the engine.
    pub max_depth: usize,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            max_depth: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled program
// ---------------------------------------------------------------------------

/// A screened expression, reusable across evaluations.
///
/// boa's `Context` is not thread-safe, so the sandbox builds a fresh one per
/// call; what the cache reuses is the screening verdict and the pure-lookup
/// classification, which are per-source and immutable.
#[derive(Debug)]
pub struct Program {
    source: String,
    pure_lookup: bool,
}

impl Program {
    /// Screen an expression string into a reusable program. Forbidden
    /// constructs fail here; syntax errors surface at evaluation time.
    pub fn compile(source: &str) -> Result<Self, EvaluationError> {
        screen::check(source)?;
        Ok(Self {
            source: source.to_string(),
            pure_lookup: screen::is_pure_lookup(source),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the expression is a pure lookup (identifier, member, and
    /// index chains only). The template processor substitutes the empty
    /// string for unknown identifiers in pure lookups instead of failing.
    pub fn is_pure_lookup(&self) -> bool {
        self.pure_lookup
    }

    /// Evaluate against a scope map with the given options.
    pub fn evaluate_with(
        &self,
        scope: &serde_json::Map<String, Value>,
        options: &EvalOptions,
    ) -> Result<Value, EvaluationError> {
        sandbox::evaluate(&self.source, scope, options)
    }

    /// Evaluate against a scope map with default options.
    pub fn evaluate(
        &self,
        scope: &serde_json::Map<String, Value>,
    ) -> Result<Value, EvaluationError> {
        self.evaluate_with(scope, &EvalOptions::default())
    }
}

/// Screen and evaluate in one shot (uncached).
pub fn evaluate(
    source: &str,
    scope: &serde_json::Map<String, Value>,
) -> Result<Value, EvaluationError> {
    Program::compile(source)?.evaluate(scope)
}

// ---------------------------------------------------------------------------
// Expression cache
// ---------------------------------------------------------------------------

/// Screen-once cache shared by an engine.
///
/// Workflow definitions are immutable after load, so a given expression
/// string always screens and classifies the same way.
#[derive(Debug, Default)]
pub struct ExpressionCache {
    programs: Mutex<HashMap<String, Arc<Program>>>,
}

impl ExpressionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the program for `source`, screening on first use.
    pub fn compile(&self, source: &str) -> Result<Arc<Program>, EvaluationError> {
        let mut programs = self.programs.lock().expect("expression cache poisoned");
        if let Some(prog) = programs.get(source) {
            return Ok(Arc::clone(prog));
        }
        let prog = Arc::new(Program::compile(source)?);
        programs.insert(source.to_string(), Arc::clone(&prog));
        Ok(prog)
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

/// JavaScript truthiness: `0`, `""`, `null`, `false` are falsy; arrays and
/// objects (even empty) are truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a value the way JS string coercion would (used by the template
/// processor and user-facing messages): integral numbers without `.0`,
/// compact JSON for containers.
pub fn render_for_template(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Normalize an `f64` into a JSON number: integral values within the safe
/// range become integers so they render without a trailing `.0`, and
/// non-finite values collapse to null (JSON has no NaN).
pub fn number_value(n: f64) -> Value {
    if !n.is_finite() {
        return Value::Null;
    }
    if n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_992.0 {
        return Value::from(n as i64);
    }
    Value::from(n)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(v: Value) -> serde_json::Map<String, Value> {
        v.as_object().expect("scope must be an object").clone()
    }

    // -------------------------------------------------------------------
    // Literals and operators
    // -------------------------------------------------------------------

    #[test]
    fn test_arithmetic() {
        let s = scope(json!({}));
        assert_eq!(evaluate("1 + 2 * 3", &s).unwrap(), json!(7));
        assert_eq!(evaluate("(1 + 2) * 3", &s).unwrap(), json!(9));
        assert_eq!(evaluate("10 % 4", &s).unwrap(), json!(2));
        assert_eq!(evaluate("-5 + 3", &s).unwrap(), json!(-2));
        assert_eq!(evaluate("1.5 + 1", &s).unwrap(), json!(2.5));
    }

    #[test]
    fn test_string_concat() {
        let s = scope(json!({"name": "Alice"}));
        assert_eq!(
            evaluate("'v=' + name", &s).unwrap(),
            json!("v=Alice")
        );
        assert_eq!(evaluate("'n=' + 3", &s).unwrap(), json!("n=3"));
    }

    #[test]
    fn test_division_by_zero_is_null() {
        let s = scope(json!({}));
        // f64 division by zero is infinite; non-finite collapses to null
        assert_eq!(evaluate("1 / 0", &s).unwrap(), Value::Null);
        assert_eq!(evaluate("0 / 0", &s).unwrap(), Value::Null);
    }

    #[test]
    fn test_comparisons_and_logic() {
        let s = scope(json!({"a": 5, "b": "5"}));
        assert_eq!(evaluate("a > 3 && a < 10", &s).unwrap(), json!(true));
        assert_eq!(evaluate("a == b", &s).unwrap(), json!(true)); // loose
        assert_eq!(evaluate("a === b", &s).unwrap(), json!(false)); // strict
        assert_eq!(evaluate("a !== 5", &s).unwrap(), json!(false));
        assert_eq!(evaluate("!a", &s).unwrap(), json!(false));
    }

    #[test]
    fn test_logical_operators_return_operands() {
        let s = scope(json!({"empty": "", "name": "x"}));
        assert_eq!(evaluate("empty || 'fallback'", &s).unwrap(), json!("fallback"));
        assert_eq!(evaluate("name && 'yes'", &s).unwrap(), json!("yes"));
    }

    #[test]
    fn test_ternary() {
        let s = scope(json!({"count": 10}));
        assert_eq!(
            evaluate("count > 5 ? 'high' : 'low'", &s).unwrap(),
            json!("high")
        );
    }

    // -------------------------------------------------------------------
    // Member/index access
    // -------------------------------------------------------------------

    #[test]
    fn test_member_and_index_access() {
        let s = scope(json!({
            "user": {"name": "Alice", "tags": ["a", "b"]},
        }));
        assert_eq!(evaluate("user.name", &s).unwrap(), json!("Alice"));
        assert_eq!(evaluate("user.tags[1]", &s).unwrap(), json!("b"));
        assert_eq!(evaluate("user['name']", &s).unwrap(), json!("Alice"));
    }

    #[test]
    fn test_missing_property_is_null() {
        let s = scope(json!({"user": {}}));
        assert_eq!(evaluate("user.missing", &s).unwrap(), Value::Null);
    }

    #[test]
    fn test_unknown_identifier_errors() {
        let s = scope(json!({}));
        let err = evaluate("nonexistent", &s).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownIdentifier);
    }

    // -------------------------------------------------------------------
    // Array and string methods
    // -------------------------------------------------------------------

    #[test]
    fn test_array_map_filter() {
        let s = scope(json!({"nums": [1, 2, 3, 4]}));
        assert_eq!(
            evaluate("nums.map(n => n * 2)", &s).unwrap(),
            json!([2, 4, 6, 8])
        );
        assert_eq!(
            evaluate("nums.filter(n => n % 2 == 0)", &s).unwrap(),
            json!([2, 4])
        );
        assert_eq!(
            evaluate("nums.filter(n => n > 1).map(n => n + 1)", &s).unwrap(),
            json!([3, 4, 5])
        );
    }

    #[test]
    fn test_array_predicates_and_find() {
        let s = scope(json!({"nums": [1, 2, 3]}));
        assert_eq!(evaluate("nums.some(n => n > 2)", &s).unwrap(), json!(true));
        assert_eq!(evaluate("nums.every(n => n > 0)", &s).unwrap(), json!(true));
        assert_eq!(evaluate("nums.find(n => n > 1)", &s).unwrap(), json!(2));
        assert_eq!(evaluate("nums.find(n => n > 9)", &s).unwrap(), Value::Null);
    }

    #[test]
    fn test_array_slice_concat_join_includes() {
        let s = scope(json!({"xs": ["a", "b", "c"]}));
        assert_eq!(evaluate("xs.slice(1)", &s).unwrap(), json!(["b", "c"]));
        assert_eq!(evaluate("xs.slice(0, 2)", &s).unwrap(), json!(["a", "b"]));
        assert_eq!(
            evaluate("xs.concat(['d'])", &s).unwrap(),
            json!(["a", "b", "c", "d"])
        );
        assert_eq!(evaluate("xs.join('-')", &s).unwrap(), json!("a-b-c"));
        assert_eq!(evaluate("xs.includes('b')", &s).unwrap(), json!(true));
        assert_eq!(evaluate("xs.length", &s).unwrap(), json!(3));
    }

    #[test]
    fn test_string_methods() {
        let s = scope(json!({"msg": "  Hello World  "}));
        assert_eq!(evaluate("msg.trim()", &s).unwrap(), json!("Hello World"));
        assert_eq!(
            evaluate("msg.trim().toLowerCase()", &s).unwrap(),
            json!("hello world")
        );
        assert_eq!(
            evaluate("msg.trim().toUpperCase()", &s).unwrap(),
            json!("HELLO WORLD")
        );
        assert_eq!(
            evaluate("msg.trim().split(' ')", &s).unwrap(),
            json!(["Hello", "World"])
        );
        assert_eq!(
            evaluate("msg.trim().startsWith('Hello')", &s).unwrap(),
            json!(true)
        );
        assert_eq!(
            evaluate("msg.trim().endsWith('World')", &s).unwrap(),
            json!(true)
        );
        assert_eq!(evaluate("msg.includes('World')", &s).unwrap(), json!(true));
        assert_eq!(
            evaluate("msg.trim().replace('World', 'Rust')", &s).unwrap(),
            json!("Hello Rust")
        );
        assert_eq!(evaluate("'abc'.length", &s).unwrap(), json!(3));
    }

    #[test]
    fn test_object_helpers() {
        let s = scope(json!({"obj": {"a": 1, "b": 2}}));
        assert_eq!(evaluate("Object.keys(obj)", &s).unwrap(), json!(["a", "b"]));
        assert_eq!(evaluate("Object.values(obj)", &s).unwrap(), json!([1, 2]));
        assert_eq!(
            evaluate("Object.entries(obj)", &s).unwrap(),
            json!([["a", 1], ["b", 2]])
        );
    }

    // -------------------------------------------------------------------
    // Literals: arrays, objects, spread
    // -------------------------------------------------------------------

    #[test]
    fn test_array_object_literals() {
        let s = scope(json!({"x": 1}));
        assert_eq!(evaluate("[x, 2, 'three']", &s).unwrap(), json!([1, 2, "three"]));
        assert_eq!(
            evaluate("{ a: x, 'b': 2 }", &s).unwrap(),
            json!({"a": 1, "b": 2})
        );
    }

    #[test]
    fn test_spread_in_array_and_call() {
        let s = scope(json!({"xs": [1, 2], "ys": [3]}));
        assert_eq!(
            evaluate("[...xs, ...ys, 4]", &s).unwrap(),
            json!([1, 2, 3, 4])
        );
        assert_eq!(
            evaluate("[0].concat(...[xs, ys])", &s).unwrap(),
            json!([0, 1, 2, 3])
        );
    }

    // -------------------------------------------------------------------
    // Forbidden constructs
    // -------------------------------------------------------------------

    #[test]
    fn test_assignment_is_forbidden() {
        let s = scope(json!({"a": 1}));
        let err = evaluate("a = 2", &s).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ForbiddenConstruct);
    }

    #[test]
    fn test_new_is_forbidden() {
        let s = scope(json!({}));
        let err = evaluate("new Date()", &s).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ForbiddenConstruct);
    }

    #[test]
    fn test_eval_is_forbidden() {
        let s = scope(json!({}));
        let err = evaluate("eval('1')", &s).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ForbiddenConstruct);
    }

    #[test]
    fn test_loops_are_forbidden() {
        let s = scope(json!({}));
        let err = evaluate("while (true) 1", &s).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ForbiddenConstruct);
        let err = evaluate("for (;;) 1", &s).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ForbiddenConstruct);
    }

    // -------------------------------------------------------------------
    // Limits
    // -------------------------------------------------------------------

    #[test]
    fn test_depth_cap() {
        let s = scope(json!({}));
        // Unbounded self-application blows the engine's recursion limit
        let err = evaluate("((f) => f(f))(f => f(f))", &s).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DepthExceeded);
    }

    #[test]
    fn test_syntax_error_surfaces() {
        let s = scope(json!({}));
        let err = evaluate("1 + ", &s).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Syntax);
    }

    // -------------------------------------------------------------------
    // Determinism and cache
    // -------------------------------------------------------------------

    #[test]
    fn test_determinism() {
        let s = scope(json!({"nums": [3, 1, 2]}));
        let a = evaluate("nums.map(n => n * 2).join(',')", &s).unwrap();
        let b = evaluate("nums.map(n => n * 2).join(',')", &s).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_cache_reuses_programs() {
        let cache = ExpressionCache::new();
        let a = cache.compile("1 + 1").unwrap();
        let b = cache.compile("1 + 1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_pure_lookup_detection() {
        assert!(Program::compile("a.b.c").unwrap().is_pure_lookup());
        assert!(Program::compile("a[0].b").unwrap().is_pure_lookup());
        assert!(!Program::compile("a + 1").unwrap().is_pure_lookup());
        assert!(!Program::compile("a.b()").unwrap().is_pure_lookup());
    }

    // -------------------------------------------------------------------
    // Value helpers
    // -------------------------------------------------------------------

    #[test]
    fn test_truthiness_rules() {
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&Value::Null));
        assert!(!truthy(&json!(false)));
        assert!(truthy(&json!([])));
        assert!(truthy(&json!({})));
        assert!(truthy(&json!("0")));
        assert!(truthy(&json!(-1)));
    }

    #[test]
    fn test_number_value_normalization() {
        assert_eq!(number_value(10.0), json!(10));
        assert_eq!(number_value(2.5), json!(2.5));
        assert_eq!(number_value(f64::NAN), Value::Null);
        assert_eq!(number_value(f64::INFINITY), Value::Null);
    }

    #[test]
    fn test_render_for_template() {
        assert_eq!(render_for_template(&json!("x")), "x");
        assert_eq!(render_for_template(&json!(10)), "10");
        assert_eq!(render_for_template(&json!(2.5)), "2.5");
        assert_eq!(render_for_template(&Value::Null), "null");
        assert_eq!(render_for_template(&json!([1, 2])), "[1,2]");
    }
}
