//! The three-tier state store.

use serde_json::{Map, Value};

use aromcp_types::workflow::{StateSchema, UpdateOperation};

use std::sync::Arc;

use crate::expression::ExpressionCache;

use super::computed::ComputedGraph;
use super::path::{Scope, ScopedPath};
use super::StateError;

// ---------------------------------------------------------------------------
// Update records
// ---------------------------------------------------------------------------

/// A state update whose value has already been resolved (templates and
/// source tokens substituted by the step handler).
#[derive(Debug, Clone)]
pub struct ResolvedUpdate {
    pub path: ScopedPath,
    pub operation: UpdateOperation,
    pub value: Value,
}

impl ResolvedUpdate {
    pub fn set(path: ScopedPath, value: Value) -> Self {
        Self {
            path,
            operation: UpdateOperation::Set,
            value,
        }
    }
}

/// Before/after record for one committed write, fed to the tracker.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub path: String,
    pub before: Value,
    pub after: Value,
}

// ---------------------------------------------------------------------------
// Flatten context
// ---------------------------------------------------------------------------

/// Extra bindings merged into a flattened view.
#[derive(Debug, Clone, Default)]
pub struct FlattenExtras {
    /// Innermost loop bindings (`item`, `index`, `iteration`), when inside
    /// a loop.
    pub loop_scope: Option<Map<String, Value>>,
    /// Additional bare-name bindings (the foreach custom variable).
    pub variables: Map<String, Value>,
    /// The root instance's `this` view; `None` means this store belongs to
    /// the root, whose own view doubles as `global`.
    pub global_view: Option<Map<String, Value>>,
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Per-instance three-tier storage. The `inputs` tier is frozen at
/// construction; `state` mutates only through [`StateStore::apply_updates`];
/// `computed` is a cache refreshed from the dependency graph.
#[derive(Debug, Clone)]
pub struct StateStore {
    inputs: Map<String, Value>,
    state: Map<String, Value>,
    computed: Map<String, Value>,
    graph: ComputedGraph,
}

impl StateStore {
    /// Create a store, seeding `state` from the default state and building
    /// the computed graph (cycles fail here). Computed fields are
    /// materialized immediately.
    pub fn new(
        inputs: Map<String, Value>,
        default_state: Map<String, Value>,
        schema: &StateSchema,
        cache: Arc<ExpressionCache>,
    ) -> Result<Self, StateError> {
        let graph = ComputedGraph::build(schema, cache)?;
        let mut store = Self {
            inputs,
            state: default_state,
            computed: Map::new(),
            graph,
        };
        store.recompute()?;
        Ok(store)
    }

    fn recompute(&mut self) -> Result<(), StateError> {
        self.graph
            .recompute_dirty(&self.inputs, &self.state, &mut self.computed)
    }

    // -- Reads ------------------------------------------------------------

    /// Read a value at a local path (`inputs`, `state`, `computed`, or
    /// `this`). `loop` and `global` scopes resolve in the engine, which
    /// knows the frames and the parent instance.
    pub fn read(&mut self, path: &ScopedPath) -> Result<Value, StateError> {
        self.recompute()?;
        let missing = || StateError::MissingKey {
            path: path.display(),
        };
        match path.scope {
            Scope::Inputs => read_path(&self.inputs, &path.segments).ok_or_else(missing),
            Scope::State => read_path(&self.state, &path.segments).ok_or_else(missing),
            Scope::Computed => read_path(&self.computed, &path.segments).ok_or_else(missing),
            Scope::This => read_path(&self.computed, &path.segments)
                .or_else(|| read_path(&self.inputs, &path.segments))
                .or_else(|| read_path(&self.state, &path.segments))
                .ok_or_else(missing),
            Scope::Global | Scope::Loop => Err(StateError::InvalidPath {
                path: path.display(),
                reason: "scope resolves outside this store".to_string(),
            }),
        }
    }

    /// The merged `this` view: bare names with precedence
    /// `computed > inputs > state`.
    pub fn this_view(&mut self) -> Result<Map<String, Value>, StateError> {
        self.recompute()?;
        let mut view = self.state.clone();
        for (k, v) in &self.inputs {
            view.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.computed {
            view.insert(k.clone(), v.clone());
        }
        Ok(view)
    }

    /// Build the scope map handed to the expression evaluator: bare names,
    /// tier namespaces, `this`, `global`, and loop bindings.
    pub fn flattened(
        &mut self,
        extras: &FlattenExtras,
    ) -> Result<Map<String, Value>, StateError> {
        let this = self.this_view()?;
        let mut scope = this.clone();

        scope.insert("inputs".to_string(), Value::Object(self.inputs.clone()));
        scope.insert("state".to_string(), Value::Object(self.state.clone()));
        scope.insert("computed".to_string(), Value::Object(self.computed.clone()));
        scope.insert(
            "global".to_string(),
            Value::Object(extras.global_view.clone().unwrap_or_else(|| this.clone())),
        );
        scope.insert("this".to_string(), Value::Object(this));

        if let Some(loop_scope) = &extras.loop_scope {
            scope.insert("loop".to_string(), Value::Object(loop_scope.clone()));
        }
        for (k, v) in &extras.variables {
            scope.insert(k.clone(), v.clone());
        }

        Ok(scope)
    }

    /// Raw view of the mutable tier (used for aggregation snapshots).
    pub fn state_tier(&self) -> &Map<String, Value> {
        &self.state
    }

    // -- Writes -----------------------------------------------------------

    /// Apply a batch of updates transactionally: either every operation
    /// succeeds and the batch commits, or the state tier is untouched.
    pub fn apply_updates(
        &mut self,
        updates: &[ResolvedUpdate],
    ) -> Result<Vec<WriteRecord>, StateError> {
        // Reject read-only tiers before staging anything
        for update in updates {
            if !update.path.scope.is_writable() {
                return Err(StateError::ReadOnlyTier {
                    path: update.path.display(),
                });
            }
        }

        let mut staged = self.state.clone();
        let mut records = Vec::with_capacity(updates.len());
        for update in updates {
            let before = read_path(&staged, &update.path.segments).unwrap_or(Value::Null);
            let after = apply_operation(
                &before,
                update.operation,
                &update.value,
                &update.path,
            )?;
            write_path(&mut staged, &update.path.segments, after.clone());
            records.push(WriteRecord {
                path: update.path.display(),
                before,
                after,
            });
        }

        self.state = staged;
        for update in updates {
            // Writes through `this` land in the state tier; dirty-marking
            // uses the concrete tier so source paths match either spelling.
            let written = ScopedPath {
                scope: Scope::State,
                segments: update.path.segments.clone(),
                legacy: false,
            };
            self.graph.mark_dirty(&written);
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Nested path helpers
// ---------------------------------------------------------------------------

fn read_path(map: &Map<String, Value>, segments: &[String]) -> Option<Value> {
    let (head, rest) = segments.split_first()?;
    let mut current = map.get(head)?;
    for segment in rest {
        current = current.as_object()?.get(segment)?;
    }
    Some(current.clone())
}

/// Write a value at a nested path, creating intermediate objects. A
/// non-object intermediate is replaced.
fn write_path(map: &mut Map<String, Value>, segments: &[String], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        map.insert(head.clone(), value);
        return;
    }
    let entry = map
        .entry(head.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Value::Object(inner) = entry {
        write_path(inner, rest, value);
    }
}

fn apply_operation(
    before: &Value,
    operation: UpdateOperation,
    operand: &Value,
    path: &ScopedPath,
) -> Result<Value, StateError> {
    let mismatch = |detail: String| StateError::TypeMismatch {
        path: path.display(),
        detail,
    };
    let number = |v: &Value, role: &str| -> Result<f64, StateError> {
        match v {
            Value::Null => Ok(0.0),
            Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
            other => Err(mismatch(format!(
                "{role} must be a number, got {other}"
            ))),
        }
    };

    let num = crate::expression::number_value;
    match operation {
        UpdateOperation::Set => Ok(operand.clone()),
        UpdateOperation::Increment => {
            Ok(num(number(before, "target")? + number(operand, "operand")?))
        }
        UpdateOperation::Decrement => {
            Ok(num(number(before, "target")? - number(operand, "operand")?))
        }
        UpdateOperation::Multiply => {
            Ok(num(number(before, "target")? * number(operand, "operand")?))
        }
        UpdateOperation::Append => match before {
            Value::Null => Ok(Value::Array(vec![operand.clone()])),
            Value::Array(items) => {
                let mut items = items.clone();
                items.push(operand.clone());
                Ok(Value::Array(items))
            }
            Value::String(s) => match operand.as_str() {
                Some(suffix) => Ok(Value::String(format!("{s}{suffix}"))),
                None => Err(mismatch(
                    "append to a string requires a string operand".to_string(),
                )),
            },
            other => Err(mismatch(format!(
                "append requires an array or string target, got {other}"
            ))),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use aromcp_types::workflow::{ComputeErrorPolicy, ComputedFieldSpec, SourcePaths};
    use serde_json::json;
    use std::collections::HashMap;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn store_with_computed() -> StateStore {
        let schema = StateSchema {
            state: HashMap::new(),
            computed: HashMap::from([(
                "doubled".to_string(),
                ComputedFieldSpec {
                    from: SourcePaths::One("state.counter".to_string()),
                    transform: "counter * 2".to_string(),
                    on_error: ComputeErrorPolicy::Raise,
                    default: None,
                },
            )]),
        };
        StateStore::new(
            obj(json!({"name": "Alice"})),
            obj(json!({"counter": 5})),
            &schema,
            Arc::new(ExpressionCache::new()),
        )
        .unwrap()
    }

    fn path(p: &str) -> ScopedPath {
        ScopedPath::parse(p).unwrap()
    }

    // -------------------------------------------------------------------
    // Reads & precedence
    // -------------------------------------------------------------------

    #[test]
    fn test_reads_by_scope() {
        let mut store = store_with_computed();
        assert_eq!(store.read(&path("inputs.name")).unwrap(), json!("Alice"));
        assert_eq!(store.read(&path("state.counter")).unwrap(), json!(5));
        assert_eq!(store.read(&path("computed.doubled")).unwrap(), json!(10));
        assert_eq!(store.read(&path("this.doubled")).unwrap(), json!(10));
    }

    #[test]
    fn test_missing_key() {
        let mut store = store_with_computed();
        assert!(matches!(
            store.read(&path("state.nope")),
            Err(StateError::MissingKey { .. })
        ));
    }

    #[test]
    fn test_this_precedence_computed_over_inputs_over_state() {
        let schema = StateSchema {
            state: HashMap::new(),
            computed: HashMap::from([(
                "x".to_string(),
                ComputedFieldSpec {
                    from: SourcePaths::One("state.ignored".to_string()),
                    transform: "'from-computed'".to_string(),
                    on_error: ComputeErrorPolicy::Raise,
                    default: None,
                },
            )]),
        };
        let mut store = StateStore::new(
            obj(json!({"x": "from-inputs", "y": "from-inputs"})),
            obj(json!({"x": "from-state", "y": "from-state", "z": "from-state"})),
            &schema,
            Arc::new(ExpressionCache::new()),
        )
        .unwrap();
        assert_eq!(store.read(&path("this.x")).unwrap(), json!("from-computed"));
        assert_eq!(store.read(&path("this.y")).unwrap(), json!("from-inputs"));
        assert_eq!(store.read(&path("this.z")).unwrap(), json!("from-state"));
    }

    // -------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------

    #[test]
    fn test_set_and_recompute() {
        let mut store = store_with_computed();
        store
            .apply_updates(&[ResolvedUpdate::set(path("state.counter"), json!(7))])
            .unwrap();
        assert_eq!(store.read(&path("computed.doubled")).unwrap(), json!(14));
    }

    #[test]
    fn test_write_via_this_lands_in_state() {
        let mut store = store_with_computed();
        store
            .apply_updates(&[ResolvedUpdate::set(path("this.counter"), json!(9))])
            .unwrap();
        assert_eq!(store.read(&path("state.counter")).unwrap(), json!(9));
        assert_eq!(store.read(&path("computed.doubled")).unwrap(), json!(18));
    }

    #[test]
    fn test_readonly_inputs_rejected() {
        let mut store = store_with_computed();
        let err = store
            .apply_updates(&[ResolvedUpdate::set(path("inputs.name"), json!("Bob"))])
            .unwrap_err();
        assert!(matches!(err, StateError::ReadOnlyTier { .. }));
    }

    #[test]
    fn test_readonly_computed_rejected() {
        let mut store = store_with_computed();
        let err = store
            .apply_updates(&[ResolvedUpdate::set(path("computed.doubled"), json!(0))])
            .unwrap_err();
        assert!(matches!(err, StateError::ReadOnlyTier { .. }));
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let mut store = store_with_computed();
        let err = store.apply_updates(&[
            ResolvedUpdate::set(path("state.counter"), json!(100)),
            ResolvedUpdate::set(path("inputs.name"), json!("Bob")),
        ]);
        assert!(err.is_err());
        // First op must not have committed
        assert_eq!(store.read(&path("state.counter")).unwrap(), json!(5));
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let mut store = store_with_computed();
        let before = store.this_view().unwrap();
        store.apply_updates(&[]).unwrap();
        assert_eq!(store.this_view().unwrap(), before);
    }

    // -------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------

    #[test]
    fn test_increment_decrement_multiply() {
        let mut store = store_with_computed();
        let inc = ResolvedUpdate {
            path: path("state.counter"),
            operation: UpdateOperation::Increment,
            value: json!(3),
        };
        store.apply_updates(&[inc]).unwrap();
        assert_eq!(store.read(&path("state.counter")).unwrap(), json!(8));

        let dec = ResolvedUpdate {
            path: path("state.counter"),
            operation: UpdateOperation::Decrement,
            value: json!(2),
        };
        store.apply_updates(&[dec]).unwrap();
        assert_eq!(store.read(&path("state.counter")).unwrap(), json!(6));

        let mul = ResolvedUpdate {
            path: path("state.counter"),
            operation: UpdateOperation::Multiply,
            value: json!(2),
        };
        store.apply_updates(&[mul]).unwrap();
        assert_eq!(store.read(&path("state.counter")).unwrap(), json!(12));
    }

    #[test]
    fn test_increment_missing_starts_at_zero() {
        let mut store = store_with_computed();
        let inc = ResolvedUpdate {
            path: path("state.fresh"),
            operation: UpdateOperation::Increment,
            value: json!(4),
        };
        store.apply_updates(&[inc]).unwrap();
        assert_eq!(store.read(&path("state.fresh")).unwrap(), json!(4));
    }

    #[test]
    fn test_append_array_and_string() {
        let mut store = store_with_computed();
        store
            .apply_updates(&[ResolvedUpdate {
                path: path("state.items"),
                operation: UpdateOperation::Append,
                value: json!("a"),
            }])
            .unwrap();
        store
            .apply_updates(&[ResolvedUpdate {
                path: path("state.items"),
                operation: UpdateOperation::Append,
                value: json!("b"),
            }])
            .unwrap();
        assert_eq!(store.read(&path("state.items")).unwrap(), json!(["a", "b"]));

        store
            .apply_updates(&[ResolvedUpdate::set(path("state.log"), json!("x"))])
            .unwrap();
        store
            .apply_updates(&[ResolvedUpdate {
                path: path("state.log"),
                operation: UpdateOperation::Append,
                value: json!("y"),
            }])
            .unwrap();
        assert_eq!(store.read(&path("state.log")).unwrap(), json!("xy"));
    }

    #[test]
    fn test_increment_non_number_fails() {
        let mut store = store_with_computed();
        store
            .apply_updates(&[ResolvedUpdate::set(path("state.text"), json!("hi"))])
            .unwrap();
        let err = store
            .apply_updates(&[ResolvedUpdate {
                path: path("state.text"),
                operation: UpdateOperation::Increment,
                value: json!(1),
            }])
            .unwrap_err();
        assert!(matches!(err, StateError::TypeMismatch { .. }));
    }

    #[test]
    fn test_nested_write_creates_objects() {
        let mut store = store_with_computed();
        store
            .apply_updates(&[ResolvedUpdate::set(
                path("state.review.files.total"),
                json!(3),
            )])
            .unwrap();
        assert_eq!(
            store.read(&path("state.review.files.total")).unwrap(),
            json!(3)
        );
    }

    // -------------------------------------------------------------------
    // Flattened view
    // -------------------------------------------------------------------

    #[test]
    fn test_flattened_scope_shape() {
        let mut store = store_with_computed();
        let scope = store.flattened(&FlattenExtras::default()).unwrap();

        assert_eq!(scope.get("counter"), Some(&json!(5)));
        assert_eq!(scope.get("doubled"), Some(&json!(10)));
        assert_eq!(scope["this"]["doubled"], json!(10));
        assert_eq!(scope["inputs"]["name"], json!("Alice"));
        assert_eq!(scope["state"]["counter"], json!(5));
        // Root store doubles as its own global
        assert_eq!(scope["global"]["counter"], json!(5));
        assert!(scope.get("loop").is_none());
    }

    #[test]
    fn test_flattened_with_loop_and_variables() {
        let mut store = store_with_computed();
        let extras = FlattenExtras {
            loop_scope: Some(obj(json!({"item": "a", "index": 0, "iteration": 1}))),
            variables: obj(json!({"letter": "a"})),
            global_view: None,
        };
        let scope = store.flattened(&extras).unwrap();
        assert_eq!(scope["loop"]["index"], json!(0));
        assert_eq!(scope.get("letter"), Some(&json!("a")));
    }

    #[test]
    fn test_write_records_before_after() {
        let mut store = store_with_computed();
        let records = store
            .apply_updates(&[ResolvedUpdate::set(path("state.counter"), json!(6))])
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].before, json!(5));
        assert_eq!(records[0].after, json!(6));
        assert_eq!(records[0].path, "state.counter");
    }
}
