//! Computed-field dependency graph.
//!
//! Built once per instance from the state schema. Nodes are computed fields;
//! an edge runs from field A to field B when B's sources reference A. The
//! graph must be acyclic -- cycles are detected at build time and fail the
//! workflow load. At runtime, writes mark overlapping fields dirty and dirty
//! fields recompute in topological order.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::{Map, Value};

use aromcp_types::workflow::{ComputeErrorPolicy, ComputedFieldSpec, StateSchema};

use crate::expression::{EvalOptions, ExpressionCache};

use super::path::{Scope, ScopedPath};
use super::StateError;

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ComputedNode {
    /// Field name within the computed tier.
    target: String,
    /// Parsed source paths.
    sources: Vec<ScopedPath>,
    transform: String,
    on_error: ComputeErrorPolicy,
    default: Option<Value>,
    dirty: bool,
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Dependency graph over the computed fields of one instance.
#[derive(Debug, Clone)]
pub struct ComputedGraph {
    /// Nodes in topological order (dependencies first).
    nodes: Vec<ComputedNode>,
    cache: Arc<ExpressionCache>,
}

impl ComputedGraph {
    /// Build the graph from a state schema; fails on unparseable source
    /// paths or dependency cycles. All fields start dirty.
    pub fn build(
        schema: &StateSchema,
        cache: Arc<ExpressionCache>,
    ) -> Result<Self, StateError> {
        let mut nodes = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();

        let mut fields: Vec<(&String, &ComputedFieldSpec)> = schema.computed.iter().collect();
        // Deterministic build order regardless of map iteration
        fields.sort_by(|a, b| a.0.cmp(b.0));

        for (name, spec) in fields {
            let sources = spec
                .from
                .iter()
                .map(ScopedPath::parse)
                .collect::<Result<Vec<_>, _>>()?;
            by_name.insert(name.clone(), nodes.len());
            nodes.push(ComputedNode {
                target: name.clone(),
                sources,
                transform: spec.transform.clone(),
                on_error: spec.on_error,
                default: spec.default.clone(),
                dirty: true,
            });
        }

        // Edges: dependency -> dependent, for sources naming another
        // computed field (via `computed.` or an overlapping `this.` path).
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let indices: Vec<NodeIndex> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();
        for (i, node) in nodes.iter().enumerate() {
            for source in &node.sources {
                if !matches!(source.scope, Scope::Computed | Scope::This) {
                    continue;
                }
                let head = &source.segments[0];
                if let Some(&dep) = by_name.get(head) {
                    if dep == i {
                        return Err(StateError::ComputedCycle(format!(
                            "field '{}' depends on itself",
                            node.target
                        )));
                    }
                    graph.add_edge(indices[dep], indices[i], ());
                }
            }
        }

        // Node weights are insertion indices, so NodeIndex::index maps
        // straight back into `nodes`.
        let order = toposort(&graph, None).map_err(|cycle| {
            let field = &nodes[cycle.node_id().index()].target;
            StateError::ComputedCycle(format!("cycle through field '{field}'"))
        })?;

        let nodes = order
            .into_iter()
            .map(|idx| nodes[idx.index()].clone())
            .collect();

        Ok(Self { nodes, cache })
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Mark every field whose sources overlap the written path as dirty,
    /// then cascade to downstream fields.
    pub fn mark_dirty(&mut self, written: &ScopedPath) {
        for i in 0..self.nodes.len() {
            if self.nodes[i].dirty {
                continue;
            }
            let overlaps = self.nodes[i]
                .sources
                .iter()
                .any(|source| source.overlaps(written));
            if overlaps {
                self.nodes[i].dirty = true;
                self.cascade_from(i);
            }
        }
    }

    fn cascade_from(&mut self, start: usize) {
        let target = ScopedPath {
            scope: Scope::Computed,
            segments: vec![self.nodes[start].target.clone()],
            legacy: false,
        };
        for i in 0..self.nodes.len() {
            if i == start || self.nodes[i].dirty {
                continue;
            }
            if self.nodes[i].sources.iter().any(|s| s.overlaps(&target)) {
                self.nodes[i].dirty = true;
                self.cascade_from(i);
            }
        }
    }

    pub fn mark_all_dirty(&mut self) {
        for node in &mut self.nodes {
            node.dirty = true;
        }
    }

    /// Recompute dirty fields in topological order.
    ///
    /// `inputs` and `state` are the current tier contents; `computed` is the
    /// cache being refreshed in place. The transform scope exposes bare
    /// field names with precedence `computed > inputs > state`, plus the
    /// namespaced tier objects.
    pub fn recompute_dirty(
        &mut self,
        inputs: &Map<String, Value>,
        state: &Map<String, Value>,
        computed: &mut Map<String, Value>,
    ) -> Result<(), StateError> {
        if self.nodes.iter().all(|n| !n.dirty) {
            return Ok(());
        }

        for i in 0..self.nodes.len() {
            if !self.nodes[i].dirty {
                continue;
            }
            let scope = transform_scope(inputs, state, computed);
            let node = &self.nodes[i];
            let program = self
                .cache
                .compile(&node.transform)
                .map_err(|cause| StateError::ComputedFailed {
                    field: node.target.clone(),
                    cause,
                })?;

            match program.evaluate_with(&scope, &EvalOptions::default()) {
                Ok(value) => {
                    computed.insert(node.target.clone(), value);
                }
                Err(cause) => match node.on_error {
                    ComputeErrorPolicy::UseDefault => {
                        tracing::warn!(
                            field = node.target.as_str(),
                            error = %cause,
                            "computed transform failed, using declared default"
                        );
                        computed.insert(
                            node.target.clone(),
                            node.default.clone().unwrap_or(Value::Null),
                        );
                    }
                    ComputeErrorPolicy::Raise => {
                        return Err(StateError::ComputedFailed {
                            field: node.target.clone(),
                            cause,
                        });
                    }
                },
            }
            self.nodes[i].dirty = false;
        }

        Ok(())
    }
}

/// Scope for a computed transform: bare names (computed > inputs > state)
/// plus the tier namespaces.
fn transform_scope(
    inputs: &Map<String, Value>,
    state: &Map<String, Value>,
    computed: &Map<String, Value>,
) -> Map<String, Value> {
    let mut scope = state.clone();
    for (k, v) in inputs {
        scope.insert(k.clone(), v.clone());
    }
    for (k, v) in computed {
        scope.insert(k.clone(), v.clone());
    }
    // `this` mirrors the bare-name precedence view
    let this = scope.clone();
    scope.insert("inputs".to_string(), Value::Object(inputs.clone()));
    scope.insert("state".to_string(), Value::Object(state.clone()));
    scope.insert("computed".to_string(), Value::Object(computed.clone()));
    scope.insert("this".to_string(), Value::Object(this));
    scope
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
