//! Three-tier state model: `inputs` (read-only), `state` (mutable), and
//! `computed` (derived via sandboxed transforms with dependency tracking).
//!
//! The `StateStore` is the only mutator of the `state` tier. Updates are
//! transactional: every operation in a batch applies against a staged copy,
//! and the batch commits only when all operations succeed. Writes mark
//! dependent computed fields dirty; dirty fields recompute in topological
//! order before any flattened view is handed to the expression evaluator.

mod computed;
mod path;
mod store;

pub use computed::ComputedGraph;
pub use path::{Scope, ScopedPath};
pub use store::{FlattenExtras, ResolvedUpdate, StateStore, WriteRecord};

use crate::expression::EvaluationError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised by the state store.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Attempt to write a read-only tier (`inputs`, `computed`, `global`,
    /// `loop`).
    #[error("cannot write read-only tier: {path}")]
    ReadOnlyTier { path: String },

    /// A read addressed a path that does not exist.
    #[error("no value at path: {path}")]
    MissingKey { path: String },

    /// An update operation does not fit the current value's type.
    #[error("type mismatch at {path}: {detail}")]
    TypeMismatch { path: String, detail: String },

    /// The computed-field dependency graph contains a cycle.
    #[error("computed field cycle: {0}")]
    ComputedCycle(String),

    /// A computed-field transform failed and no default was declared.
    #[error("computed field '{field}' failed: {cause}")]
    ComputedFailed {
        field: String,
        #[source]
        cause: EvaluationError,
    },

    /// A scoped path could not be parsed.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
}
