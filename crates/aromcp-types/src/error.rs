//! Public error taxonomy surfaced through the status API.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Category of a workflow-visible error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed workflow YAML, missing required inputs, invalid step config.
    Validation,
    /// Expression or template evaluation failure.
    Evaluation,
    /// Read-only tier write, unknown path, computed cycle.
    StateAccess,
    /// Break/continue outside a loop and similar control misuse.
    ControlFlow,
    /// Tool failure, shell failure (when configured), schema mismatch.
    StepExecution,
    /// Step, tool, sub-agent, or workflow timeout.
    Timeout,
    /// Individual sub-agent failure or aggregation conflict.
    SubAgent,
    /// Explicit cancellation.
    Cancelled,
    /// Invariant violation inside the engine.
    Internal,
}

// ---------------------------------------------------------------------------
// Error record
// ---------------------------------------------------------------------------

/// Error recorded on a failed instance and returned by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// Step during which the error occurred, when attributable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Reference into the execution trace for post-mortem lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_ref: Option<String>,
}

impl WorkflowErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step_id: None,
            trace_ref: None,
        }
    }

    pub fn at_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
