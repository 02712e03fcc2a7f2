//! Step registry and handlers.
//!
//! Each of the fourteen step types registers a handler keyed by its type
//! tag. A handler receives the resolved evaluation scope, applies template
//! substitution to its string fields, and returns an [`Outcome`]: a payload
//! to emit, a server-side completion (state updates plus an optional
//! control-flow effect), or a failure. Handlers never touch the state store
//! directly; the scheduler applies returned updates transactionally.

mod handlers;
mod registry;
mod resolve;

pub use handlers::{finish_tool_call, validate_user_input};
pub use registry::{DispatchContext, Outcome, StepHandler, StepRegistry, ToolDispatcher, ToolError};
pub use resolve::{resolve_value, ResolveError};

use aromcp_types::workflow::StepDefinition;
use serde_json::Value;

use crate::frames::LoopFrame;

// ---------------------------------------------------------------------------
// Control-flow effects
// ---------------------------------------------------------------------------

/// Effect a completed step has on the control stacks.
#[derive(Debug)]
pub enum ControlEffect {
    /// A conditional chose a branch.
    Branch {
        condition: String,
        taken: bool,
        steps: Vec<StepDefinition>,
    },
    /// A loop whose first iteration should run.
    EnterLoop(LoopFrame),
    /// A loop that never runs (false condition / empty items).
    SkipLoop { condition: String },
    /// Exit the innermost loop.
    Break,
    /// Skip to the next iteration of the innermost loop.
    Continue,
    /// Hand off to the sub-agent coordinator.
    FanOut(FanOutRequest),
}

/// Resolved `parallel_foreach` request.
#[derive(Debug, Clone)]
pub struct FanOutRequest {
    pub step_id: String,
    pub items: Vec<Value>,
    pub task_name: String,
    pub max_parallel: usize,
    pub timeout_seconds: Option<u64>,
}
