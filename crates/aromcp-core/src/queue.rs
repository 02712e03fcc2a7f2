//! Dispatch modes and the pending queue.
//!
//! Every step type belongs to one of five dispatch modes. Within one
//! `get_next_step` call the scheduler drains `immediate` and `expand` steps
//! fully (they never reach the client), coalesces consecutive `batch` steps
//! into a single emission, and stops at the first `blocking` or `wait` step.
//! Source order within a mode is frame order, so FIFO inside a mode class
//! falls out of the cursor discipline; the strict mode priority falls out of
//! the drain loop.
//!
//! The pending queue holds what has been classified but not yet consumed:
//! the batch coalescing buffer and the single emitted step awaiting its
//! client result. Pausing an instance leaves both untouched, which is what
//! preserves queue positions across pause/resume.

use serde_json::Value;

use aromcp_types::api::StepPayload;
use aromcp_types::workflow::{StepConfig, StepDefinition, ToolExecutionContext};

// ---------------------------------------------------------------------------
// Queue modes
// ---------------------------------------------------------------------------

/// Dispatch class of a step, in strict priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueueMode {
    /// Server-executed without yielding (state updates, shell, control).
    Immediate,
    /// Expands into further steps (conditionals, loops).
    Expand,
    /// Client-visible, coalesced with its neighbours (user messages).
    Batch,
    /// Client-visible, suspends until the client reports a result.
    Blocking,
    /// Suspends until the next poll, no result expected.
    Wait,
}

/// Classify a step configuration.
pub fn mode_of(config: &StepConfig) -> QueueMode {
    match config {
        StepConfig::StateUpdate { .. }
        | StepConfig::ShellCommand { .. }
        | StepConfig::AgentResponse { .. }
        | StepConfig::Break {}
        | StepConfig::Continue {} => QueueMode::Immediate,
        StepConfig::McpCall {
            execution_context: ToolExecutionContext::Server,
            ..
        } => QueueMode::Immediate,
        StepConfig::Conditional { .. }
        | StepConfig::WhileLoop { .. }
        | StepConfig::Foreach { .. } => QueueMode::Expand,
        StepConfig::UserMessage { .. } => QueueMode::Batch,
        StepConfig::UserInput { .. }
        | StepConfig::AgentPrompt { .. }
        | StepConfig::McpCall { .. }
        | StepConfig::ParallelForeach { .. } => QueueMode::Blocking,
        StepConfig::WaitStep { .. } => QueueMode::Wait,
    }
}

// ---------------------------------------------------------------------------
// Pending queue
// ---------------------------------------------------------------------------

/// A step emitted to the client whose result has not been consumed yet.
#[derive(Debug, Clone)]
pub struct AwaitingStep {
    pub step_id: String,
    /// Original definition, needed to process the result (validation,
    /// capture paths, retry policy).
    pub step: StepDefinition,
    pub payload: StepPayload,
    /// Result posted via `step_complete`, if it has arrived.
    pub result: Option<Value>,
    /// Rejected submissions so far (user_input retry accounting).
    pub attempts: u64,
}

/// Classified-but-unconsumed work for one instance.
#[derive(Debug, Default)]
pub struct PendingQueue {
    /// Coalesced `user_message` payloads not yet flushed.
    batch: Vec<StepPayload>,
    /// The single suspending step awaiting its client result.
    awaiting: Option<AwaitingStep>,
}

impl PendingQueue {
    pub fn push_batch(&mut self, payload: StepPayload) {
        self.batch.push(payload);
    }

    pub fn has_batch(&self) -> bool {
        !self.batch.is_empty()
    }

    /// Drain the batch buffer into one client emission.
    pub fn flush_batch(&mut self) -> Vec<StepPayload> {
        std::mem::take(&mut self.batch)
    }

    /// Record the emitted suspending step. At most one may be outstanding;
    /// a second emission before the first resolves is an engine bug.
    pub fn set_awaiting(&mut self, step: AwaitingStep) {
        debug_assert!(self.awaiting.is_none(), "second suspending step emitted");
        self.awaiting = Some(step);
    }

    pub fn awaiting(&self) -> Option<&AwaitingStep> {
        self.awaiting.as_ref()
    }

    /// Attach a client result to the awaiting step. Returns false when the
    /// step id does not match the outstanding step (stale completion).
    pub fn complete(&mut self, step_id: &str, result: Value) -> bool {
        match &mut self.awaiting {
            Some(step) if step.step_id == step_id => {
                step.result = Some(result);
                true
            }
            _ => false,
        }
    }

    /// Take the awaiting entry (with whatever result has arrived) for
    /// processing on the next poll.
    pub fn take_awaiting(&mut self) -> Option<AwaitingStep> {
        self.awaiting.take()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
