//! Step handler contract and registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};

use aromcp_types::api::{LoopBindings, StepContext, StepPayload};
use aromcp_types::error::WorkflowErrorInfo;
use aromcp_types::workflow::{StepDefinition, WorkflowDefinition};

use crate::expression::ExpressionCache;
use crate::queue::QueueMode;
use crate::state::ResolvedUpdate;

use super::handlers;
use super::ControlEffect;

// ---------------------------------------------------------------------------
// Tool dispatch seam
// ---------------------------------------------------------------------------

/// A server-side tool invocation failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("tool invocation failed: {message}")]
pub struct ToolError {
    pub message: String,
    /// Whether the step's retry policy applies.
    pub retryable: bool,
}

/// Opaque callable registry for `mcp_call` steps with
/// `execution_context: server`. The registry itself lives outside the
/// engine; boxed futures keep the trait object-safe.
pub trait ToolDispatcher: Send + Sync {
    fn invoke<'a>(
        &'a self,
        tool: &'a str,
        parameters: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>>;
}

// ---------------------------------------------------------------------------
// Dispatch context
// ---------------------------------------------------------------------------

/// Everything a handler may read while dispatching one step.
pub struct DispatchContext<'a> {
    /// Flattened evaluation scope at dispatch time.
    pub scope: Map<String, Value>,
    pub cache: &'a ExpressionCache,
    /// Result of the immediately preceding step (source tokens).
    pub last_result: Option<&'a Value>,
    /// Server-side tool registry, when wired.
    pub tools: Option<&'a dyn ToolDispatcher>,
    /// Innermost loop bindings for the payload context.
    pub loop_bindings: Option<LoopBindings>,
    /// `<task_id>:` prefix on sub-agent step payload ids.
    pub step_id_prefix: &'a str,
    /// Definition, for sub-agent task validation.
    pub definition: &'a WorkflowDefinition,
    /// Engine-wide default loop iteration cap.
    pub default_max_iterations: u64,
}

impl DispatchContext<'_> {
    /// Assemble a client payload with the shared envelope fields.
    pub fn payload(
        &self,
        step: &StepDefinition,
        definition: Value,
        variables_resolved: Map<String, Value>,
    ) -> StepPayload {
        StepPayload {
            id: format!("{}{}", self.step_id_prefix, step.id),
            step_type: step.config.type_tag().to_string(),
            definition,
            context: StepContext {
                variables_resolved,
                loop_bindings: self.loop_bindings.clone(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What dispatching one step produced.
#[derive(Debug)]
pub enum Outcome {
    /// A client-visible payload; the scheduler routes it by queue mode.
    Emit(StepPayload),
    /// Server-side completion.
    Complete {
        updates: Vec<ResolvedUpdate>,
        /// Becomes the instance's `last_result`.
        result: Option<Value>,
        control: Option<ControlEffect>,
    },
    Fail(WorkflowErrorInfo),
}

impl Outcome {
    pub fn done() -> Self {
        Outcome::Complete {
            updates: Vec::new(),
            result: None,
            control: None,
        }
    }

    pub fn control(effect: ControlEffect) -> Self {
        Outcome::Complete {
            updates: Vec::new(),
            result: None,
            control: Some(effect),
        }
    }
}

// ---------------------------------------------------------------------------
// Handler trait & registry
// ---------------------------------------------------------------------------

/// One step type's semantics.
pub trait StepHandler: Send + Sync {
    /// Dispatch class; determines how the scheduler treats the outcome.
    fn queue_mode(&self, step: &StepDefinition) -> QueueMode;

    /// Execute the server-side part of the step.
    fn dispatch<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a DispatchContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>>;
}

/// Static mapping from step-type tag to handler.
pub struct StepRegistry {
    handlers: HashMap<&'static str, Box<dyn StepHandler>>,
}

impl StepRegistry {
    /// Registry with all fourteen built-in step types.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        handlers::register_defaults(&mut registry);
        registry
    }

    pub fn register(&mut self, tag: &'static str, handler: Box<dyn StepHandler>) {
        self.handlers.insert(tag, handler);
    }

    pub fn get(&self, tag: &str) -> Option<&dyn StepHandler> {
        self.handlers.get(tag).map(Box::as_ref)
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.handlers.keys().collect();
        tags.sort();
        f.debug_struct("StepRegistry").field("tags", &tags).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
