//! Wire types exchanged with polling clients.
//!
//! These are the payloads of the public API (`start`, `get_next_step`,
//! `update_state`, `status`, ...). All string fields inside a
//! `StepPayload` are fully template-substituted before emission; clients
//! never see raw `{{ ... }}` markers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkflowErrorInfo;
use crate::workflow::{InputSpec, InstanceStatus, WorkflowConfig};

// ---------------------------------------------------------------------------
// Step payload envelope
// ---------------------------------------------------------------------------

/// One step handed to a client by `get_next_step`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPayload {
    /// Step id (`step_<nnn>`, or `<task_id>:step_<nnn>` for sub-agents).
    pub id: String,
    /// Step-type tag (`user_message`, `mcp_call`, ...).
    #[serde(rename = "type")]
    pub step_type: String,
    /// Resolved, type-specific step definition.
    pub definition: Value,
    /// Evaluation context snapshot at dispatch time.
    pub context: StepContext,
}

/// Context snapshot attached to an emitted step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepContext {
    /// Variables resolved while substituting the step's templates.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables_resolved: serde_json::Map<String, Value>,
    /// Innermost loop bindings, when the step executes inside a loop.
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_bindings: Option<LoopBindings>,
}

/// `loop.*` bindings visible to an emitted step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopBindings {
    pub item: Value,
    pub index: u64,
    pub iteration: u64,
}

// ---------------------------------------------------------------------------
// Catalog / status records
// ---------------------------------------------------------------------------

/// One entry of `list_workflows`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs_schema: HashMap<String, InputSpec>,
}

/// Full definition metadata minus step bodies, returned by `get_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInfo {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, InputSpec>,
    pub config: WorkflowConfig,
    /// Number of root steps (bodies elided).
    pub total_steps: usize,
    /// Names of declared sub-agent tasks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_agent_tasks: Vec<String>,
}

/// Result of `status(id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub state: InstanceStatus,
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowErrorInfo>,
}

/// Coarse progress counters for a running instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    pub steps_completed: u64,
    pub sub_agents_total: u64,
    pub sub_agents_finished: u64,
}

/// One entry of `list_sub_agents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentSummary {
    pub task_id: String,
    pub status: InstanceStatus,
    pub item_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowErrorInfo>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
