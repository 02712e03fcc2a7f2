//! Per-run instance state.
//!
//! A `WorkflowInstance` owns everything one execution needs: the three-tier
//! state store, the call/loop frame stacks, the pending queue, the tracker,
//! and lifecycle metadata. Sub-agent instances reuse the same shape with an
//! `item_context` and a parent reference; isolation falls out of each
//! instance owning its tiers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use aromcp_types::error::WorkflowErrorInfo;
use aromcp_types::workflow::{InstanceStatus, StepDefinition, WorkflowDefinition};

use crate::frames::Frames;
use crate::queue::PendingQueue;
use crate::state::StateStore;
use crate::tracker::{ExecutionTracker, TraceEvent};

// ---------------------------------------------------------------------------
// Instance ids
// ---------------------------------------------------------------------------

/// Generate a candidate instance id: `wf_` + 8 lowercase hex chars. The
/// engine retries on the (unlikely) collision with a live instance.
pub fn new_instance_id() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    format!(
        "wf_{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3]
    )
}

// ---------------------------------------------------------------------------
// Sub-agent context
// ---------------------------------------------------------------------------

/// Fan-out bindings for a sub-agent instance.
#[derive(Debug, Clone)]
pub struct ItemContext {
    pub item: Value,
    pub index: u64,
    pub total: u64,
    pub task_id: String,
    pub parent_id: String,
}

impl ItemContext {
    /// The context exposed to the sub-agent's expressions under `item`,
    /// `index`, and `total` input names.
    pub fn as_inputs(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("item".to_string(), self.item.clone());
        map.insert("index".to_string(), Value::from(self.index));
        map.insert("total".to_string(), Value::from(self.total));
        map.insert("task_id".to_string(), Value::String(self.task_id.clone()));
        map.insert(
            "parent_id".to_string(),
            Value::String(self.parent_id.clone()),
        );
        map
    }
}

// ---------------------------------------------------------------------------
// WorkflowInstance
// ---------------------------------------------------------------------------

/// One in-memory execution of a workflow or sub-agent task.
#[derive(Debug)]
pub struct WorkflowInstance {
    /// `wf_<hex>` for roots, `<task_name>.item<N>` for sub-agents.
    pub id: String,
    pub workflow_name: String,
    pub status: InstanceStatus,
    pub store: StateStore,
    pub frames: Frames,
    pub pending: PendingQueue,
    pub tracker: ExecutionTracker,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_step_id: Option<String>,
    pub error: Option<WorkflowErrorInfo>,
    /// Result of the most recently completed step, feeding the reserved
    /// source tokens (`stdout`, `returncode`, ...).
    pub last_result: Option<Value>,
    /// Definition (shared across instances of the same workflow).
    pub definition: Arc<WorkflowDefinition>,
    /// Sub-agent fields; `None` on root instances.
    pub item_context: Option<ItemContext>,
    /// Wall-clock deadline (workflow timeout, or sub-agent
    /// `timeout_seconds`).
    pub deadline: Option<DateTime<Utc>>,
    /// Cancellation signal; sub-agents hold a child token of their
    /// parent's, so cancelling the parent propagates. The scheduler
    /// observes the token at its next touchpoint.
    pub cancel_token: CancellationToken,
    /// Active `parallel_foreach` fan-out, while one is in flight.
    pub fanout: Option<crate::subagent::FanOut>,
}

impl WorkflowInstance {
    pub fn new(
        id: String,
        definition: Arc<WorkflowDefinition>,
        store: StateStore,
        root_steps: Vec<StepDefinition>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            workflow_name: definition.name.clone(),
            status: InstanceStatus::Pending,
            store,
            frames: Frames::with_root(root_steps),
            pending: PendingQueue::default(),
            tracker: ExecutionTracker::default(),
            created_at: now,
            updated_at: now,
            last_step_id: None,
            error: None,
            last_result: None,
            definition,
            item_context: None,
            deadline: None,
            cancel_token: CancellationToken::new(),
            fanout: None,
        }
    }

    pub fn is_sub_agent(&self) -> bool {
        self.item_context.is_some()
    }

    /// Attempt a status transition, recording it in the tracker. Returns
    /// the unchanged current status on an illegal transition.
    pub fn try_transition(&mut self, to: InstanceStatus) -> Result<(), InstanceStatus> {
        if !self.status.can_transition_to(to) {
            return Err(self.status);
        }
        if self.status != to {
            self.tracker.record(TraceEvent::StatusChanged {
                from: self.status,
                to,
            });
            tracing::debug!(
                instance = self.id.as_str(),
                from = ?self.status,
                to = ?to,
                "status transition"
            );
            self.status = to;
        }
        self.touch();
        Ok(())
    }

    /// Mark the instance failed with a recorded error.
    pub fn fail(&mut self, mut error: WorkflowErrorInfo) {
        if error.step_id.is_none() {
            error.step_id = self.last_step_id.clone();
        }
        let trace_ref = self.tracker.record(TraceEvent::StepFailed {
            step_id: error.step_id.clone().unwrap_or_default(),
            error: error.message.clone(),
        });
        error.trace_ref = Some(format!("{}#{}", self.id, trace_ref));
        tracing::warn!(
            instance = self.id.as_str(),
            kind = ?error.kind,
            error = error.message.as_str(),
            "instance failed"
        );
        self.error = Some(error);
        // Cancellation is the only transition a terminal state admits, so
        // an already-terminal instance keeps its first error.
        let _ = self.try_transition(InstanceStatus::Failed);
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether a sub-agent deadline has passed.
    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Utc::now() > d)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use aromcp_types::error::ErrorKind;
    use aromcp_types::workflow::{StateSchema, StepConfig};
    use serde_json::Map;

    use crate::expression::ExpressionCache;

    fn minimal_definition() -> Arc<WorkflowDefinition> {
        Arc::new(WorkflowDefinition {
            name: "t".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            inputs: Default::default(),
            default_state: Map::new(),
            state_schema: StateSchema::default(),
            steps: vec![StepDefinition {
                id: "step_001".to_string(),
                config: StepConfig::WaitStep { message: None },
            }],
            sub_agent_tasks: Default::default(),
            config: Default::default(),
        })
    }

    fn instance() -> WorkflowInstance {
        let def = minimal_definition();
        let store = StateStore::new(
            Map::new(),
            Map::new(),
            &def.state_schema,
            Arc::new(ExpressionCache::new()),
        )
        .unwrap();
        let steps = def.steps.clone();
        WorkflowInstance::new(new_instance_id(), def, store, steps)
    }

    #[test]
    fn test_id_format() {
        let id = new_instance_id();
        assert!(id.starts_with("wf_"));
        assert_eq!(id.len(), 11);
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_ids_are_distinct() {
        let a = new_instance_id();
        let b = new_instance_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_transitions_enforced() {
        let mut inst = instance();
        assert_eq!(inst.status, InstanceStatus::Pending);
        inst.try_transition(InstanceStatus::Running).unwrap();
        inst.try_transition(InstanceStatus::WaitingForClient).unwrap();
        inst.try_transition(InstanceStatus::Running).unwrap();
        inst.try_transition(InstanceStatus::Completed).unwrap();
        // Terminal; only cancel is accepted (idempotently)
        assert!(inst.try_transition(InstanceStatus::Running).is_err());
    }

    #[test]
    fn test_fail_records_error_and_trace_ref() {
        let mut inst = instance();
        inst.try_transition(InstanceStatus::Running).unwrap();
        inst.last_step_id = Some("step_001".to_string());
        inst.fail(WorkflowErrorInfo::new(ErrorKind::StateAccess, "read-only tier"));
        assert_eq!(inst.status, InstanceStatus::Failed);
        let err = inst.error.as_ref().unwrap();
        assert_eq!(err.step_id.as_deref(), Some("step_001"));
        assert!(err.trace_ref.as_ref().unwrap().contains(&inst.id));
    }

    #[test]
    fn test_item_context_inputs() {
        let ctx = ItemContext {
            item: serde_json::json!("a.rs"),
            index: 2,
            total: 5,
            task_id: "review_file.item2".to_string(),
            parent_id: "wf_00000000".to_string(),
        };
        let inputs = ctx.as_inputs();
        assert_eq!(inputs["item"], serde_json::json!("a.rs"));
        assert_eq!(inputs["index"], serde_json::json!(2));
        assert_eq!(inputs["total"], serde_json::json!(5));
    }
}
