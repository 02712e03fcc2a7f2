//! Sub-agent coordination for `parallel_foreach`.
//!
//! A fan-out materializes one isolated `WorkflowInstance` per item
//! (`task_id = "<task_name>.item<N>"`). Clients drive sub-agents by polling
//! `get_next_step(id, task_id)`; a semaphore admits at most `max_parallel`
//! of them at a time, the rest wait in FIFO order. When every sub-agent is
//! terminal, the coordinator aggregates their final isolated `state` views
//! into the parent under `state.<task_name>_results` (overridable per task)
//! in a single transaction.
//!
//! In debug-serial mode the same fan-out executes one sub-agent at a time
//! on the main poller, interleaved with synthetic marker messages; because
//! sub-agents are isolated either way and the aggregation key is identical,
//! the parent's final state matches the parallel path byte for byte.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use aromcp_types::error::{ErrorKind, WorkflowErrorInfo};
use aromcp_types::workflow::{
    InstanceStatus, StepConfig, StepDefinition, SubAgentTask, WorkflowDefinition,
};

use crate::expression::ExpressionCache;
use crate::instance::{ItemContext, WorkflowInstance};
use crate::state::{ResolvedUpdate, ScopedPath, StateError, StateStore};
use crate::step::FanOutRequest;
use crate::tracker::TraceEvent;

// ---------------------------------------------------------------------------
// Fan-out state
// ---------------------------------------------------------------------------

/// One sub-agent of a fan-out.
pub struct SubAgentEntry {
    pub task_id: String,
    pub index: u64,
    pub instance: Arc<Mutex<WorkflowInstance>>,
    /// Execution-slot permit; held from first admission until terminal.
    pub permit: Option<OwnedSemaphorePermit>,
    /// Debug-serial: synthetic marker already emitted for this sub-agent.
    pub marker_emitted: bool,
}

impl std::fmt::Debug for SubAgentEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubAgentEntry")
            .field("task_id", &self.task_id)
            .field("index", &self.index)
            .field("admitted", &self.permit.is_some())
            .finish()
    }
}

/// Active `parallel_foreach` coordination state on a parent instance.
#[derive(Debug)]
pub struct FanOut {
    /// Id of the `parallel_foreach` step.
    pub step_id: String,
    pub task_name: String,
    /// Parent path the aggregated results land at.
    pub result_key: ScopedPath,
    pub entries: Vec<SubAgentEntry>,
    pub max_parallel: usize,
    /// Debug-serial: drive sub-agents from the main poller.
    pub serial: bool,
    pub aggregated: bool,
    semaphore: Arc<Semaphore>,
}

impl FanOut {
    pub fn entry(&self, task_id: &str) -> Option<&SubAgentEntry> {
        self.entries.iter().find(|e| e.task_id == task_id)
    }

    pub fn entry_mut(&mut self, task_id: &str) -> Option<&mut SubAgentEntry> {
        self.entries.iter_mut().find(|e| e.task_id == task_id)
    }

    /// Admit a sub-agent to execute, FIFO up to `max_parallel`. Returns
    /// false when no slot is free yet.
    pub fn admit(&mut self, task_id: &str) -> bool {
        let semaphore = Arc::clone(&self.semaphore);
        let Some(entry) = self.entry_mut(task_id) else {
            return false;
        };
        if entry.permit.is_some() {
            return true;
        }
        match semaphore.try_acquire_owned() {
            Ok(permit) => {
                entry.permit = Some(permit);
                true
            }
            Err(_) => false,
        }
    }

    /// Release a terminal sub-agent's slot.
    pub fn release(&mut self, task_id: &str) {
        if let Some(entry) = self.entry_mut(task_id) {
            entry.permit = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Fan-out construction
// ---------------------------------------------------------------------------

/// Materialize sub-agent instances for a resolved `parallel_foreach`.
///
/// Each sub-agent gets a fresh state store: the task's declared inputs are
/// bound from the parent scope and the current item, `default_state` is
/// applied, and computed fields recompute immediately.
pub fn build_fanout(
    request: &FanOutRequest,
    parent_id: &str,
    parent_token: &CancellationToken,
    parent_scope: &Map<String, Value>,
    definition: &Arc<WorkflowDefinition>,
    cache: &Arc<ExpressionCache>,
    serial: bool,
) -> Result<FanOut, WorkflowErrorInfo> {
    let task = definition
        .sub_agent_tasks
        .get(&request.task_name)
        .ok_or_else(|| {
            WorkflowErrorInfo::new(
                ErrorKind::Validation,
                format!("unknown sub-agent task '{}'", request.task_name),
            )
        })?;

    let result_key = match &task.result_key {
        Some(key) => ScopedPath::parse(key).map_err(|e| {
            WorkflowErrorInfo::new(ErrorKind::StateAccess, e.to_string())
        })?,
        None => ScopedPath::parse(&format!("state.{}_results", request.task_name))
            .expect("generated path is valid"),
    };

    let total = request.items.len() as u64;
    let mut entries = Vec::with_capacity(request.items.len());
    for (i, item) in request.items.iter().enumerate() {
        let task_id = format!("{}.item{}", request.task_name, i);
        let context = ItemContext {
            item: item.clone(),
            index: i as u64,
            total,
            task_id: task_id.clone(),
            parent_id: parent_id.to_string(),
        };
        let instance = build_sub_agent(
            task,
            &request.task_name,
            context,
            parent_token,
            parent_scope,
            definition,
            cache,
            request.timeout_seconds,
        )?;
        entries.push(SubAgentEntry {
            task_id,
            index: i as u64,
            instance: Arc::new(Mutex::new(instance)),
            permit: None,
            marker_emitted: false,
        });
    }

    let max_parallel = if serial { 1 } else { request.max_parallel };
    Ok(FanOut {
        step_id: request.step_id.clone(),
        task_name: request.task_name.clone(),
        result_key,
        entries,
        max_parallel,
        serial,
        aggregated: false,
        semaphore: Arc::new(Semaphore::new(max_parallel)),
    })
}

#[allow(clippy::too_many_arguments)]
fn build_sub_agent(
    task: &SubAgentTask,
    task_name: &str,
    context: ItemContext,
    parent_token: &CancellationToken,
    parent_scope: &Map<String, Value>,
    definition: &Arc<WorkflowDefinition>,
    cache: &Arc<ExpressionCache>,
    timeout_seconds: Option<u64>,
) -> Result<WorkflowInstance, WorkflowErrorInfo> {
    // Declared inputs bind from the item context first, then the parent
    // scope, then declared defaults.
    let standard = context.as_inputs();
    let mut inputs = Map::new();
    for (name, spec) in &task.inputs {
        let value = standard
            .get(name)
            .or_else(|| parent_scope.get(name))
            .cloned()
            .or_else(|| spec.default.clone());
        match value {
            Some(value) => {
                inputs.insert(name.clone(), value);
            }
            None if spec.required => {
                return Err(WorkflowErrorInfo::new(
                    ErrorKind::Validation,
                    format!(
                        "sub-agent task '{task_name}' input '{name}' cannot be bound"
                    ),
                ));
            }
            None => {}
        }
    }
    for (name, value) in standard {
        inputs.entry(name).or_insert(value);
    }

    let store = StateStore::new(
        inputs,
        task.default_state.clone(),
        &task.state_schema,
        Arc::clone(cache),
    )
    .map_err(|e| WorkflowErrorInfo::new(ErrorKind::StateAccess, e.to_string()))?;

    let steps = match (&task.steps, &task.prompt_template) {
        (Some(steps), _) => steps.clone(),
        (None, Some(template)) => vec![StepDefinition {
            id: "step_001".to_string(),
            config: StepConfig::AgentPrompt {
                prompt: template.clone(),
                expected_response: None,
            },
        }],
        (None, None) => {
            return Err(WorkflowErrorInfo::new(
                ErrorKind::Validation,
                format!("sub-agent task '{task_name}' has no steps or prompt_template"),
            ));
        }
    };

    let mut instance = WorkflowInstance::new(
        context.task_id.clone(),
        Arc::clone(definition),
        store,
        steps,
    );
    instance.deadline = timeout_seconds
        .map(|secs| Utc::now() + ChronoDuration::seconds(secs as i64));
    // Cancelling the parent cancels every sub-agent through this token
    instance.cancel_token = parent_token.child_token();
    instance.item_context = Some(context);
    Ok(instance)
}

// ---------------------------------------------------------------------------
// Aggregation barrier
// ---------------------------------------------------------------------------

/// Try to aggregate a parent's fan-out. Returns the results array when all
/// sub-agents are terminal and aggregation committed, `None` while any is
/// still running. Expired sub-agents are failed with a timeout here so a
/// never-polled straggler cannot hold the barrier forever.
pub async fn try_aggregate(
    parent: &mut WorkflowInstance,
) -> Result<Option<Value>, StateError> {
    let Some(fanout) = &parent.fanout else {
        return Ok(None);
    };
    if fanout.aggregated {
        return Ok(None);
    }

    // Barrier check (parent -> child lock order)
    let mut results = Vec::with_capacity(fanout.entries.len());
    for entry in &fanout.entries {
        let mut child = entry.instance.lock().await;
        if !child.status.is_terminal() && child.deadline_exceeded() {
            child.fail(WorkflowErrorInfo::new(
                ErrorKind::Timeout,
                format!("sub-agent '{}' timed out", entry.task_id),
            ));
        }
        if !child.status.is_terminal() {
            return Ok(None);
        }
        results.push(match child.status {
            InstanceStatus::Completed => {
                let mut view = child.store.state_tier().clone();
                view.insert("ok".to_string(), Value::Bool(true));
                Value::Object(view)
            }
            _ => {
                let message = child
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| format!("sub-agent {:?}", child.status));
                json!({ "ok": false, "error": message })
            }
        });
    }

    let results = Value::Array(results);
    let fanout = parent.fanout.as_mut().expect("checked above");
    fanout.aggregated = true;
    let result_key = fanout.result_key.clone();
    let task_name = fanout.task_name.clone();

    let records = parent
        .store
        .apply_updates(&[ResolvedUpdate::set(result_key, results.clone())])?;
    for record in records {
        parent.tracker.record(TraceEvent::StateWrite {
            path: record.path,
            before: record.before,
            after: record.after,
        });
    }
    tracing::info!(
        parent = parent.id.as_str(),
        task = task_name.as_str(),
        count = results.as_array().map(Vec::len).unwrap_or(0),
        "sub-agent fan-out aggregated"
    );

    Ok(Some(results))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
