//! The public engine facade.
//!
//! `WorkflowEngine` owns the definition registry and all live instances,
//! and implements the client-facing API: `start`, `get_next_step`,
//! `step_complete`, `update_state`, `pause`/`resume`/`cancel`, `status`,
//! `list_workflows`, `get_info`, and `list_sub_agents`.
//!
//! Concurrency model: instances run in parallel, but each instance is
//! advanced by at most one caller at a time via its own async mutex (fair
//! FIFO). Sub-agents carry their own mutexes; lock order is always parent
//! before child, and parent locks are released before a child drive, so
//! sibling sub-agents poll concurrently.

mod scheduler;

use std::sync::Arc;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use aromcp_types::api::{
    StatusRecord, StepPayload, SubAgentSummary, Progress, WorkflowInfo, WorkflowSummary,
};
use aromcp_types::error::{ErrorKind, WorkflowErrorInfo};
use aromcp_types::workflow::{
    InstanceStatus, StateUpdate, WorkflowDefinition,
};

use crate::config::EngineConfig;
use crate::definition::{self, DefinitionError};
use crate::expression::ExpressionCache;
use crate::instance::{new_instance_id, WorkflowInstance};
use crate::state::{ResolvedUpdate, ScopedPath, StateError, StateStore};
use crate::step::{StepRegistry, ToolDispatcher};
use crate::tracker::TraceEvent;

use chrono::{Duration as ChronoDuration, Utc};
use scheduler::{drive, DriveDeps, DriveOutcome};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by the engine API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    #[error("unknown instance '{0}'")]
    UnknownInstance(String),

    #[error("unknown sub-agent '{0}'")]
    UnknownSubAgent(String),

    #[error("invalid inputs: {0}")]
    InvalidInputs(String),

    #[error("instance '{id}' cannot {action} while {status:?}")]
    IllegalTransition {
        id: String,
        action: &'static str,
        status: InstanceStatus,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

type SharedInstance = Arc<Mutex<WorkflowInstance>>;

/// The workflow orchestration engine.
pub struct WorkflowEngine {
    config: EngineConfig,
    cache: Arc<ExpressionCache>,
    registry: StepRegistry,
    tools: Option<Arc<dyn ToolDispatcher>>,
    definitions: DashMap<String, Arc<WorkflowDefinition>>,
    instances: DashMap<String, SharedInstance>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            cache: Arc::new(ExpressionCache::new()),
            registry: StepRegistry::with_defaults(),
            tools: None,
            definitions: DashMap::new(),
            instances: DashMap::new(),
        }
    }

    /// Attach a server-side tool dispatcher for `mcp_call` steps with
    /// `execution_context: server`.
    pub fn with_tools(mut self, tools: Arc<dyn ToolDispatcher>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -- Definition registry ----------------------------------------------

    /// Load every workflow YAML under the configured directory.
    pub fn load_directory(&self) -> Result<usize, EngineError> {
        let found = definition::discover_workflows(&self.config.workflow_dir)?;
        let count = found.len();
        for (path, def) in found {
            tracing::debug!(?path, workflow = def.name.as_str(), "registered workflow");
            self.definitions.insert(def.name.clone(), Arc::new(def));
        }
        Ok(count)
    }

    /// Validate and register a definition directly (API uploads, tests).
    pub fn register_workflow(
        &self,
        mut def: WorkflowDefinition,
    ) -> Result<(), EngineError> {
        definition::validate_definition(&mut def)?;
        self.definitions.insert(def.name.clone(), Arc::new(def));
        Ok(())
    }

    pub fn list_workflows(&self) -> Vec<WorkflowSummary> {
        let mut summaries: Vec<WorkflowSummary> = self
            .definitions
            .iter()
            .map(|entry| WorkflowSummary {
                name: entry.name.clone(),
                version: entry.version.clone(),
                description: entry.description.clone(),
                inputs_schema: entry.inputs.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub fn get_info(&self, name: &str) -> Option<WorkflowInfo> {
        self.definitions.get(name).map(|def| WorkflowInfo {
            name: def.name.clone(),
            version: def.version.clone(),
            description: def.description.clone(),
            inputs: def.inputs.clone(),
            config: def.config.clone(),
            total_steps: def.steps.len(),
            sub_agent_tasks: {
                let mut tasks: Vec<String> = def.sub_agent_tasks.keys().cloned().collect();
                tasks.sort();
                tasks
            },
        })
    }

    // -- Lifecycle --------------------------------------------------------

    /// Start a workflow: validate inputs, initialise tiers, queue root
    /// steps, and transition to Running.
    pub fn start(
        &self,
        workflow_name: &str,
        inputs: Map<String, Value>,
    ) -> Result<String, EngineError> {
        let def = self
            .definitions
            .get(workflow_name)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow_name.to_string()))?;

        let inputs = validate_inputs(&def, inputs)?;
        let store = StateStore::new(
            inputs,
            def.default_state.clone(),
            &def.state_schema,
            Arc::clone(&self.cache),
        )?;

        let mut instance = WorkflowInstance::new(
            new_instance_id(),
            Arc::clone(&def),
            store,
            def.steps.clone(),
        );
        let timeout = def
            .config
            .timeout_seconds
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs as i64));
        instance.deadline = timeout;
        instance
            .try_transition(InstanceStatus::Running)
            .expect("pending to running");

        // Insert under a unique id, retrying on collision
        loop {
            let id = instance.id.clone();
            match self.instances.entry(id.clone()) {
                MapEntry::Vacant(slot) => {
                    tracing::info!(
                        instance = id.as_str(),
                        workflow = workflow_name,
                        "workflow started"
                    );
                    slot.insert(Arc::new(Mutex::new(instance)));
                    return Ok(id);
                }
                MapEntry::Occupied(_) => {
                    instance.id = new_instance_id();
                }
            }
        }
    }

    fn instance(&self, id: &str) -> Result<SharedInstance, EngineError> {
        self.instances
            .get(id)
            .map(|entry| Arc::clone(&entry))
            .ok_or_else(|| EngineError::UnknownInstance(id.to_string()))
    }

    fn deps<'a>(
        &'a self,
        global_view: Option<Map<String, Value>>,
        step_id_prefix: String,
    ) -> DriveDeps<'a> {
        DriveDeps {
            registry: &self.registry,
            cache: &self.cache,
            tools: self.tools.as_deref(),
            config: &self.config,
            global_view,
            step_id_prefix,
        }
    }

    // -- Polling ----------------------------------------------------------

    /// Advance the targeted instance (or sub-agent) and return the next
    /// client-visible step, or `None` when it is terminal.
    pub async fn get_next_step(
        &self,
        id: &str,
        task_id: Option<&str>,
    ) -> Result<Option<StepPayload>, EngineError> {
        let shared = self.instance(id)?;
        match task_id {
            Some(task_id) => self.poll_sub_agent(&shared, task_id).await,
            None => self.poll_root(&shared).await,
        }
    }

    async fn poll_root(
        &self,
        shared: &SharedInstance,
    ) -> Result<Option<StepPayload>, EngineError> {
        // Serial fan-out: the main poller drives sub-agents inline
        let serial_target = {
            let mut parent = shared.lock().await;
            self.serial_fanout_target(&mut parent).await?
        };
        if let Some(payload) = serial_target {
            return Ok(Some(payload));
        }

        let mut parent = shared.lock().await;
        let deps = self.deps(None, String::new());
        Ok(match drive(&mut parent, &deps).await {
            DriveOutcome::Emitted(payload) => Some(payload),
            DriveOutcome::Terminal | DriveOutcome::Paused => None,
        })
    }

    /// In debug-serial mode, produce the next inline sub-agent emission
    /// (marker or step) while the fan-out is unfinished.
    async fn serial_fanout_target(
        &self,
        parent: &mut WorkflowInstance,
    ) -> Result<Option<StepPayload>, EngineError> {
        loop {
            let Some(fanout) = &parent.fanout else {
                return Ok(None);
            };
            if !fanout.serial || fanout.aggregated || parent.status.is_terminal() {
                return Ok(None);
            }

            // First non-terminal entry, in item order
            let mut target = None;
            for entry in &fanout.entries {
                let child = entry.instance.lock().await;
                if !child.status.is_terminal() {
                    target = Some((
                        entry.task_id.clone(),
                        Arc::clone(&entry.instance),
                        entry.marker_emitted,
                    ));
                    break;
                }
            }
            let Some((task_id, child_shared, marker_emitted)) = target else {
                // All terminal: fall through to the parent drive, which
                // aggregates at the barrier
                return Ok(None);
            };

            if !marker_emitted {
                let fanout = parent.fanout.as_mut().expect("checked above");
                if let Some(entry) = fanout.entry_mut(&task_id) {
                    entry.marker_emitted = true;
                }
                let total = fanout.entries.len();
                let index = fanout
                    .entry(&task_id)
                    .map(|e| e.index + 1)
                    .unwrap_or_default();
                return Ok(Some(serial_marker_payload(&task_id, index, total)));
            }

            let global_view = parent.store.this_view()?;
            let mut child = child_shared.lock().await;
            let deps = self.deps(Some(global_view), format!("{task_id}:"));
            match drive(&mut child, &deps).await {
                DriveOutcome::Emitted(payload) => return Ok(Some(payload)),
                DriveOutcome::Paused => return Ok(None),
                DriveOutcome::Terminal => {
                    let status = child.status;
                    drop(child);
                    parent.tracker.record(TraceEvent::SubAgentFinished {
                        task_id: task_id.clone(),
                        status,
                    });
                    if let Some(fanout) = parent.fanout.as_mut() {
                        fanout.release(&task_id);
                    }
                    // Loop to the next entry
                }
            }
        }
    }

    async fn poll_sub_agent(
        &self,
        shared: &SharedInstance,
        task_id: &str,
    ) -> Result<Option<StepPayload>, EngineError> {
        // Parent lock held only long enough to admit and snapshot
        let (child_shared, admitted, global_view) = {
            let mut parent = shared.lock().await;
            let global_view = parent.store.this_view()?;
            let Some(fanout) = parent.fanout.as_mut() else {
                return Err(EngineError::UnknownSubAgent(task_id.to_string()));
            };
            let admitted = fanout.admit(task_id);
            let entry = fanout
                .entry(task_id)
                .ok_or_else(|| EngineError::UnknownSubAgent(task_id.to_string()))?;
            (Arc::clone(&entry.instance), admitted, global_view)
        };

        if !admitted {
            // FIFO waiting for an execution slot
            return Ok(Some(queued_payload(task_id)));
        }

        let mut child = child_shared.lock().await;
        let deps = self.deps(Some(global_view), format!("{task_id}:"));
        let outcome = drive(&mut child, &deps).await;
        let terminal = child.status.is_terminal();
        let status = child.status;
        drop(child);

        if terminal {
            let mut parent = shared.lock().await;
            parent.tracker.record(TraceEvent::SubAgentFinished {
                task_id: task_id.to_string(),
                status,
            });
            if let Some(fanout) = parent.fanout.as_mut() {
                fanout.release(task_id);
            }
        }

        Ok(match outcome {
            DriveOutcome::Emitted(payload) => Some(payload),
            DriveOutcome::Terminal | DriveOutcome::Paused => None,
        })
    }

    /// Attach a client result to the outstanding step of an instance or
    /// sub-agent. Returns false for a stale or unknown step id.
    pub async fn step_complete(
        &self,
        id: &str,
        step_id: &str,
        result: Value,
        task_id: Option<&str>,
    ) -> Result<bool, EngineError> {
        let shared = self.instance(id)?;
        match task_id {
            None => {
                let mut instance = shared.lock().await;
                Ok(instance.pending.complete(step_id, result))
            }
            Some(task_id) => {
                let child_shared = {
                    let parent = shared.lock().await;
                    let fanout = parent
                        .fanout
                        .as_ref()
                        .ok_or_else(|| EngineError::UnknownSubAgent(task_id.to_string()))?;
                    let entry = fanout
                        .entry(task_id)
                        .ok_or_else(|| EngineError::UnknownSubAgent(task_id.to_string()))?;
                    Arc::clone(&entry.instance)
                };
                let mut child = child_shared.lock().await;
                // Sub-agent payload ids carry the task prefix
                let bare = step_id
                    .strip_prefix(&format!("{task_id}:"))
                    .unwrap_or(step_id);
                Ok(child.pending.complete(bare, result))
            }
        }
    }

    // -- State API --------------------------------------------------------

    /// Apply update operations and return the new flattened view.
    pub async fn update_state(
        &self,
        id: &str,
        ops: &[StateUpdate],
    ) -> Result<Map<String, Value>, EngineError> {
        let shared = self.instance(id)?;
        let mut instance = shared.lock().await;

        let resolved = ops
            .iter()
            .map(|op| {
                ScopedPath::parse(&op.path).map(|path| ResolvedUpdate {
                    path,
                    operation: op.operation,
                    value: op.value.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for update in &resolved {
            if update.path.legacy {
                instance.tracker.warn_legacy_path(&update.path.display());
            }
        }
        let records = instance.store.apply_updates(&resolved)?;
        for record in records {
            instance.tracker.record(TraceEvent::StateWrite {
                path: record.path,
                before: record.before,
                after: record.after,
            });
        }
        instance.touch();
        Ok(instance.store.flattened(&Default::default())?)
    }

    // -- Transitions ------------------------------------------------------

    /// Pause a running (or client-waiting) instance, preserving queue
    /// positions.
    pub async fn pause(&self, id: &str) -> Result<InstanceStatus, EngineError> {
        let shared = self.instance(id)?;
        let mut instance = shared.lock().await;
        if instance.status == InstanceStatus::WaitingForClient {
            let _ = instance.try_transition(InstanceStatus::Running);
        }
        instance
            .try_transition(InstanceStatus::Paused)
            .map_err(|status| EngineError::IllegalTransition {
                id: id.to_string(),
                action: "pause",
                status,
            })?;
        Ok(instance.status)
    }

    pub async fn resume(&self, id: &str) -> Result<InstanceStatus, EngineError> {
        let shared = self.instance(id)?;
        let mut instance = shared.lock().await;
        instance
            .try_transition(InstanceStatus::Running)
            .map_err(|status| EngineError::IllegalTransition {
                id: id.to_string(),
                action: "resume",
                status,
            })?;
        Ok(instance.status)
    }

    /// Cancel an instance and all of its sub-agents. Idempotent: a second
    /// cancel (or a cancel on a finished instance) is a no-op.
    ///
    /// The cancellation token is signalled first, so any sub-agent not
    /// marked here (e.g. one being driven concurrently) still observes the
    /// cancellation at its next scheduler touchpoint via its child token.
    pub async fn cancel(&self, id: &str) -> Result<InstanceStatus, EngineError> {
        let shared = self.instance(id)?;
        let mut instance = shared.lock().await;
        if instance.status.is_terminal() {
            return Ok(instance.status);
        }
        instance.cancel_token.cancel();
        let _ = instance.try_transition(InstanceStatus::Cancelled);
        instance.error = Some(WorkflowErrorInfo::new(
            ErrorKind::Cancelled,
            "cancelled by request",
        ));
        tracing::info!(instance = id, "workflow cancelled");

        if let Some(fanout) = &instance.fanout {
            for entry in &fanout.entries {
                let mut child = entry.instance.lock().await;
                if !child.status.is_terminal() {
                    let _ = child.try_transition(InstanceStatus::Cancelled);
                }
            }
        }
        Ok(instance.status)
    }

    // -- Introspection ----------------------------------------------------

    pub async fn status(&self, id: &str) -> Result<StatusRecord, EngineError> {
        let shared = self.instance(id)?;
        let instance = shared.lock().await;

        let (total, finished) = match &instance.fanout {
            Some(fanout) => {
                let mut finished = 0u64;
                for entry in &fanout.entries {
                    if entry.instance.lock().await.status.is_terminal() {
                        finished += 1;
                    }
                }
                (fanout.entries.len() as u64, finished)
            }
            None => (0, 0),
        };

        Ok(StatusRecord {
            state: instance.status,
            progress: Progress {
                steps_completed: instance.tracker.steps_completed(),
                sub_agents_total: total,
                sub_agents_finished: finished,
            },
            current_step_id: instance.last_step_id.clone(),
            error: instance.error.clone(),
        })
    }

    pub async fn list_sub_agents(
        &self,
        id: &str,
    ) -> Result<Vec<SubAgentSummary>, EngineError> {
        let shared = self.instance(id)?;
        let instance = shared.lock().await;
        let Some(fanout) = &instance.fanout else {
            return Ok(Vec::new());
        };
        let mut summaries = Vec::with_capacity(fanout.entries.len());
        for entry in &fanout.entries {
            let child = entry.instance.lock().await;
            summaries.push(SubAgentSummary {
                task_id: entry.task_id.clone(),
                status: child.status,
                item_index: entry.index,
                error: child.error.clone(),
                created_at: child.created_at,
            });
        }
        Ok(summaries)
    }

    /// Export an instance's execution trace for diagnostics.
    pub async fn export_trace(
        &self,
        id: &str,
    ) -> Result<Vec<crate::tracker::TraceEntry>, EngineError> {
        let shared = self.instance(id)?;
        let instance = shared.lock().await;
        Ok(instance.tracker.export())
    }
}

// ---------------------------------------------------------------------------
// Input validation
// ---------------------------------------------------------------------------

/// Validate provided inputs against the declared schema, applying defaults.
fn validate_inputs(
    def: &WorkflowDefinition,
    mut provided: Map<String, Value>,
) -> Result<Map<String, Value>, EngineError> {
    let mut inputs = Map::new();
    for (name, spec) in &def.inputs {
        match provided.remove(name) {
            Some(value) => {
                if !spec.value_type.matches(&value) {
                    return Err(EngineError::InvalidInputs(format!(
                        "input '{name}' has the wrong type"
                    )));
                }
                inputs.insert(name.clone(), value);
            }
            None => match &spec.default {
                Some(default) => {
                    inputs.insert(name.clone(), default.clone());
                }
                None if spec.required => {
                    return Err(EngineError::InvalidInputs(format!(
                        "missing required input '{name}'"
                    )));
                }
                None => {}
            },
        }
    }
    // Undeclared extras pass through untouched
    for (name, value) in provided {
        inputs.insert(name, value);
    }
    Ok(inputs)
}

// ---------------------------------------------------------------------------
// Synthetic payloads
// ---------------------------------------------------------------------------

fn queued_payload(task_id: &str) -> StepPayload {
    StepPayload {
        id: format!("{task_id}:queued"),
        step_type: "wait_step".to_string(),
        definition: serde_json::json!({
            "message": "waiting for an execution slot, poll again",
        }),
        context: Default::default(),
    }
}

fn serial_marker_payload(task_id: &str, position: u64, total: usize) -> StepPayload {
    StepPayload {
        id: format!("{task_id}:marker"),
        step_type: "user_message".to_string(),
        definition: serde_json::json!({
            "message": format!("Executing sub-agent '{task_id}' ({position}/{total})"),
            "message_type": "info",
            "format": "text",
        }),
        context: Default::default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
