//! The per-instance drive loop.
//!
//! `drive` advances one instance inside a single `get_next_step` call:
//! it consumes the result of the previously emitted step, then drains
//! immediate/expand steps, coalesces consecutive user messages, and stops
//! at the first suspending step. At most one suspending step is returned
//! per poll. Within one instance the loop is strictly sequential, which is
//! what makes tiers and frames race-free without fine-grained locking.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use aromcp_types::api::{LoopBindings, StepPayload};
use aromcp_types::error::{ErrorKind, WorkflowErrorInfo};
use aromcp_types::workflow::{InstanceStatus, StepConfig, StepDefinition};

use crate::config::EngineConfig;
use crate::expression::ExpressionCache;
use crate::frames::{ExecutionFrame, LoopKind};
use crate::instance::WorkflowInstance;
use crate::queue::{self, AwaitingStep, QueueMode};
use crate::state::{FlattenExtras, ResolvedUpdate, ScopedPath, StateError};
use crate::step::{
    finish_tool_call, validate_user_input, ControlEffect, DispatchContext, Outcome,
    StepRegistry, ToolDispatcher,
};
use crate::subagent;
use crate::tracker::TraceEvent;

// ---------------------------------------------------------------------------
// Drive dependencies & outcome
// ---------------------------------------------------------------------------

/// Engine-level context threaded into a drive.
pub(crate) struct DriveDeps<'a> {
    pub registry: &'a StepRegistry,
    pub cache: &'a Arc<ExpressionCache>,
    pub tools: Option<&'a dyn ToolDispatcher>,
    pub config: &'a EngineConfig,
    /// Root `this` view for sub-agent drives (`global.*`).
    pub global_view: Option<Map<String, Value>>,
    /// `<task_id>:` for sub-agent payloads, empty for roots.
    pub step_id_prefix: String,
}

/// What one drive produced.
#[derive(Debug)]
pub(crate) enum DriveOutcome {
    /// One client-visible emission (single step or coalesced batch).
    Emitted(StepPayload),
    /// The instance is terminal; the poll returns null.
    Terminal,
    /// The instance is paused; queue positions are preserved.
    Paused,
}

enum Consumed {
    Proceed,
    Reemit(StepPayload),
    Failed,
}

// ---------------------------------------------------------------------------
// Drive loop
// ---------------------------------------------------------------------------

pub(crate) async fn drive(
    instance: &mut WorkflowInstance,
    deps: &DriveDeps<'_>,
) -> DriveOutcome {
    if instance.status.is_terminal() {
        return DriveOutcome::Terminal;
    }
    if observe_cancellation(instance) {
        return DriveOutcome::Terminal;
    }
    if instance.status == InstanceStatus::Paused {
        return DriveOutcome::Paused;
    }
    if instance.deadline_exceeded() {
        instance.fail(WorkflowErrorInfo::new(
            ErrorKind::Timeout,
            format!("'{}' exceeded its deadline", instance.id),
        ));
        return DriveOutcome::Terminal;
    }
    let _ = instance.try_transition(InstanceStatus::Running);

    // Consume the result of the previously emitted step, if any
    if let Some(awaiting) = instance.pending.take_awaiting() {
        match consume_awaiting(instance, awaiting, deps).await {
            Consumed::Proceed => {}
            Consumed::Reemit(payload) => {
                let _ = instance.try_transition(InstanceStatus::WaitingForClient);
                return DriveOutcome::Emitted(payload);
            }
            Consumed::Failed => return DriveOutcome::Terminal,
        }
    }

    loop {
        if instance.status.is_terminal() {
            return DriveOutcome::Terminal;
        }
        if observe_cancellation(instance) {
            return DriveOutcome::Terminal;
        }
        if instance.status == InstanceStatus::Paused {
            return DriveOutcome::Paused;
        }

        // Workflow finished: flush trailing messages, then complete
        if instance.frames.call_stack.is_empty() {
            if instance.pending.has_batch() {
                let payload = merge_batch(instance.pending.flush_batch());
                let _ = instance.try_transition(InstanceStatus::WaitingForClient);
                return DriveOutcome::Emitted(payload);
            }
            let _ = instance.try_transition(InstanceStatus::Completed);
            tracing::info!(instance = instance.id.as_str(), "workflow completed");
            return DriveOutcome::Terminal;
        }

        // Exhausted frame: pop, advancing its owning loop if it was a body
        let top = instance.frames.call_stack.len() - 1;
        if instance.frames.call_stack[top].exhausted() {
            let frame = instance.frames.call_stack.pop().expect("non-empty");
            if let Some(loop_idx) = frame.owning_loop {
                if advance_loop(instance, loop_idx, deps).is_err() {
                    return DriveOutcome::Terminal;
                }
            }
            continue;
        }

        let step = instance.frames.call_stack[top]
            .current()
            .expect("cursor in range")
            .clone();
        let mode = queue::mode_of(&step.config);

        // A coalesced batch is emitted before any non-batch step runs
        if instance.pending.has_batch() && mode != QueueMode::Batch {
            let payload = merge_batch(instance.pending.flush_batch());
            let _ = instance.try_transition(InstanceStatus::WaitingForClient);
            return DriveOutcome::Emitted(payload);
        }

        // The cursor moves past the step now; suspended steps resume via
        // the awaiting entry, never by re-dispatching.
        instance.frames.call_stack[top].cursor += 1;
        instance.last_step_id = Some(step.id.clone());
        instance.tracker.record(TraceEvent::StepStarted {
            step_id: step.id.clone(),
            step_type: step.config.type_tag().to_string(),
        });

        let outcome = match dispatch_step(instance, &step, deps).await {
            Ok(outcome) => outcome,
            Err(()) => return DriveOutcome::Terminal,
        };

        match outcome {
            Outcome::Emit(payload) => match mode {
                QueueMode::Batch => {
                    instance.pending.push_batch(payload);
                    instance.tracker.record(TraceEvent::StepCompleted {
                        step_id: step.id.clone(),
                    });
                }
                QueueMode::Wait => {
                    instance.tracker.record(TraceEvent::StepCompleted {
                        step_id: step.id.clone(),
                    });
                    let _ = instance.try_transition(InstanceStatus::WaitingForClient);
                    return DriveOutcome::Emitted(payload);
                }
                _ => {
                    instance.pending.set_awaiting(AwaitingStep {
                        step_id: step.id.clone(),
                        step: step.clone(),
                        payload: payload.clone(),
                        result: None,
                        attempts: 0,
                    });
                    let _ = instance.try_transition(InstanceStatus::WaitingForClient);
                    return DriveOutcome::Emitted(payload);
                }
            },
            Outcome::Complete {
                updates,
                result,
                control,
            } => {
                if apply_updates_traced(instance, &updates).is_err() {
                    return DriveOutcome::Terminal;
                }
                if let Some(result) = result {
                    instance.last_result = Some(result);
                }
                instance.tracker.record(TraceEvent::StepCompleted {
                    step_id: step.id.clone(),
                });
                if let Some(effect) = control {
                    match apply_control(instance, &step, effect, deps).await {
                        Ok(Some(payload)) => {
                            let _ =
                                instance.try_transition(InstanceStatus::WaitingForClient);
                            return DriveOutcome::Emitted(payload);
                        }
                        Ok(None) => {}
                        Err(()) => return DriveOutcome::Terminal,
                    }
                }
            }
            Outcome::Fail(err) => {
                instance.fail(err.at_step(step.id.clone()));
                return DriveOutcome::Terminal;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Step dispatch
// ---------------------------------------------------------------------------

async fn dispatch_step(
    instance: &mut WorkflowInstance,
    step: &StepDefinition,
    deps: &DriveDeps<'_>,
) -> Result<Outcome, ()> {
    let scope = build_scope(instance, deps)?;
    let definition = Arc::clone(&instance.definition);
    let last_result = instance.last_result.clone();

    let Some(handler) = deps.registry.get(step.config.type_tag()) else {
        instance.fail(
            WorkflowErrorInfo::new(
                ErrorKind::Internal,
                format!("no handler registered for '{}'", step.config.type_tag()),
            )
            .at_step(step.id.clone()),
        );
        return Err(());
    };

    let ctx = DispatchContext {
        scope,
        cache: deps.cache,
        last_result: last_result.as_ref(),
        tools: deps.tools,
        loop_bindings: loop_bindings(instance),
        step_id_prefix: &deps.step_id_prefix,
        definition: &definition,
        default_max_iterations: deps.config.default_max_iterations,
    };
    Ok(handler.dispatch(step, &ctx).await)
}

fn loop_bindings(instance: &WorkflowInstance) -> Option<LoopBindings> {
    let frame = instance.frames.innermost_loop()?;
    let bindings = frame.bindings();
    Some(LoopBindings {
        item: bindings.get("item").cloned().unwrap_or(Value::Null),
        index: bindings
            .get("index")
            .and_then(Value::as_u64)
            .unwrap_or_default(),
        iteration: bindings
            .get("iteration")
            .and_then(Value::as_u64)
            .unwrap_or_default(),
    })
}

fn build_scope(
    instance: &mut WorkflowInstance,
    deps: &DriveDeps<'_>,
) -> Result<Map<String, Value>, ()> {
    let extras = FlattenExtras {
        loop_scope: instance.frames.loop_bindings(),
        variables: instance.frames.variable_bindings(),
        global_view: deps.global_view.clone(),
    };
    match instance.store.flattened(&extras) {
        Ok(scope) => Ok(scope),
        Err(err) => {
            fail_state(instance, err);
            Err(())
        }
    }
}

/// A cancelled token is observed here, the scheduler's touchpoint: the
/// instance transitions to Cancelled and stops advancing. In-flight client
/// steps are not force-terminated; a result arriving later is discarded.
fn observe_cancellation(instance: &mut WorkflowInstance) -> bool {
    if !instance.cancel_token.is_cancelled() {
        return false;
    }
    if instance.error.is_none() {
        instance.error = Some(WorkflowErrorInfo::new(
            ErrorKind::Cancelled,
            "cancelled by request",
        ));
    }
    let _ = instance.try_transition(InstanceStatus::Cancelled);
    tracing::debug!(instance = instance.id.as_str(), "cancellation observed");
    true
}

fn fail_state(instance: &mut WorkflowInstance, err: StateError) {
    let kind = match err {
        StateError::ComputedFailed { .. } => ErrorKind::Evaluation,
        _ => ErrorKind::StateAccess,
    };
    instance.fail(WorkflowErrorInfo::new(kind, err.to_string()));
}

/// Apply updates through the store, tracing writes and legacy spellings.
fn apply_updates_traced(
    instance: &mut WorkflowInstance,
    updates: &[ResolvedUpdate],
) -> Result<(), ()> {
    if updates.is_empty() {
        return Ok(());
    }
    for update in updates {
        if update.path.legacy {
            instance.tracker.warn_legacy_path(&update.path.display());
        }
    }
    match instance.store.apply_updates(updates) {
        Ok(records) => {
            for record in records {
                instance.tracker.record(TraceEvent::StateWrite {
                    path: record.path,
                    before: record.before,
                    after: record.after,
                });
            }
            Ok(())
        }
        Err(err) => {
            fail_state(instance, err);
            Err(())
        }
    }
}

// ---------------------------------------------------------------------------
// Control effects
// ---------------------------------------------------------------------------

/// Apply a control effect. `Ok(Some(payload))` means the effect suspended
/// the instance (fan-out emission).
async fn apply_control(
    instance: &mut WorkflowInstance,
    step: &StepDefinition,
    effect: ControlEffect,
    deps: &DriveDeps<'_>,
) -> Result<Option<StepPayload>, ()> {
    match effect {
        ControlEffect::Branch {
            condition,
            taken,
            steps,
        } => {
            instance.tracker.record(TraceEvent::Decision {
                step_id: step.id.clone(),
                condition,
                result: taken,
            });
            if !steps.is_empty() {
                instance
                    .frames
                    .call_stack
                    .push(ExecutionFrame::for_branch(steps, &step.id));
            }
            Ok(None)
        }
        ControlEffect::EnterLoop(frame) => {
            if let Some(condition) = &frame.condition {
                instance.tracker.record(TraceEvent::Decision {
                    step_id: step.id.clone(),
                    condition: condition.clone(),
                    result: true,
                });
            }
            let body = frame.body.clone();
            instance.frames.loop_stack.push(frame);
            let loop_idx = instance.frames.loop_stack.len() - 1;
            instance.tracker.record(TraceEvent::LoopIteration {
                step_id: step.id.clone(),
                iteration: 1,
            });
            instance
                .frames
                .call_stack
                .push(ExecutionFrame::for_loop_body(body, loop_idx, &step.id));
            Ok(None)
        }
        ControlEffect::SkipLoop { condition } => {
            instance.tracker.record(TraceEvent::Decision {
                step_id: step.id.clone(),
                condition,
                result: false,
            });
            Ok(None)
        }
        ControlEffect::Break => match instance.frames.unwind_to_innermost_loop() {
            Some(loop_idx) => {
                instance.frames.loop_stack[loop_idx].break_requested = true;
                instance.frames.loop_stack.truncate(loop_idx);
                Ok(None)
            }
            None => {
                instance.fail(
                    WorkflowErrorInfo::new(
                        ErrorKind::ControlFlow,
                        "break outside of a loop",
                    )
                    .at_step(step.id.clone()),
                );
                Err(())
            }
        },
        ControlEffect::Continue => match instance.frames.unwind_to_innermost_loop() {
            Some(loop_idx) => {
                instance.frames.loop_stack[loop_idx].continue_requested = true;
                advance_loop(instance, loop_idx, deps).map(|()| None)
            }
            None => {
                instance.fail(
                    WorkflowErrorInfo::new(
                        ErrorKind::ControlFlow,
                        "continue outside of a loop",
                    )
                    .at_step(step.id.clone()),
                );
                Err(())
            }
        },
        ControlEffect::FanOut(request) => {
            let serial = deps.config.debug_serial
                || matches!(
                    instance.definition.config.execution_mode,
                    Some(aromcp_types::workflow::ExecutionMode::Serial)
                );
            let scope = build_scope(instance, deps)?;
            let definition = Arc::clone(&instance.definition);
            let fanout = match subagent::build_fanout(
                &request,
                &instance.id,
                &instance.cancel_token,
                &scope,
                &definition,
                deps.cache,
                serial,
            ) {
                Ok(fanout) => fanout,
                Err(err) => {
                    instance.fail(err.at_step(step.id.clone()));
                    return Err(());
                }
            };

            for entry in &fanout.entries {
                instance.tracker.record(TraceEvent::SubAgentCreated {
                    task_id: entry.task_id.clone(),
                });
            }
            let payload = fanout_payload(step, &fanout, deps);
            instance.fanout = Some(fanout);

            if request.items.is_empty() {
                // Zero items: the barrier is already satisfied
                match subagent::try_aggregate(instance).await {
                    Ok(Some(results)) => {
                        instance.last_result = Some(results);
                        return Ok(None);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        fail_state(instance, err);
                        return Err(());
                    }
                }
                return Ok(None);
            }

            instance.pending.set_awaiting(AwaitingStep {
                step_id: step.id.clone(),
                step: step.clone(),
                payload: payload.clone(),
                result: None,
                attempts: 0,
            });
            Ok(Some(payload))
        }
    }
}

/// End-of-iteration bookkeeping for the loop at `loop_idx`: re-evaluate a
/// while condition against a fresh scope, advance a foreach index, enforce
/// the iteration cap, and either push the next body frame or pop the loop.
fn advance_loop(
    instance: &mut WorkflowInstance,
    loop_idx: usize,
    deps: &DriveDeps<'_>,
) -> Result<(), ()> {
    debug_assert_eq!(loop_idx, instance.frames.loop_stack.len() - 1);

    {
        let frame = &mut instance.frames.loop_stack[loop_idx];
        frame.continue_requested = false;
        if frame.break_requested {
            instance.frames.loop_stack.truncate(loop_idx);
            return Ok(());
        }
    }

    let kind = instance.frames.loop_stack[loop_idx].kind;
    match kind {
        LoopKind::Foreach => {
            let (done, capped, step_id, iteration, body) = {
                let frame = &mut instance.frames.loop_stack[loop_idx];
                frame.index += 1;
                frame.iteration = frame.index as u64 + 1;
                (
                    frame.index >= frame.items.len(),
                    frame.index as u64 >= frame.max_iterations,
                    frame.step_id.clone(),
                    frame.iteration,
                    frame.body.clone(),
                )
            };
            if done {
                instance.frames.loop_stack.truncate(loop_idx);
                return Ok(());
            }
            if capped {
                loop_cap_warning(instance, loop_idx, &step_id, deps);
                instance.frames.loop_stack.truncate(loop_idx);
                return Ok(());
            }
            instance.tracker.record(TraceEvent::LoopIteration {
                step_id: step_id.clone(),
                iteration,
            });
            instance
                .frames
                .call_stack
                .push(ExecutionFrame::for_loop_body(body, loop_idx, &step_id));
            Ok(())
        }
        LoopKind::While => {
            let (step_id, iteration, condition, body) = {
                let frame = &instance.frames.loop_stack[loop_idx];
                (
                    frame.step_id.clone(),
                    frame.iteration,
                    frame.condition.clone().unwrap_or_default(),
                    frame.body.clone(),
                )
            };
            if iteration >= instance.frames.loop_stack[loop_idx].max_iterations {
                loop_cap_warning(instance, loop_idx, &step_id, deps);
                instance.frames.loop_stack.truncate(loop_idx);
                return Ok(());
            }

            // State changes from the finished iteration are visible here:
            // the condition re-evaluates against a freshly flattened scope.
            let scope = build_scope(instance, deps)?;
            let verdict = deps
                .cache
                .compile(&condition)
                .and_then(|p| p.evaluate(&scope))
                .map(|v| crate::expression::truthy(&v));
            let verdict = match verdict {
                Ok(verdict) => verdict,
                Err(err) => {
                    instance.fail(
                        WorkflowErrorInfo::new(ErrorKind::Evaluation, err.to_string())
                            .at_step(step_id.clone()),
                    );
                    return Err(());
                }
            };
            instance.tracker.record(TraceEvent::Decision {
                step_id: step_id.clone(),
                condition,
                result: verdict,
            });
            if !verdict {
                instance.frames.loop_stack.truncate(loop_idx);
                return Ok(());
            }

            let frame = &mut instance.frames.loop_stack[loop_idx];
            frame.iteration += 1;
            let iteration = frame.iteration;
            instance.tracker.record(TraceEvent::LoopIteration {
                step_id: step_id.clone(),
                iteration,
            });
            instance
                .frames
                .call_stack
                .push(ExecutionFrame::for_loop_body(body, loop_idx, &step_id));
            Ok(())
        }
    }
}

/// Iteration-cap diagnostic: loop id, last condition, and a state snapshot.
/// The loop terminates; the workflow continues.
fn loop_cap_warning(
    instance: &mut WorkflowInstance,
    loop_idx: usize,
    step_id: &str,
    deps: &DriveDeps<'_>,
) {
    let frame = &instance.frames.loop_stack[loop_idx];
    let condition = frame.condition.clone().unwrap_or_default();
    let cap = frame.max_iterations;
    let snapshot = build_scope(instance, deps)
        .ok()
        .and_then(|scope| scope.get("state").cloned())
        .unwrap_or(Value::Null);
    tracing::warn!(
        instance = instance.id.as_str(),
        step_id,
        cap,
        "loop hit max_iterations, terminating loop"
    );
    instance.tracker.record(TraceEvent::Warning {
        message: format!(
            "loop '{step_id}' hit max_iterations {cap} (condition '{condition}'); state: {snapshot}"
        ),
    });
}

// ---------------------------------------------------------------------------
// Awaiting-result consumption
// ---------------------------------------------------------------------------

async fn consume_awaiting(
    instance: &mut WorkflowInstance,
    mut awaiting: AwaitingStep,
    deps: &DriveDeps<'_>,
) -> Consumed {
    let config = awaiting.step.config.clone();
    match &config {
        StepConfig::UserInput {
            input_type,
            choices,
            validation,
            variable,
            max_retries,
            ..
        } => {
            let Some(submitted) = awaiting.result.take() else {
                let payload = awaiting.payload.clone();
                instance.pending.set_awaiting(awaiting);
                return Consumed::Reemit(payload);
            };
            let Ok(scope) = build_scope(instance, deps) else {
                return Consumed::Failed;
            };
            match validate_user_input(
                &submitted,
                *input_type,
                choices.as_ref(),
                validation.as_deref(),
                &scope,
                deps.cache,
            ) {
                Ok(value) => {
                    let path = match ScopedPath::parse(variable) {
                        Ok(path) => path,
                        Err(err) => {
                            fail_state(instance, err);
                            return Consumed::Failed;
                        }
                    };
                    let update = ResolvedUpdate::set(path, value.clone());
                    if apply_updates_traced(instance, &[update]).is_err() {
                        return Consumed::Failed;
                    }
                    instance.last_result = Some(value);
                    instance.tracker.record(TraceEvent::StepCompleted {
                        step_id: awaiting.step_id,
                    });
                    Consumed::Proceed
                }
                Err(reason) => {
                    awaiting.attempts += 1;
                    if awaiting.attempts >= *max_retries {
                        instance.fail(
                            WorkflowErrorInfo::new(
                                ErrorKind::StepExecution,
                                format!(
                                    "input rejected after {} attempts: {reason}",
                                    awaiting.attempts
                                ),
                            )
                            .at_step(awaiting.step_id),
                        );
                        return Consumed::Failed;
                    }
                    let mut payload = awaiting.payload.clone();
                    if let Value::Object(def) = &mut payload.definition {
                        def.insert(
                            "validation_error".to_string(),
                            Value::String(reason),
                        );
                        def.insert(
                            "attempts".to_string(),
                            Value::from(awaiting.attempts),
                        );
                    }
                    awaiting.payload = payload.clone();
                    instance.pending.set_awaiting(awaiting);
                    Consumed::Reemit(payload)
                }
            }
        }

        StepConfig::AgentPrompt { .. } => {
            let Some(response) = awaiting.result.take() else {
                let payload = awaiting.payload.clone();
                instance.pending.set_awaiting(awaiting);
                return Consumed::Reemit(payload);
            };
            instance.last_result = Some(response);
            instance.tracker.record(TraceEvent::StepCompleted {
                step_id: awaiting.step_id,
            });
            Consumed::Proceed
        }

        StepConfig::McpCall {
            store_result,
            state_updates,
            ..
        } => {
            let Some(result) = awaiting.result.take() else {
                let payload = awaiting.payload.clone();
                instance.pending.set_awaiting(awaiting);
                return Consumed::Reemit(payload);
            };
            let Ok(scope) = build_scope(instance, deps) else {
                return Consumed::Failed;
            };
            let definition = Arc::clone(&instance.definition);
            let ctx = DispatchContext {
                scope,
                cache: deps.cache,
                last_result: None,
                tools: deps.tools,
                loop_bindings: loop_bindings(instance),
                step_id_prefix: &deps.step_id_prefix,
                definition: &definition,
                default_max_iterations: deps.config.default_max_iterations,
            };
            match finish_tool_call(&ctx, result, store_result.as_deref(), state_updates) {
                Outcome::Complete {
                    updates, result, ..
                } => {
                    if apply_updates_traced(instance, &updates).is_err() {
                        return Consumed::Failed;
                    }
                    instance.last_result = result;
                    instance.tracker.record(TraceEvent::StepCompleted {
                        step_id: awaiting.step_id,
                    });
                    Consumed::Proceed
                }
                Outcome::Fail(err) => {
                    instance.fail(err.at_step(awaiting.step_id));
                    Consumed::Failed
                }
                Outcome::Emit(_) => {
                    instance.fail(WorkflowErrorInfo::new(
                        ErrorKind::Internal,
                        "tool completion produced an emission",
                    ));
                    Consumed::Failed
                }
            }
        }

        StepConfig::ParallelForeach { .. } => {
            match subagent::try_aggregate(instance).await {
                Ok(Some(results)) => {
                    let count = results.as_array().map(Vec::len).unwrap_or(0);
                    let finished: Vec<(String, bool)> = instance
                        .fanout
                        .as_ref()
                        .map(|f| f.entries.iter().map(|e| e.task_id.clone()))
                        .into_iter()
                        .flatten()
                        .zip(
                            results
                                .as_array()
                                .cloned()
                                .unwrap_or_default()
                                .into_iter()
                                .map(|r| r.get("ok") == Some(&Value::Bool(true))),
                        )
                        .collect();
                    for (task_id, ok) in finished {
                        instance.tracker.record(TraceEvent::SubAgentFinished {
                            task_id,
                            status: if ok {
                                InstanceStatus::Completed
                            } else {
                                InstanceStatus::Failed
                            },
                        });
                    }
                    instance.last_result = Some(results);
                    tracing::debug!(
                        instance = instance.id.as_str(),
                        count,
                        "fan-out barrier released"
                    );
                    instance.tracker.record(TraceEvent::StepCompleted {
                        step_id: awaiting.step_id,
                    });
                    Consumed::Proceed
                }
                Ok(None) => {
                    let payload = awaiting.payload.clone();
                    instance.pending.set_awaiting(awaiting);
                    Consumed::Reemit(payload)
                }
                Err(err) => {
                    fail_state(instance, err);
                    Consumed::Failed
                }
            }
        }

        // wait_step and friends carry no result; just proceed
        _ => {
            instance.tracker.record(TraceEvent::StepCompleted {
                step_id: awaiting.step_id,
            });
            Consumed::Proceed
        }
    }
}

// ---------------------------------------------------------------------------
// Payload assembly
// ---------------------------------------------------------------------------

/// Merge a flushed batch into one client emission.
pub(crate) fn merge_batch(mut batch: Vec<StepPayload>) -> StepPayload {
    if batch.len() == 1 {
        return batch.pop().expect("len checked");
    }
    let first = &batch[0];
    StepPayload {
        id: first.id.clone(),
        step_type: "user_message_batch".to_string(),
        definition: json!({
            "messages": batch.iter().map(|p| p.definition.clone()).collect::<Vec<_>>(),
        }),
        context: first.context.clone(),
    }
}

fn fanout_payload(
    step: &StepDefinition,
    fanout: &subagent::FanOut,
    deps: &DriveDeps<'_>,
) -> StepPayload {
    let sub_agent_ids: Vec<Value> = fanout
        .entries
        .iter()
        .map(|e| Value::String(e.task_id.clone()))
        .collect();
    StepPayload {
        id: format!("{}{}", deps.step_id_prefix, step.id),
        step_type: "parallel_foreach".to_string(),
        definition: json!({
            "task_name": fanout.task_name,
            "sub_agent_ids": sub_agent_ids,
            "max_parallel": fanout.max_parallel,
            "serial": fanout.serial,
            "instructions": if fanout.serial {
                "Debug-serial mode: keep polling this workflow; sub-agent steps arrive inline."
            } else {
                "Spawn one agent per task_id and have each poll get_next_step with its task_id."
            },
        }),
        context: Default::default(),
    }
}
