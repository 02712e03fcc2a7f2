//! Built-in handlers for the fourteen step types.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::{json, Map, Value};

use aromcp_types::error::{ErrorKind, WorkflowErrorInfo};
use aromcp_types::workflow::{
    InputType, StateUpdate, StepConfig, StepDefinition, ToolExecutionContext,
};

use crate::expression::{self, EvaluationError, ExpressionCache};
use crate::frames::{LoopFrame, LoopKind};
use crate::queue::{mode_of, QueueMode};
use crate::state::{ResolvedUpdate, ScopedPath, StateError};
use crate::template::TemplateError;

use super::registry::{DispatchContext, Outcome, StepHandler, StepRegistry};
use super::resolve::{resolve_value, ResolveError};
use super::{ControlEffect, FanOutRequest};

/// Base delay for exponential retry backoff on server-side tool calls.
const RETRY_BASE_DELAY_MS: u64 = 100;

/// Default timeout for server-side tool calls without an explicit one.
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register every built-in handler.
pub(super) fn register_defaults(registry: &mut StepRegistry) {
    registry.register("user_message", Box::new(UserMessageHandler));
    registry.register("user_input", Box::new(UserInputHandler));
    registry.register("agent_prompt", Box::new(AgentPromptHandler));
    registry.register("agent_response", Box::new(AgentResponseHandler));
    registry.register("mcp_call", Box::new(McpCallHandler));
    registry.register("shell_command", Box::new(ShellCommandHandler));
    registry.register("wait_step", Box::new(WaitStepHandler));
    registry.register("conditional", Box::new(ConditionalHandler));
    registry.register("while_loop", Box::new(WhileLoopHandler));
    registry.register("foreach", Box::new(ForeachHandler));
    registry.register("break", Box::new(BreakHandler));
    registry.register("continue", Box::new(ContinueHandler));
    registry.register("parallel_foreach", Box::new(ParallelForeachHandler));
    registry.register("state_update", Box::new(StateUpdateHandler));
}

// ---------------------------------------------------------------------------
// Error helpers
// ---------------------------------------------------------------------------

fn evaluation_failure(err: EvaluationError) -> Outcome {
    Outcome::Fail(WorkflowErrorInfo::new(ErrorKind::Evaluation, err.to_string()))
}

fn template_failure(err: TemplateError) -> Outcome {
    Outcome::Fail(WorkflowErrorInfo::new(ErrorKind::Evaluation, err.to_string()))
}

fn resolve_failure(err: ResolveError) -> Outcome {
    Outcome::Fail(WorkflowErrorInfo::new(ErrorKind::Evaluation, err.to_string()))
}

fn state_failure(err: StateError) -> Outcome {
    Outcome::Fail(WorkflowErrorInfo::new(ErrorKind::StateAccess, err.to_string()))
}

/// Resolve the values of embedded `state_update` specs into store updates.
fn resolve_updates(
    specs: &[StateUpdate],
    ctx: &DispatchContext<'_>,
    scope: &Map<String, Value>,
    last_result: Option<&Value>,
) -> Result<Vec<ResolvedUpdate>, Outcome> {
    specs
        .iter()
        .map(|spec| {
            let path = ScopedPath::parse(&spec.path).map_err(state_failure)?;
            let value = resolve_value(&spec.value, scope, ctx.cache, last_result)
                .map_err(resolve_failure)?;
            Ok(ResolvedUpdate {
                path,
                operation: spec.operation,
                value,
            })
        })
        .collect()
}

fn boolean_condition(
    condition: &str,
    ctx: &DispatchContext<'_>,
) -> Result<bool, EvaluationError> {
    let program = ctx.cache.compile(condition)?;
    let value = program.evaluate(&ctx.scope)?;
    Ok(expression::truthy(&value))
}

// ---------------------------------------------------------------------------
// user_message
// ---------------------------------------------------------------------------

struct UserMessageHandler;

impl StepHandler for UserMessageHandler {
    fn queue_mode(&self, step: &StepDefinition) -> QueueMode {
        mode_of(&step.config)
    }

    fn dispatch<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a DispatchContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let StepConfig::UserMessage {
                message,
                message_type,
                format,
            } = &step.config
            else {
                return wrong_config(step);
            };
            let mut resolved = Map::new();
            let rendered = match crate::template::render_tracked(
                message,
                &ctx.scope,
                ctx.cache,
                &mut resolved,
            ) {
                Ok(rendered) => rendered,
                Err(err) => return template_failure(err),
            };
            let definition = json!({
                "message": rendered,
                "message_type": message_type,
                "format": format,
            });
            Outcome::Emit(ctx.payload(step, definition, resolved))
        })
    }
}

// ---------------------------------------------------------------------------
// user_input
// ---------------------------------------------------------------------------

struct UserInputHandler;

impl StepHandler for UserInputHandler {
    fn queue_mode(&self, step: &StepDefinition) -> QueueMode {
        mode_of(&step.config)
    }

    fn dispatch<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a DispatchContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let StepConfig::UserInput {
                prompt,
                input_type,
                choices,
                validation,
                variable,
                max_retries,
            } = &step.config
            else {
                return wrong_config(step);
            };
            let mut resolved = Map::new();
            let prompt = match crate::template::render_tracked(
                prompt,
                &ctx.scope,
                ctx.cache,
                &mut resolved,
            ) {
                Ok(prompt) => prompt,
                Err(err) => return template_failure(err),
            };
            let choices = match choices {
                Some(choices) => {
                    match resolve_value(&Value::Array(choices.clone()), &ctx.scope, ctx.cache, None)
                    {
                        Ok(resolved) => Some(resolved),
                        Err(err) => return resolve_failure(err),
                    }
                }
                None => None,
            };
            let definition = json!({
                "prompt": prompt,
                "input_type": input_type,
                "choices": choices,
                "validation": validation,
                "variable": variable,
                "max_retries": max_retries,
            });
            Outcome::Emit(ctx.payload(step, definition, resolved))
        })
    }
}

/// Validate and coerce a submitted user input value. Returns the value to
/// store, or a human-readable rejection reason.
pub fn validate_user_input(
    submitted: &Value,
    input_type: InputType,
    choices: Option<&Vec<Value>>,
    validation: Option<&str>,
    scope: &Map<String, Value>,
    cache: &ExpressionCache,
) -> Result<Value, String> {
    let coerced = match input_type {
        InputType::String => match submitted {
            Value::String(_) => submitted.clone(),
            other => Value::String(expression::render_for_template(other)),
        },
        InputType::Number => match submitted {
            Value::Number(_) => submitted.clone(),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .map(expression::number_value)
                .ok_or_else(|| format!("'{s}' is not a number"))?,
            other => return Err(format!("expected a number, got {other}")),
        },
        InputType::Boolean => match submitted {
            Value::Bool(_) => submitted.clone(),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Value::Bool(true),
                "false" | "no" | "n" | "0" => Value::Bool(false),
                other => return Err(format!("'{other}' is not a boolean")),
            },
            other => return Err(format!("expected a boolean, got {other}")),
        },
        InputType::Choice => {
            let choices = choices.ok_or("choice input without declared choices")?;
            if !choices.contains(submitted) {
                return Err(format!(
                    "value is not one of the allowed choices: {}",
                    expression::render_for_template(&Value::Array(choices.clone()))
                ));
            }
            submitted.clone()
        }
    };

    if let Some(validation) = validation {
        let mut scope = scope.clone();
        scope.insert("value".to_string(), coerced.clone());
        let program = cache
            .compile(validation)
            .map_err(|e| format!("validation expression failed: {e}"))?;
        let verdict = program
            .evaluate(&scope)
            .map_err(|e| format!("validation expression failed: {e}"))?;
        if !expression::truthy(&verdict) {
            return Err("value rejected by validation expression".to_string());
        }
    }

    Ok(coerced)
}

// ---------------------------------------------------------------------------
// agent_prompt
// ---------------------------------------------------------------------------

struct AgentPromptHandler;

impl StepHandler for AgentPromptHandler {
    fn queue_mode(&self, step: &StepDefinition) -> QueueMode {
        mode_of(&step.config)
    }

    fn dispatch<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a DispatchContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let StepConfig::AgentPrompt {
                prompt,
                expected_response,
            } = &step.config
            else {
                return wrong_config(step);
            };
            let mut resolved = Map::new();
            let prompt = match crate::template::render_tracked(
                prompt,
                &ctx.scope,
                ctx.cache,
                &mut resolved,
            ) {
                Ok(prompt) => prompt,
                Err(err) => return template_failure(err),
            };
            let definition = json!({
                "prompt": prompt,
                "expected_response": expected_response,
            });
            Outcome::Emit(ctx.payload(step, definition, resolved))
        })
    }
}

// ---------------------------------------------------------------------------
// agent_response
// ---------------------------------------------------------------------------

struct AgentResponseHandler;

impl StepHandler for AgentResponseHandler {
    fn queue_mode(&self, step: &StepDefinition) -> QueueMode {
        mode_of(&step.config)
    }

    fn dispatch<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a DispatchContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let StepConfig::AgentResponse {
                response_schema,
                state_updates,
            } = &step.config
            else {
                return wrong_config(step);
            };

            let response = ctx.last_result.cloned().unwrap_or(Value::Null);
            if let Some(schema) = response_schema {
                if let Err(reason) = check_response_schema(schema, &response) {
                    return Outcome::Fail(WorkflowErrorInfo::new(
                        ErrorKind::StepExecution,
                        format!("agent response rejected: {reason}"),
                    ));
                }
            }

            // Expose the response to update expressions
            let mut scope = ctx.scope.clone();
            scope.insert("response".to_string(), response.clone());
            let updates = match resolve_updates(state_updates, ctx, &scope, Some(&response)) {
                Ok(updates) => updates,
                Err(outcome) => return outcome,
            };

            Outcome::Complete {
                updates,
                result: Some(response),
                control: None,
            }
        })
    }
}

/// Minimal structural check of a response against a declared schema:
/// `required` keys must be present, and `properties.<k>.type` tags must
/// match when both sides declare them.
fn check_response_schema(schema: &Value, response: &Value) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let object = response
            .as_object()
            .ok_or_else(|| "expected an object response".to_string())?;
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                return Err(format!("missing required field '{key}'"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        if let Some(object) = response.as_object() {
            for (key, prop) in properties {
                let (Some(expected), Some(value)) =
                    (prop.get("type").and_then(Value::as_str), object.get(key))
                else {
                    continue;
                };
                let actual = json_type_tag(value);
                if expected != actual {
                    return Err(format!(
                        "field '{key}' should be {expected}, got {actual}"
                    ));
                }
            }
        }
    }

    Ok(())
}

fn json_type_tag(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// mcp_call
// ---------------------------------------------------------------------------

struct McpCallHandler;

impl StepHandler for McpCallHandler {
    fn queue_mode(&self, step: &StepDefinition) -> QueueMode {
        mode_of(&step.config)
    }

    fn dispatch<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a DispatchContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let StepConfig::McpCall {
                tool,
                parameters,
                execution_context,
                store_result,
                timeout_seconds,
                max_retries,
                state_updates,
            } = &step.config
            else {
                return wrong_config(step);
            };

            let parameters = match resolve_value(
                &Value::Object(parameters.clone()),
                &ctx.scope,
                ctx.cache,
                ctx.last_result,
            ) {
                Ok(Value::Object(map)) => map,
                Ok(_) => unreachable!("object in, object out"),
                Err(err) => return resolve_failure(err),
            };

            match execution_context {
                ToolExecutionContext::Client => {
                    let definition = json!({
                        "tool": tool,
                        "parameters": parameters,
                        "store_result": store_result,
                        "timeout_seconds": timeout_seconds,
                    });
                    Outcome::Emit(ctx.payload(step, definition, Map::new()))
                }
                ToolExecutionContext::Server => {
                    self.invoke_server_side(
                        step,
                        ctx,
                        tool,
                        &parameters,
                        store_result.as_deref(),
                        *timeout_seconds,
                        *max_retries,
                        state_updates,
                    )
                    .await
                }
            }
        })
    }
}

impl McpCallHandler {
    #[allow(clippy::too_many_arguments)]
    async fn invoke_server_side(
        &self,
        _step: &StepDefinition,
        ctx: &DispatchContext<'_>,
        tool: &str,
        parameters: &Map<String, Value>,
        store_result: Option<&str>,
        timeout_seconds: Option<u64>,
        max_retries: u64,
        state_updates: &[StateUpdate],
    ) -> Outcome {
        let Some(tools) = ctx.tools else {
            return Outcome::Fail(WorkflowErrorInfo::new(
                ErrorKind::StepExecution,
                format!("no server-side tool dispatcher registered (tool '{tool}')"),
            ));
        };
        let timeout = Duration::from_secs(timeout_seconds.unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS));

        let mut attempt = 0u64;
        let result = loop {
            match tokio::time::timeout(timeout, tools.invoke(tool, parameters)).await {
                Ok(Ok(result)) => break result,
                Ok(Err(err)) if err.retryable && attempt < max_retries => {
                    let delay = RETRY_BASE_DELAY_MS * (1 << attempt.min(6));
                    tracing::debug!(
                        tool,
                        attempt,
                        delay_ms = delay,
                        error = err.message.as_str(),
                        "retrying tool call"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Ok(Err(err)) => {
                    return Outcome::Fail(WorkflowErrorInfo::new(
                        ErrorKind::StepExecution,
                        format!("tool '{tool}' failed: {}", err.message),
                    ));
                }
                Err(_elapsed) if attempt < max_retries => {
                    attempt += 1;
                }
                Err(_elapsed) => {
                    return Outcome::Fail(WorkflowErrorInfo::new(
                        ErrorKind::Timeout,
                        format!("tool '{tool}' timed out after {}s", timeout.as_secs()),
                    ));
                }
            }
        };

        finish_tool_call(ctx, result, store_result, state_updates)
    }
}

/// Shared completion for client- and server-executed tool calls: apply
/// `store_result` first, then explicit `state_updates` (so an explicit
/// update wins when both target the same path).
pub fn finish_tool_call(
    ctx: &DispatchContext<'_>,
    result: Value,
    store_result: Option<&str>,
    state_updates: &[StateUpdate],
) -> Outcome {
    let last = tool_result_record(&result);
    let mut updates = Vec::new();

    if let Some(path) = store_result {
        match ScopedPath::parse(path) {
            Ok(path) => updates.push(ResolvedUpdate::set(path, result.clone())),
            Err(err) => return state_failure(err),
        }
    }

    let mut scope = ctx.scope.clone();
    scope.insert("result".to_string(), result);
    match resolve_updates(state_updates, ctx, &scope, Some(&last)) {
        Ok(mut explicit) => updates.append(&mut explicit),
        Err(outcome) => return outcome,
    }

    Outcome::Complete {
        updates,
        result: Some(last),
        control: None,
    }
}

/// Shape a tool result so the reserved `success`/`errors` tokens resolve.
fn tool_result_record(result: &Value) -> Value {
    match result {
        Value::Object(map) => {
            let mut map = map.clone();
            map.entry("success".to_string()).or_insert(Value::Bool(true));
            Value::Object(map)
        }
        other => json!({ "result": other, "success": true }),
    }
}

// ---------------------------------------------------------------------------
// shell_command
// ---------------------------------------------------------------------------

struct ShellCommandHandler;

impl StepHandler for ShellCommandHandler {
    fn queue_mode(&self, step: &StepDefinition) -> QueueMode {
        mode_of(&step.config)
    }

    fn dispatch<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a DispatchContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let StepConfig::ShellCommand {
                command,
                cwd,
                timeout_seconds,
                state_update,
            } = &step.config
            else {
                return wrong_config(step);
            };

            let command = match crate::template::render(command, &ctx.scope, ctx.cache) {
                Ok(command) => command,
                Err(err) => return template_failure(err),
            };
            let cwd = match cwd {
                Some(cwd) => match crate::template::render(cwd, &ctx.scope, ctx.cache) {
                    Ok(cwd) => Some(cwd),
                    Err(err) => return template_failure(err),
                },
                None => None,
            };

            let mut process = tokio::process::Command::new("sh");
            process.arg("-c").arg(&command);
            if let Some(cwd) = &cwd {
                process.current_dir(cwd);
            }

            let timeout = Duration::from_secs(*timeout_seconds);
            let output = match tokio::time::timeout(timeout, process.output()).await {
                Ok(Ok(output)) => output,
                Ok(Err(err)) => {
                    return Outcome::Fail(WorkflowErrorInfo::new(
                        ErrorKind::StepExecution,
                        format!("failed to spawn shell command: {err}"),
                    ));
                }
                Err(_elapsed) => {
                    return Outcome::Fail(WorkflowErrorInfo::new(
                        ErrorKind::Timeout,
                        format!("shell command timed out after {}s", timeout.as_secs()),
                    ));
                }
            };

            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let returncode = output.status.code().unwrap_or(-1);
            if returncode != 0 {
                // Non-zero exit is captured, not fatal; the workflow decides
                // what to do with `returncode`.
                tracing::warn!(
                    step_id = step.id.as_str(),
                    returncode,
                    stderr = stderr.as_str(),
                    "shell command exited non-zero"
                );
            }
            let result = json!({
                "stdout": stdout,
                "stderr": stderr,
                "returncode": returncode,
                "full_output": format!("{stdout}{stderr}"),
                "success": returncode == 0,
            });

            let updates = match state_update {
                Some(spec) => {
                    match resolve_updates(
                        std::slice::from_ref(spec),
                        ctx,
                        &ctx.scope,
                        Some(&result),
                    ) {
                        Ok(updates) => updates,
                        Err(outcome) => return outcome,
                    }
                }
                None => Vec::new(),
            };

            Outcome::Complete {
                updates,
                result: Some(result),
                control: None,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// wait_step
// ---------------------------------------------------------------------------

struct WaitStepHandler;

impl StepHandler for WaitStepHandler {
    fn queue_mode(&self, step: &StepDefinition) -> QueueMode {
        mode_of(&step.config)
    }

    fn dispatch<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a DispatchContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let StepConfig::WaitStep { message } = &step.config else {
                return wrong_config(step);
            };
            let message = match message {
                Some(message) => {
                    match crate::template::render(message, &ctx.scope, ctx.cache) {
                        Ok(message) => Some(message),
                        Err(err) => return template_failure(err),
                    }
                }
                None => None,
            };
            Outcome::Emit(ctx.payload(step, json!({ "message": message }), Map::new()))
        })
    }
}

// ---------------------------------------------------------------------------
// conditional
// ---------------------------------------------------------------------------

struct ConditionalHandler;

impl StepHandler for ConditionalHandler {
    fn queue_mode(&self, step: &StepDefinition) -> QueueMode {
        mode_of(&step.config)
    }

    fn dispatch<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a DispatchContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let StepConfig::Conditional {
                condition,
                then_steps,
                else_steps,
            } = &step.config
            else {
                return wrong_config(step);
            };
            let taken = match boolean_condition(condition, ctx) {
                Ok(taken) => taken,
                Err(err) => return evaluation_failure(err),
            };
            let steps = if taken { then_steps } else { else_steps };
            Outcome::control(ControlEffect::Branch {
                condition: condition.clone(),
                taken,
                steps: steps.clone(),
            })
        })
    }
}

// ---------------------------------------------------------------------------
// while_loop
// ---------------------------------------------------------------------------

struct WhileLoopHandler;

impl StepHandler for WhileLoopHandler {
    fn queue_mode(&self, step: &StepDefinition) -> QueueMode {
        mode_of(&step.config)
    }

    fn dispatch<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a DispatchContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let StepConfig::WhileLoop {
                condition,
                body,
                max_iterations,
            } = &step.config
            else {
                return wrong_config(step);
            };
            let should_enter = match boolean_condition(condition, ctx) {
                Ok(value) => value,
                Err(err) => return evaluation_failure(err),
            };
            if !should_enter {
                return Outcome::control(ControlEffect::SkipLoop {
                    condition: condition.clone(),
                });
            }
            Outcome::control(ControlEffect::EnterLoop(LoopFrame {
                kind: LoopKind::While,
                step_id: step.id.clone(),
                condition: Some(condition.clone()),
                items: Vec::new(),
                index: 0,
                variable_name: None,
                iteration: 1,
                max_iterations: max_iterations.unwrap_or(ctx.default_max_iterations),
                break_requested: false,
                continue_requested: false,
                body: body.clone(),
            }))
        })
    }
}

// ---------------------------------------------------------------------------
// foreach
// ---------------------------------------------------------------------------

struct ForeachHandler;

impl StepHandler for ForeachHandler {
    fn queue_mode(&self, step: &StepDefinition) -> QueueMode {
        mode_of(&step.config)
    }

    fn dispatch<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a DispatchContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let StepConfig::Foreach {
                items,
                variable_name,
                body,
            } = &step.config
            else {
                return wrong_config(step);
            };
            let materialized = match materialize_items(items, ctx) {
                Ok(items) => items,
                Err(outcome) => return outcome,
            };
            if materialized.is_empty() {
                return Outcome::control(ControlEffect::SkipLoop {
                    condition: items.clone(),
                });
            }
            Outcome::control(ControlEffect::EnterLoop(LoopFrame {
                kind: LoopKind::Foreach,
                step_id: step.id.clone(),
                condition: None,
                items: materialized,
                index: 0,
                variable_name: Some(variable_name.clone()),
                iteration: 1,
                max_iterations: ctx.default_max_iterations,
                break_requested: false,
                continue_requested: false,
                body: body.clone(),
            }))
        })
    }
}

/// Evaluate an items expression into a materialized array.
fn materialize_items(
    items: &str,
    ctx: &DispatchContext<'_>,
) -> Result<Vec<Value>, Outcome> {
    let program = ctx.cache.compile(items).map_err(evaluation_failure)?;
    let value = program.evaluate(&ctx.scope).map_err(evaluation_failure)?;
    match value {
        Value::Array(items) => Ok(items),
        other => Err(Outcome::Fail(WorkflowErrorInfo::new(
            ErrorKind::Validation,
            format!(
                "items expression '{items}' must produce an array, got {}",
                json_type_tag(&other)
            ),
        ))),
    }
}

// ---------------------------------------------------------------------------
// break / continue
// ---------------------------------------------------------------------------

struct BreakHandler;

impl StepHandler for BreakHandler {
    fn queue_mode(&self, step: &StepDefinition) -> QueueMode {
        mode_of(&step.config)
    }

    fn dispatch<'a>(
        &'a self,
        _step: &'a StepDefinition,
        _ctx: &'a DispatchContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move { Outcome::control(ControlEffect::Break) })
    }
}

struct ContinueHandler;

impl StepHandler for ContinueHandler {
    fn queue_mode(&self, step: &StepDefinition) -> QueueMode {
        mode_of(&step.config)
    }

    fn dispatch<'a>(
        &'a self,
        _step: &'a StepDefinition,
        _ctx: &'a DispatchContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move { Outcome::control(ControlEffect::Continue) })
    }
}

// ---------------------------------------------------------------------------
// parallel_foreach
// ---------------------------------------------------------------------------

struct ParallelForeachHandler;

impl StepHandler for ParallelForeachHandler {
    fn queue_mode(&self, step: &StepDefinition) -> QueueMode {
        mode_of(&step.config)
    }

    fn dispatch<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a DispatchContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let StepConfig::ParallelForeach {
                items,
                sub_agent_task,
                max_parallel,
                timeout_seconds,
            } = &step.config
            else {
                return wrong_config(step);
            };
            if !ctx.definition.sub_agent_tasks.contains_key(sub_agent_task) {
                return Outcome::Fail(WorkflowErrorInfo::new(
                    ErrorKind::Validation,
                    format!("unknown sub-agent task '{sub_agent_task}'"),
                ));
            }
            let items = match materialize_items(items, ctx) {
                Ok(items) => items,
                Err(outcome) => return outcome,
            };
            Outcome::control(ControlEffect::FanOut(FanOutRequest {
                step_id: step.id.clone(),
                items,
                task_name: sub_agent_task.clone(),
                max_parallel: (*max_parallel).max(1),
                timeout_seconds: *timeout_seconds,
            }))
        })
    }
}

// ---------------------------------------------------------------------------
// state_update
// ---------------------------------------------------------------------------

struct StateUpdateHandler;

impl StepHandler for StateUpdateHandler {
    fn queue_mode(&self, step: &StepDefinition) -> QueueMode {
        mode_of(&step.config)
    }

    fn dispatch<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: &'a DispatchContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(async move {
            let StepConfig::StateUpdate {
                path,
                operation,
                value,
            } = &step.config
            else {
                return wrong_config(step);
            };
            let spec = StateUpdate {
                path: path.clone(),
                operation: *operation,
                value: value.clone(),
            };
            let updates = match resolve_updates(
                std::slice::from_ref(&spec),
                ctx,
                &ctx.scope,
                ctx.last_result,
            ) {
                Ok(updates) => updates,
                Err(outcome) => return outcome,
            };
            Outcome::Complete {
                updates,
                result: None,
                control: None,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

fn wrong_config(step: &StepDefinition) -> Outcome {
    Outcome::Fail(WorkflowErrorInfo::new(
        ErrorKind::Internal,
        format!(
            "handler/config mismatch for step '{}' ({})",
            step.id,
            step.config.type_tag()
        ),
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use aromcp_types::workflow::{
        MessageFormat, MessageType, StateSchema, UpdateOperation, WorkflowDefinition,
    };
    use std::collections::HashMap;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "t".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            inputs: HashMap::new(),
            default_state: Map::new(),
            state_schema: StateSchema::default(),
            steps: vec![],
            sub_agent_tasks: HashMap::from([(
                "review_file".to_string(),
                aromcp_types::workflow::SubAgentTask {
                    description: None,
                    inputs: HashMap::new(),
                    default_state: Map::new(),
                    state_schema: StateSchema::default(),
                    steps: None,
                    prompt_template: Some("Review {{ inputs.item }}".to_string()),
                    result_key: None,
                },
            )]),
            config: Default::default(),
        }
    }

    fn ctx<'a>(
        scope: Value,
        definition: &'a WorkflowDefinition,
        cache: &'a ExpressionCache,
        last_result: Option<&'a Value>,
    ) -> DispatchContext<'a> {
        DispatchContext {
            scope: scope.as_object().unwrap().clone(),
            cache,
            last_result,
            tools: None,
            loop_bindings: None,
            step_id_prefix: "",
            definition,
            default_max_iterations: 100,
        }
    }

    fn step(id: &str, config: StepConfig) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            config,
        }
    }

    async fn dispatch(step_def: &StepDefinition, ctx: &DispatchContext<'_>) -> Outcome {
        StepRegistry::with_defaults()
            .get(step_def.config.type_tag())
            .unwrap()
            .dispatch(step_def, ctx)
            .await
    }

    // -------------------------------------------------------------------
    // user_message
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_user_message_renders_template() {
        let def = definition();
        let cache = ExpressionCache::new();
        let ctx = ctx(json!({"this": {"doubled": 10}}), &def, &cache, None);
        let s = step(
            "step_001",
            StepConfig::UserMessage {
                message: "v={{ this.doubled }}".to_string(),
                message_type: MessageType::Info,
                format: MessageFormat::Text,
            },
        );
        match dispatch(&s, &ctx).await {
            Outcome::Emit(payload) => {
                assert_eq!(payload.definition["message"], "v=10");
                assert_eq!(payload.step_type, "user_message");
                assert_eq!(payload.context.variables_resolved["this.doubled"], json!(10));
            }
            other => panic!("expected Emit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_user_message_missing_var_renders_empty() {
        let def = definition();
        let cache = ExpressionCache::new();
        let ctx = ctx(json!({}), &def, &cache, None);
        let s = step(
            "step_001",
            StepConfig::UserMessage {
                message: "x={{ missing.var }}".to_string(),
                message_type: MessageType::Info,
                format: MessageFormat::Text,
            },
        );
        match dispatch(&s, &ctx).await {
            Outcome::Emit(payload) => assert_eq!(payload.definition["message"], "x="),
            other => panic!("expected Emit, got {other:?}"),
        }
    }

    // -------------------------------------------------------------------
    // conditional
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_conditional_picks_branch() {
        let def = definition();
        let cache = ExpressionCache::new();
        let ctx = ctx(json!({"this": {"counter": 3}}), &def, &cache, None);
        let s = step(
            "step_002",
            StepConfig::Conditional {
                condition: "this.counter > 1".to_string(),
                then_steps: vec![step("step_003", StepConfig::Break {})],
                else_steps: vec![],
            },
        );
        match dispatch(&s, &ctx).await {
            Outcome::Complete {
                control: Some(ControlEffect::Branch { taken, steps, .. }),
                ..
            } => {
                assert!(taken);
                assert_eq!(steps.len(), 1);
            }
            other => panic!("expected Branch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_conditional_bad_condition_fails() {
        let def = definition();
        let cache = ExpressionCache::new();
        let ctx = ctx(json!({}), &def, &cache, None);
        let s = step(
            "step_002",
            StepConfig::Conditional {
                condition: "missing_var > 1".to_string(),
                then_steps: vec![],
                else_steps: vec![],
            },
        );
        match dispatch(&s, &ctx).await {
            Outcome::Fail(err) => assert_eq!(err.kind, ErrorKind::Evaluation),
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    // -------------------------------------------------------------------
    // while / foreach entry
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_while_false_condition_skips() {
        let def = definition();
        let cache = ExpressionCache::new();
        let ctx = ctx(json!({"this": {"i": 9}}), &def, &cache, None);
        let s = step(
            "step_004",
            StepConfig::WhileLoop {
                condition: "this.i < 5".to_string(),
                body: vec![step("step_005", StepConfig::Break {})],
                max_iterations: None,
            },
        );
        match dispatch(&s, &ctx).await {
            Outcome::Complete {
                control: Some(ControlEffect::SkipLoop { .. }),
                ..
            } => {}
            other => panic!("expected SkipLoop, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_foreach_materializes_items() {
        let def = definition();
        let cache = ExpressionCache::new();
        let ctx = ctx(json!({"this": {"files": ["a", "b"]}}), &def, &cache, None);
        let s = step(
            "step_006",
            StepConfig::Foreach {
                items: "this.files".to_string(),
                variable_name: "file".to_string(),
                body: vec![step("step_007", StepConfig::Continue {})],
            },
        );
        match dispatch(&s, &ctx).await {
            Outcome::Complete {
                control: Some(ControlEffect::EnterLoop(frame)),
                ..
            } => {
                assert_eq!(frame.items, vec![json!("a"), json!("b")]);
                assert_eq!(frame.kind, LoopKind::Foreach);
                assert_eq!(frame.variable_name.as_deref(), Some("file"));
            }
            other => panic!("expected EnterLoop, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_foreach_non_array_fails() {
        let def = definition();
        let cache = ExpressionCache::new();
        let ctx = ctx(json!({"this": {"files": "not-an-array"}}), &def, &cache, None);
        let s = step(
            "step_006",
            StepConfig::Foreach {
                items: "this.files".to_string(),
                variable_name: "file".to_string(),
                body: vec![],
            },
        );
        match dispatch(&s, &ctx).await {
            Outcome::Fail(err) => assert_eq!(err.kind, ErrorKind::Validation),
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    // -------------------------------------------------------------------
    // parallel_foreach
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_parallel_foreach_unknown_task_fails() {
        let def = definition();
        let cache = ExpressionCache::new();
        let ctx = ctx(json!({"this": {"files": []}}), &def, &cache, None);
        let s = step(
            "step_008",
            StepConfig::ParallelForeach {
                items: "this.files".to_string(),
                sub_agent_task: "nope".to_string(),
                max_parallel: 10,
                timeout_seconds: None,
            },
        );
        match dispatch(&s, &ctx).await {
            Outcome::Fail(err) => assert_eq!(err.kind, ErrorKind::Validation),
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_parallel_foreach_fans_out() {
        let def = definition();
        let cache = ExpressionCache::new();
        let ctx = ctx(json!({"this": {"files": ["a", "b", "c"]}}), &def, &cache, None);
        let s = step(
            "step_008",
            StepConfig::ParallelForeach {
                items: "this.files".to_string(),
                sub_agent_task: "review_file".to_string(),
                max_parallel: 2,
                timeout_seconds: Some(60),
            },
        );
        match dispatch(&s, &ctx).await {
            Outcome::Complete {
                control: Some(ControlEffect::FanOut(request)),
                ..
            } => {
                assert_eq!(request.items.len(), 3);
                assert_eq!(request.task_name, "review_file");
                assert_eq!(request.max_parallel, 2);
            }
            other => panic!("expected FanOut, got {other:?}"),
        }
    }

    // -------------------------------------------------------------------
    // state_update
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_state_update_resolves_template_value() {
        let def = definition();
        let cache = ExpressionCache::new();
        let ctx = ctx(json!({"this": {"n": 5}}), &def, &cache, None);
        let s = step(
            "step_009",
            StepConfig::StateUpdate {
                path: "state.total".to_string(),
                operation: UpdateOperation::Set,
                value: json!("{{ this.n * 2 }}"),
            },
        );
        match dispatch(&s, &ctx).await {
            Outcome::Complete { updates, .. } => {
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].value, json!(10));
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    // -------------------------------------------------------------------
    // agent_response
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_agent_response_schema_violation_fails() {
        let def = definition();
        let cache = ExpressionCache::new();
        let response = json!({"ok": true});
        let ctx = ctx(json!({}), &def, &cache, Some(&response));
        let s = step(
            "step_010",
            StepConfig::AgentResponse {
                response_schema: Some(json!({"required": ["verdict"]})),
                state_updates: vec![],
            },
        );
        match dispatch(&s, &ctx).await {
            Outcome::Fail(err) => {
                assert_eq!(err.kind, ErrorKind::StepExecution);
                assert!(err.message.contains("verdict"));
            }
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_agent_response_applies_updates_from_response() {
        let def = definition();
        let cache = ExpressionCache::new();
        let response = json!({"verdict": "pass", "count": 3});
        let ctx = ctx(json!({}), &def, &cache, Some(&response));
        let s = step(
            "step_010",
            StepConfig::AgentResponse {
                response_schema: Some(json!({
                    "required": ["verdict"],
                    "properties": {"count": {"type": "number"}},
                })),
                state_updates: vec![StateUpdate {
                    path: "state.verdict".to_string(),
                    operation: UpdateOperation::Set,
                    value: json!("{{ response.verdict }}"),
                }],
            },
        );
        match dispatch(&s, &ctx).await {
            Outcome::Complete { updates, result, .. } => {
                assert_eq!(updates[0].value, json!("pass"));
                assert_eq!(result.unwrap()["count"], json!(3));
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    // -------------------------------------------------------------------
    // shell_command
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_shell_command_captures_stdout() {
        let def = definition();
        let cache = ExpressionCache::new();
        let ctx = ctx(json!({}), &def, &cache, None);
        let s = step(
            "step_011",
            StepConfig::ShellCommand {
                command: "printf hello".to_string(),
                cwd: None,
                timeout_seconds: 10,
                state_update: Some(StateUpdate {
                    path: "state.out".to_string(),
                    operation: UpdateOperation::Set,
                    value: json!("stdout"),
                }),
            },
        );
        match dispatch(&s, &ctx).await {
            Outcome::Complete { updates, result, .. } => {
                assert_eq!(updates[0].value, json!("hello"));
                let result = result.unwrap();
                assert_eq!(result["returncode"], json!(0));
                assert_eq!(result["success"], json!(true));
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shell_command_nonzero_exit_continues() {
        let def = definition();
        let cache = ExpressionCache::new();
        let ctx = ctx(json!({}), &def, &cache, None);
        let s = step(
            "step_011",
            StepConfig::ShellCommand {
                command: "exit 3".to_string(),
                cwd: None,
                timeout_seconds: 10,
                state_update: Some(StateUpdate {
                    path: "state.code".to_string(),
                    operation: UpdateOperation::Set,
                    value: json!("returncode"),
                }),
            },
        );
        match dispatch(&s, &ctx).await {
            Outcome::Complete { updates, .. } => {
                assert_eq!(updates[0].value, json!(3));
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    // -------------------------------------------------------------------
    // mcp_call (client emission + store_result/state_update precedence)
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_mcp_call_client_emits_resolved_params() {
        let def = definition();
        let cache = ExpressionCache::new();
        let ctx = ctx(json!({"this": {"branch": "main"}}), &def, &cache, None);
        let s = step(
            "step_012",
            StepConfig::McpCall {
                tool: "lint_project".to_string(),
                parameters: Map::from_iter([(
                    "branch".to_string(),
                    json!("{{ this.branch }}"),
                )]),
                execution_context: ToolExecutionContext::Client,
                store_result: Some("state.lint".to_string()),
                timeout_seconds: None,
                max_retries: 0,
                state_updates: vec![],
            },
        );
        match dispatch(&s, &ctx).await {
            Outcome::Emit(payload) => {
                assert_eq!(payload.definition["tool"], "lint_project");
                assert_eq!(payload.definition["parameters"]["branch"], "main");
            }
            other => panic!("expected Emit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_finish_tool_call_explicit_update_wins() {
        let def = definition();
        let cache = ExpressionCache::new();
        let ctx = ctx(json!({}), &def, &cache, None);
        let outcome = finish_tool_call(
            &ctx,
            json!({"issues": 2}),
            Some("state.lint"),
            &[StateUpdate {
                path: "state.lint".to_string(),
                operation: UpdateOperation::Set,
                value: json!("{{ result.issues }}"),
            }],
        );
        match outcome {
            Outcome::Complete { updates, .. } => {
                // store_result first, explicit update second: last write wins
                assert_eq!(updates.len(), 2);
                assert_eq!(updates[0].value, json!({"issues": 2}));
                assert_eq!(updates[1].value, json!(2));
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    // -------------------------------------------------------------------
    // user input validation
    // -------------------------------------------------------------------

    #[test]
    fn test_validate_user_input_coercions() {
        let cache = ExpressionCache::new();
        let scope = Map::new();
        assert_eq!(
            validate_user_input(&json!("42"), InputType::Number, None, None, &scope, &cache)
                .unwrap(),
            json!(42)
        );
        assert_eq!(
            validate_user_input(&json!("yes"), InputType::Boolean, None, None, &scope, &cache)
                .unwrap(),
            json!(true)
        );
        assert!(
            validate_user_input(&json!("nope"), InputType::Number, None, None, &scope, &cache)
                .is_err()
        );
    }

    #[test]
    fn test_validate_user_input_choice_membership() {
        let cache = ExpressionCache::new();
        let scope = Map::new();
        let choices = vec![json!("a"), json!("b")];
        assert!(validate_user_input(
            &json!("a"),
            InputType::Choice,
            Some(&choices),
            None,
            &scope,
            &cache
        )
        .is_ok());
        assert!(validate_user_input(
            &json!("z"),
            InputType::Choice,
            Some(&choices),
            None,
            &scope,
            &cache
        )
        .is_err());
    }

    #[test]
    fn test_validate_user_input_expression() {
        let cache = ExpressionCache::new();
        let scope = Map::new();
        assert!(validate_user_input(
            &json!(10),
            InputType::Number,
            None,
            Some("value > 5"),
            &scope,
            &cache
        )
        .is_ok());
        assert!(validate_user_input(
            &json!(2),
            InputType::Number,
            None,
            Some("value > 5"),
            &scope,
            &cache
        )
        .is_err());
    }
}
