//! Workflow definition parsing, validation, and filesystem discovery.
//!
//! Converts YAML files into validated `WorkflowDefinition` values. Validation
//! assigns `step_<nnn>` ids to steps that omit them, checks id uniqueness,
//! verifies `parallel_foreach` task references, and builds the computed-field
//! graph once so dependency cycles fail at load rather than at `start`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aromcp_types::workflow::{StepConfig, StepDefinition, WorkflowDefinition};

use crate::expression::ExpressionCache;
use crate::state::{ComputedGraph, StateError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating workflow definitions.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    /// YAML deserialization failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// Computed-field dependency cycle (detected at load).
    #[error(transparent)]
    Computed(#[from] StateError),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing & validation
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let mut def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&mut def)?;
    Ok(def)
}

/// Validate a definition in place, assigning missing step ids.
///
/// Checks:
/// - Name is non-empty, using only alphanumerics, hyphens, and underscores
/// - At least one root step exists
/// - Step ids are unique across the document (sub-agent tasks included)
/// - `parallel_foreach` steps reference declared sub-agent tasks
/// - Sub-agent tasks declare either `steps` or `prompt_template`
/// - Input defaults match their declared types
/// - Computed-field graphs (root and per task) are acyclic
pub fn validate_definition(def: &mut WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.name.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !def
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DefinitionError::Validation(format!(
            "workflow name '{}' contains invalid characters",
            def.name
        )));
    }

    if def.steps.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow must have at least one step".to_string(),
        ));
    }

    // Assign ids and enforce uniqueness in one walk over the document
    let mut counter = 0usize;
    let mut seen = HashSet::new();
    assign_step_ids(&mut def.steps, &mut counter, &mut seen)?;
    let task_names: Vec<String> = def.sub_agent_tasks.keys().cloned().collect();
    for name in &task_names {
        let task = def.sub_agent_tasks.get_mut(name).expect("known key");
        if task.steps.is_none() && task.prompt_template.is_none() {
            return Err(DefinitionError::Validation(format!(
                "sub-agent task '{name}' must declare steps or prompt_template"
            )));
        }
        if let Some(steps) = &mut task.steps {
            assign_step_ids(steps, &mut counter, &mut seen)?;
        }
    }

    // Task references
    let known_tasks: HashSet<String> = def.sub_agent_tasks.keys().cloned().collect();
    check_task_references(&def.steps, &known_tasks)?;
    for task in def.sub_agent_tasks.values() {
        if let Some(steps) = &task.steps {
            check_task_references(steps, &known_tasks)?;
        }
    }

    // Input defaults must match declared types
    for (name, spec) in &def.inputs {
        if let Some(default) = &spec.default {
            if !spec.value_type.matches(default) {
                return Err(DefinitionError::Validation(format!(
                    "input '{name}' default does not match its declared type"
                )));
            }
        }
    }

    // Computed graphs must be acyclic (root and every task schema)
    let cache = Arc::new(ExpressionCache::new());
    ComputedGraph::build(&def.state_schema, Arc::clone(&cache))?;
    for (name, task) in &def.sub_agent_tasks {
        ComputedGraph::build(&task.state_schema, Arc::clone(&cache)).map_err(|e| {
            DefinitionError::Validation(format!("sub-agent task '{name}': {e}"))
        })?;
    }

    Ok(())
}

/// Walk a step list (and nested bodies), assigning `step_<nnn>` ids to
/// steps that omit one and rejecting duplicates.
fn assign_step_ids(
    steps: &mut [StepDefinition],
    counter: &mut usize,
    seen: &mut HashSet<String>,
) -> Result<(), DefinitionError> {
    for step in steps {
        *counter += 1;
        if step.id.is_empty() {
            step.id = format!("step_{counter:03}");
        }
        if !seen.insert(step.id.clone()) {
            return Err(DefinitionError::Validation(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
        match &mut step.config {
            StepConfig::Conditional {
                then_steps,
                else_steps,
                ..
            } => {
                assign_step_ids(then_steps, counter, seen)?;
                assign_step_ids(else_steps, counter, seen)?;
            }
            StepConfig::WhileLoop { body, .. } | StepConfig::Foreach { body, .. } => {
                assign_step_ids(body, counter, seen)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_task_references(
    steps: &[StepDefinition],
    known_tasks: &HashSet<String>,
) -> Result<(), DefinitionError> {
    for step in steps {
        match &step.config {
            StepConfig::ParallelForeach { sub_agent_task, .. } => {
                if !known_tasks.contains(sub_agent_task) {
                    return Err(DefinitionError::Validation(format!(
                        "step '{}' references unknown sub-agent task '{}'",
                        step.id, sub_agent_task
                    )));
                }
            }
            StepConfig::Conditional {
                then_steps,
                else_steps,
                ..
            } => {
                check_task_references(then_steps, known_tasks)?;
                check_task_references(else_steps, known_tasks)?;
            }
            StepConfig::WhileLoop { body, .. } | StepConfig::Foreach { body, .. } => {
                check_task_references(body, known_tasks)?;
            }
            _ => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Discover all workflow YAML files under `base_dir` (recursively).
///
/// Files that fail to parse or validate are skipped with a warning; they
/// may not be workflows at all.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), DefinitionError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                match load_workflow_file(&path) {
                    Ok(def) => results.push((path, def)),
                    Err(err) => {
                        tracing::warn!(?path, error = %err, "skipping unparseable workflow file");
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
