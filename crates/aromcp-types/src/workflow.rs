//! Workflow definition types for the AroMCP engine.
//!
//! Defines the canonical intermediate representation for workflows: YAML
//! files deserialize into `WorkflowDefinition`, which is the single source of
//! truth for a workflow's shape. Step configurations are an internally-tagged
//! enum covering all fourteen step types the engine executes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition (canonical IR)
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// Immutable after load. The engine validates it once (unique step ids,
/// known sub-agent task references, acyclic computed fields) and then
/// instantiates it any number of times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name. Required; unique within a workflow directory.
    pub name: String,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared inputs, keyed by input name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, InputSpec>,
    /// Initial values for the mutable state tier.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub default_state: serde_json::Map<String, Value>,
    /// State schema, including computed field specifications.
    #[serde(default, skip_serializing_if = "StateSchema::is_empty")]
    pub state_schema: StateSchema,
    /// Ordered root step list.
    pub steps: Vec<StepDefinition>,
    /// Sub-agent task definitions, keyed by task name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub sub_agent_tasks: HashMap<String, SubAgentTask>,
    /// Execution configuration.
    #[serde(default, skip_serializing_if = "WorkflowConfig::is_default")]
    pub config: WorkflowConfig,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Execution configuration for a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// How parallel_foreach fan-out executes (overridden by the
    /// process-wide debug-serial switch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<ExecutionMode>,
    /// Workflow-level timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Default loop iteration cap for this workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,
}

impl WorkflowConfig {
    fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// How sub-agent fan-out executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Parallel,
    Serial,
}

// ---------------------------------------------------------------------------
// Input schema
// ---------------------------------------------------------------------------

/// Declared type and constraints for one workflow input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    /// Expected JSON type of the input value.
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the caller must supply this input (default true).
    #[serde(default = "default_true")]
    pub required: bool,
    /// Default value used when the input is omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_true() -> bool {
    true
}

/// JSON type tags used by input and state schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl ValueType {
    /// Check whether a JSON value conforms to this type tag.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueType::String => value.is_string(),
            ValueType::Number => value.is_number(),
            ValueType::Boolean => value.is_boolean(),
            ValueType::Object => value.is_object(),
            ValueType::Array => value.is_array(),
        }
    }
}

// ---------------------------------------------------------------------------
// State schema & computed fields
// ---------------------------------------------------------------------------

/// Schema for the mutable and derived state tiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSchema {
    /// Declared types for top-level state fields (documentation only;
    /// writes are not type-checked against these).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub state: HashMap<String, ValueType>,
    /// Computed (derived) fields, keyed by field name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub computed: HashMap<String, ComputedFieldSpec>,
}

impl StateSchema {
    pub fn is_empty(&self) -> bool {
        self.state.is_empty() && self.computed.is_empty()
    }
}

/// Specification of one computed field.
///
/// ```yaml
/// doubled:
///   from: state.counter
///   transform: "counter * 2"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputedFieldSpec {
    /// Source path or paths this field derives from.
    pub from: SourcePaths,
    /// Expression evaluated against the source values.
    pub transform: String,
    /// What to do when the transform fails (default: raise).
    #[serde(default, skip_serializing_if = "is_default_on_error")]
    pub on_error: ComputeErrorPolicy,
    /// Fallback value used when `on_error` is `use_default`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// One source path or a list of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourcePaths {
    One(String),
    Many(Vec<String>),
}

impl SourcePaths {
    /// Iterate the source paths regardless of shape.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            SourcePaths::One(p) => std::slice::from_ref(p).iter().map(String::as_str),
            SourcePaths::Many(ps) => ps.as_slice().iter().map(String::as_str),
        }
    }
}

/// Policy for a failing computed-field transform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeErrorPolicy {
    #[default]
    Raise,
    UseDefault,
}

fn is_default_on_error(p: &ComputeErrorPolicy) -> bool {
    *p == ComputeErrorPolicy::Raise
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in a workflow or sub-agent task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step id (`step_<nnn>`). Assigned during validation when omitted
    /// from the YAML; unique within a workflow after validation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Step-type-specific configuration.
    #[serde(flatten)]
    pub config: StepConfig,
}

/// Step-type-specific configuration payload.
///
/// Internally tagged by `type` to match the YAML structure:
/// ```yaml
/// - type: user_message
///   message: "Hello {{ inputs.name }}"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Display a message to the user. Consecutive messages are batched.
    UserMessage {
        message: String,
        #[serde(default, skip_serializing_if = "is_default_message_type")]
        message_type: MessageType,
        #[serde(default, skip_serializing_if = "is_default_message_format")]
        format: MessageFormat,
    },
    /// Prompt the user for a value, stored into state on completion.
    UserInput {
        prompt: String,
        #[serde(default, skip_serializing_if = "is_default_input_type")]
        input_type: InputType,
        /// Allowed values when `input_type` is `choice`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        choices: Option<Vec<Value>>,
        /// Optional validation expression; the submitted value binds as `value`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        validation: Option<String>,
        /// State path the accepted value is written to.
        variable: String,
        #[serde(default = "default_input_retries")]
        max_retries: u64,
    },
    /// Emit a prompt to the client agent and suspend until it responds.
    AgentPrompt {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_response: Option<Value>,
    },
    /// Validate the client agent's response and apply state updates from it.
    AgentResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_schema: Option<Value>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        state_updates: Vec<StateUpdate>,
    },
    /// Invoke an MCP tool, either on the client or server side.
    McpCall {
        tool: String,
        #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
        parameters: serde_json::Map<String, Value>,
        #[serde(default, skip_serializing_if = "is_default_exec_context")]
        execution_context: ToolExecutionContext,
        /// State path the tool result is written to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        store_result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
        #[serde(default)]
        max_retries: u64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        state_updates: Vec<StateUpdate>,
    },
    /// Run a shell command server-side, capturing its streams.
    ShellCommand {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default = "default_shell_timeout")]
        timeout_seconds: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_update: Option<StateUpdate>,
    },
    /// Suspend until the client's next poll.
    WaitStep {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Branch on a condition.
    Conditional {
        condition: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        then_steps: Vec<StepDefinition>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        else_steps: Vec<StepDefinition>,
    },
    /// Repeat a body while a condition holds.
    WhileLoop {
        condition: String,
        body: Vec<StepDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u64>,
    },
    /// Iterate a body over the items of an array expression.
    Foreach {
        /// Expression evaluating to an array.
        items: String,
        #[serde(default = "default_loop_variable")]
        variable_name: String,
        body: Vec<StepDefinition>,
    },
    /// Exit the innermost loop.
    Break {},
    /// Skip to the next iteration of the innermost loop.
    Continue {},
    /// Fan out a sub-agent task over the items of an array expression.
    ParallelForeach {
        items: String,
        sub_agent_task: String,
        #[serde(default = "default_max_parallel")]
        max_parallel: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },
    /// Apply a single state update.
    StateUpdate {
        path: String,
        #[serde(default, skip_serializing_if = "is_default_operation")]
        operation: UpdateOperation,
        value: Value,
    },
}

impl StepConfig {
    /// The step-type tag as it appears in YAML (`user_message`, ...).
    pub fn type_tag(&self) -> &'static str {
        match self {
            StepConfig::UserMessage { .. } => "user_message",
            StepConfig::UserInput { .. } => "user_input",
            StepConfig::AgentPrompt { .. } => "agent_prompt",
            StepConfig::AgentResponse { .. } => "agent_response",
            StepConfig::McpCall { .. } => "mcp_call",
            StepConfig::ShellCommand { .. } => "shell_command",
            StepConfig::WaitStep { .. } => "wait_step",
            StepConfig::Conditional { .. } => "conditional",
            StepConfig::WhileLoop { .. } => "while_loop",
            StepConfig::Foreach { .. } => "foreach",
            StepConfig::Break {} => "break",
            StepConfig::Continue {} => "continue",
            StepConfig::ParallelForeach { .. } => "parallel_foreach",
            StepConfig::StateUpdate { .. } => "state_update",
        }
    }
}

fn default_input_retries() -> u64 {
    3
}

fn default_shell_timeout() -> u64 {
    30
}

fn default_loop_variable() -> String {
    "item".to_string()
}

fn default_max_parallel() -> usize {
    10
}

/// Severity of a user-facing message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Info,
    Warning,
    Error,
    Success,
}

fn is_default_message_type(t: &MessageType) -> bool {
    *t == MessageType::Info
}

/// Rendering format of a user-facing message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFormat {
    #[default]
    Text,
    Markdown,
    Code,
}

fn is_default_message_format(f: &MessageFormat) -> bool {
    *f == MessageFormat::Text
}

/// Expected type of a user-supplied input value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    String,
    Number,
    Boolean,
    Choice,
}

fn is_default_input_type(t: &InputType) -> bool {
    *t == InputType::String
}

/// Where an MCP tool call executes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionContext {
    #[default]
    Client,
    Server,
}

fn is_default_exec_context(c: &ToolExecutionContext) -> bool {
    *c == ToolExecutionContext::Client
}

// ---------------------------------------------------------------------------
// State updates
// ---------------------------------------------------------------------------

/// One state mutation, applied through the state store.
///
/// `value` may be a literal, a `{{ ... }}` template string, or one of the
/// reserved source tokens (`stdout`, `stderr`, `returncode`, `full_output`,
/// `success`, `errors`) bound to the immediately preceding step's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateUpdate {
    pub path: String,
    #[serde(default, skip_serializing_if = "is_default_operation")]
    pub operation: UpdateOperation,
    pub value: Value,
}

/// Mutation applied to the value at a state path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOperation {
    #[default]
    Set,
    Increment,
    Decrement,
    Append,
    Multiply,
}

fn is_default_operation(op: &UpdateOperation) -> bool {
    *op == UpdateOperation::Set
}

// ---------------------------------------------------------------------------
// Sub-agent tasks
// ---------------------------------------------------------------------------

/// Definition of a sub-agent task referenced by `parallel_foreach`.
///
/// A task declares either `steps` (a full step list executed in an isolated
/// context) or `prompt_template` (shorthand for a single agent prompt).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentTask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, InputSpec>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub default_state: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "StateSchema::is_empty")]
    pub state_schema: StateSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<StepDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
    /// State path on the parent that aggregated results are written to
    /// (default `state.<task_name>_results`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Instance status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow or sub-agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Paused,
    WaitingForClient,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    /// Whether a transition from `self` to `to` is legal.
    ///
    /// Pending -> Running; Running -> Paused | WaitingForClient | terminal;
    /// Paused/WaitingForClient -> Running; any non-terminal -> Cancelled.
    pub fn can_transition_to(&self, to: InstanceStatus) -> bool {
        if *self == to {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if to == InstanceStatus::Cancelled {
            return true;
        }
        match self {
            InstanceStatus::Pending => to == InstanceStatus::Running,
            InstanceStatus::Running => matches!(
                to,
                InstanceStatus::Paused
                    | InstanceStatus::WaitingForClient
                    | InstanceStatus::Completed
                    | InstanceStatus::Failed
            ),
            InstanceStatus::Paused | InstanceStatus::WaitingForClient => {
                to == InstanceStatus::Running
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Build a definition exercising most step types.
    fn sample_workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "code-review".to_string(),
            version: "1.0.0".to_string(),
            description: Some("Review changed files in parallel".to_string()),
            inputs: HashMap::from([(
                "target_branch".to_string(),
                InputSpec {
                    value_type: ValueType::String,
                    description: None,
                    required: true,
                    default: None,
                },
            )]),
            default_state: serde_json::Map::from_iter([(
                "counter".to_string(),
                json!(0),
            )]),
            state_schema: StateSchema {
                state: HashMap::from([("counter".to_string(), ValueType::Number)]),
                computed: HashMap::from([(
                    "doubled".to_string(),
                    ComputedFieldSpec {
                        from: SourcePaths::One("state.counter".to_string()),
                        transform: "counter * 2".to_string(),
                        on_error: ComputeErrorPolicy::Raise,
                        default: None,
                    },
                )]),
            },
            steps: vec![
                StepDefinition {
                    id: "step_001".to_string(),
                    config: StepConfig::UserMessage {
                        message: "Starting review of {{ inputs.target_branch }}".to_string(),
                        message_type: MessageType::Info,
                        format: MessageFormat::Text,
                    },
                },
                StepDefinition {
                    id: "step_002".to_string(),
                    config: StepConfig::Conditional {
                        condition: "this.counter > 0".to_string(),
                        then_steps: vec![StepDefinition {
                            id: "step_003".to_string(),
                            config: StepConfig::Break {},
                        }],
                        else_steps: vec![],
                    },
                },
                StepDefinition {
                    id: "step_004".to_string(),
                    config: StepConfig::ParallelForeach {
                        items: "this.changed_files".to_string(),
                        sub_agent_task: "review_file".to_string(),
                        max_parallel: 4,
                        timeout_seconds: Some(300),
                    },
                },
            ],
            sub_agent_tasks: HashMap::from([(
                "review_file".to_string(),
                SubAgentTask {
                    description: Some("Review one file".to_string()),
                    inputs: HashMap::new(),
                    default_state: serde_json::Map::new(),
                    state_schema: StateSchema::default(),
                    steps: None,
                    prompt_template: Some("Review {{ loop.item }}".to_string()),
                    result_key: None,
                },
            )]),
            config: WorkflowConfig {
                execution_mode: Some(ExecutionMode::Parallel),
                timeout_seconds: Some(1800),
                max_iterations: None,
            },
        }
    }

    // -----------------------------------------------------------------------
    // YAML roundtrip
    // -----------------------------------------------------------------------

    #[test]
    fn test_workflow_definition_yaml_roundtrip() {
        let original = sample_workflow();
        let yaml = serde_yaml_ng::to_string(&original).expect("serialize to YAML");

        assert!(yaml.contains("code-review"));
        assert!(yaml.contains("type: user_message"));
        assert!(yaml.contains("type: parallel_foreach"));

        let parsed: WorkflowDefinition =
            serde_yaml_ng::from_str(&yaml).expect("deserialize from YAML");
        assert_eq!(parsed.name, "code-review");
        assert_eq!(parsed.steps.len(), 3);
        assert_eq!(parsed.sub_agent_tasks.len(), 1);
        assert_eq!(parsed.state_schema.computed.len(), 1);
    }

    #[test]
    fn test_parse_realistic_yaml_workflow() {
        let yaml = r#"
name: greet
description: Greet the user
inputs:
  name:
    type: string
    required: true
default_state:
  greetings: 0
state_schema:
  computed:
    loud_name:
      from: inputs.name
      transform: "name.toUpperCase()"
steps:
  - type: user_message
    message: "Hello {{ this.loud_name }}"
  - type: state_update
    path: state.greetings
    operation: increment
    value: 1
  - type: while_loop
    condition: "this.greetings < 3"
    max_iterations: 10
    body:
      - type: state_update
        path: state.greetings
        operation: increment
        value: 1
"#;
        let wf: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(wf.name, "greet");
        assert_eq!(wf.version, "1.0.0"); // default
        assert_eq!(wf.steps.len(), 3);
        assert!(wf.steps[0].id.is_empty()); // assigned during validation
        match &wf.steps[2].config {
            StepConfig::WhileLoop {
                max_iterations,
                body,
                ..
            } => {
                assert_eq!(*max_iterations, Some(10));
                assert_eq!(body.len(), 1);
            }
            other => panic!("expected while_loop, got {}", other.type_tag()),
        }
    }

    // -----------------------------------------------------------------------
    // StepConfig variants
    // -----------------------------------------------------------------------

    #[test]
    fn test_step_config_user_input_defaults() {
        let yaml = r#"
type: user_input
prompt: "Pick one"
input_type: choice
choices: ["a", "b"]
variable: state.picked
"#;
        let config: StepConfig = serde_yaml_ng::from_str(yaml).unwrap();
        match config {
            StepConfig::UserInput {
                input_type,
                max_retries,
                choices,
                ..
            } => {
                assert_eq!(input_type, InputType::Choice);
                assert_eq!(max_retries, 3); // default
                assert_eq!(choices.unwrap().len(), 2);
            }
            other => panic!("expected user_input, got {}", other.type_tag()),
        }
    }

    #[test]
    fn test_step_config_mcp_call_defaults() {
        let yaml = r#"
type: mcp_call
tool: lint_project
parameters:
  use_standards: true
store_result: state.lint_results
"#;
        let config: StepConfig = serde_yaml_ng::from_str(yaml).unwrap();
        match config {
            StepConfig::McpCall {
                execution_context,
                max_retries,
                ..
            } => {
                assert_eq!(execution_context, ToolExecutionContext::Client);
                assert_eq!(max_retries, 0);
            }
            other => panic!("expected mcp_call, got {}", other.type_tag()),
        }
    }

    #[test]
    fn test_step_config_shell_command_default_timeout() {
        let yaml = r#"
type: shell_command
command: "git diff --name-only"
state_update:
  path: state.diff
  value: stdout
"#;
        let config: StepConfig = serde_yaml_ng::from_str(yaml).unwrap();
        match config {
            StepConfig::ShellCommand {
                timeout_seconds,
                state_update,
                ..
            } => {
                assert_eq!(timeout_seconds, 30);
                let update = state_update.unwrap();
                assert_eq!(update.operation, UpdateOperation::Set);
                assert_eq!(update.value, json!("stdout"));
            }
            other => panic!("expected shell_command, got {}", other.type_tag()),
        }
    }

    #[test]
    fn test_step_config_foreach_default_variable() {
        let yaml = r#"
type: foreach
items: "this.files"
body:
  - type: user_message
    message: "{{ loop.item }}"
"#;
        let config: StepConfig = serde_yaml_ng::from_str(yaml).unwrap();
        match config {
            StepConfig::Foreach { variable_name, .. } => {
                assert_eq!(variable_name, "item");
            }
            other => panic!("expected foreach, got {}", other.type_tag()),
        }
    }

    #[test]
    fn test_step_config_break_continue_serde() {
        let brk: StepConfig = serde_yaml_ng::from_str("type: break").unwrap();
        assert!(matches!(brk, StepConfig::Break {}));
        let cont: StepConfig = serde_yaml_ng::from_str("type: continue").unwrap();
        assert!(matches!(cont, StepConfig::Continue {}));
    }

    #[test]
    fn test_type_tag_matches_serde_tag() {
        let config = StepConfig::WaitStep { message: None };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["type"], config.type_tag());
    }

    // -----------------------------------------------------------------------
    // Computed field specs
    // -----------------------------------------------------------------------

    #[test]
    fn test_computed_spec_single_and_multi_source() {
        let single: ComputedFieldSpec = serde_yaml_ng::from_str(
            "from: state.counter\ntransform: \"counter * 2\"",
        )
        .unwrap();
        assert_eq!(single.from.iter().collect::<Vec<_>>(), vec!["state.counter"]);

        let multi: ComputedFieldSpec = serde_yaml_ng::from_str(
            "from: [state.a, inputs.b]\ntransform: \"a + b\"",
        )
        .unwrap();
        assert_eq!(
            multi.from.iter().collect::<Vec<_>>(),
            vec!["state.a", "inputs.b"]
        );
        assert_eq!(multi.on_error, ComputeErrorPolicy::Raise);
    }

    // -----------------------------------------------------------------------
    // Status transitions
    // -----------------------------------------------------------------------

    #[test]
    fn test_status_transitions_legal() {
        use InstanceStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(WaitingForClient));
        assert!(WaitingForClient.can_transition_to(Running));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Paused.can_transition_to(Cancelled));
    }

    #[test]
    fn test_status_transitions_illegal() {
        use InstanceStatus::*;
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(WaitingForClient));
        // Idempotent cancel: cancelling twice equals cancelling once.
        assert!(Cancelled.can_transition_to(Cancelled));
    }

    #[test]
    fn test_value_type_matches() {
        assert!(ValueType::String.matches(&json!("x")));
        assert!(ValueType::Number.matches(&json!(3.5)));
        assert!(ValueType::Boolean.matches(&json!(true)));
        assert!(ValueType::Array.matches(&json!([1])));
        assert!(ValueType::Object.matches(&json!({})));
        assert!(!ValueType::Number.matches(&json!("3")));
    }
}
