//! `aromcp` -- CLI entry point for the workflow engine.
//!
//! Subcommands:
//! - `serve` -- run the JSON API server
//! - `list` -- list workflows in the configured directory
//! - `validate <file>` -- validate one workflow YAML
//! - `run <name>` -- start a workflow and drive it until the first
//!   client-visible step (smoke-testing definitions without an agent)
//!
//! Exit codes: 0 success, 1 workflow failed, 2 validation/config error,
//! 3 internal error.

mod http;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};

use aromcp_core::config::EngineConfig;
use aromcp_core::definition;
use aromcp_core::engine::{EngineError, WorkflowEngine};
use aromcp_types::workflow::InstanceStatus;

const EXIT_WORKFLOW_FAILED: u8 = 1;
const EXIT_VALIDATION: u8 = 2;
const EXIT_INTERNAL: u8 = 3;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "aromcp", about = "Workflow orchestration engine for AI agents")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the JSON API server.
    Serve {
        /// Listen address.
        #[arg(long, default_value = "127.0.0.1:8700")]
        addr: String,
    },
    /// List workflows in the workflow directory.
    List,
    /// Validate a workflow YAML file.
    Validate {
        /// Path to the YAML file.
        file: PathBuf,
    },
    /// Start a workflow and drive it to its first client-visible step.
    Run {
        /// Workflow name.
        name: String,
        /// Inputs as key=value pairs (values parsed as JSON when possible).
        #[arg(long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init(cli.log_json);

    match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

async fn run(command: Command) -> anyhow::Result<ExitCode> {
    match command {
        Command::Serve { addr } => serve(&addr).await,
        Command::List => list(),
        Command::Validate { file } => Ok(validate(&file)),
        Command::Run { name, inputs } => run_workflow(&name, &inputs).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn serve(addr: &str) -> anyhow::Result<ExitCode> {
    let engine = Arc::new(WorkflowEngine::new(EngineConfig::from_env()));
    let count = engine.load_directory()?;
    tracing::info!(workflows = count, addr, "serving");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, http::router(engine)).await?;
    Ok(ExitCode::SUCCESS)
}

fn list() -> anyhow::Result<ExitCode> {
    let engine = WorkflowEngine::new(EngineConfig::from_env());
    engine.load_directory()?;
    let workflows = engine.list_workflows();
    if workflows.is_empty() {
        println!("no workflows found");
        return Ok(ExitCode::SUCCESS);
    }
    for wf in workflows {
        println!(
            "{}  v{}  {}",
            wf.name,
            wf.version,
            wf.description.unwrap_or_default()
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn validate(file: &PathBuf) -> ExitCode {
    match validate_file(file) {
        Ok(summary) => {
            println!("{summary}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("invalid workflow: {err}");
            ExitCode::from(EXIT_VALIDATION)
        }
    }
}

fn validate_file(file: &PathBuf) -> Result<String, String> {
    definition::load_workflow_file(file)
        .map(|def| format!("{} is valid ({} root steps)", def.name, def.steps.len()))
        .map_err(|err| err.to_string())
}

async fn run_workflow(name: &str, raw_inputs: &[String]) -> anyhow::Result<ExitCode> {
    let engine = WorkflowEngine::new(EngineConfig::from_env());
    engine.load_directory()?;

    let inputs = match parse_inputs(raw_inputs) {
        Ok(inputs) => inputs,
        Err(err) => {
            eprintln!("invalid input: {err}");
            return Ok(ExitCode::from(EXIT_VALIDATION));
        }
    };

    let id = match engine.start(name, inputs) {
        Ok(id) => id,
        Err(err @ (EngineError::InvalidInputs(_) | EngineError::UnknownWorkflow(_))) => {
            eprintln!("{err}");
            return Ok(ExitCode::from(EXIT_VALIDATION));
        }
        Err(err) => return Err(err.into()),
    };
    println!("started {id}");

    match engine.get_next_step(&id, None).await? {
        Some(step) => {
            println!("{}", serde_json::to_string_pretty(&step)?);
        }
        None => {
            let status = engine.status(&id).await?;
            println!("terminal: {:?}", status.state);
            if status.state == InstanceStatus::Failed {
                if let Some(error) = status.error {
                    eprintln!("workflow failed: {}", error.message);
                }
                return Ok(ExitCode::from(EXIT_WORKFLOW_FAILED));
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Parse `key=value` pairs; values that parse as JSON keep their type,
/// anything else is a string.
fn parse_inputs(raw: &[String]) -> Result<Map<String, Value>, String> {
    let mut inputs = Map::new();
    for pair in raw {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("'{pair}' is not KEY=VALUE"))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inputs_types() {
        let inputs = parse_inputs(&[
            "name=Alice".to_string(),
            "count=3".to_string(),
            "flag=true".to_string(),
            "items=[1,2]".to_string(),
        ])
        .unwrap();
        assert_eq!(inputs["name"], Value::String("Alice".to_string()));
        assert_eq!(inputs["count"], serde_json::json!(3));
        assert_eq!(inputs["flag"], serde_json::json!(true));
        assert_eq!(inputs["items"], serde_json::json!([1, 2]));
    }

    #[test]
    fn test_parse_inputs_rejects_bare_keys() {
        assert!(parse_inputs(&["oops".to_string()]).is_err());
    }

    #[test]
    fn test_validate_file_verdicts() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.yaml");
        std::fs::write(&good, "name: ok\nsteps:\n  - type: user_message\n    message: hi\n")
            .unwrap();
        assert!(validate_file(&good).unwrap().contains("ok is valid"));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "name: ok\nsteps: []\n").unwrap();
        assert!(validate_file(&bad).unwrap_err().contains("at least one step"));
    }
}
