//! Engine configuration from environment variables.
//!
//! - `AROMCP_WORKFLOW_DIR` -- where workflow YAML definitions live.
//! - `AROMCP_WORKFLOW_DEBUG=serial` -- collapse `parallel_foreach` into
//!   sequential execution on the main poller.
//! - `AROMCP_MAX_ITERATIONS` -- default loop iteration cap.
//!
//! Malformed values fall back to defaults with a warning rather than
//! failing startup.

use std::path::PathBuf;

pub const ENV_WORKFLOW_DIR: &str = "AROMCP_WORKFLOW_DIR";
pub const ENV_WORKFLOW_DEBUG: &str = "AROMCP_WORKFLOW_DEBUG";
pub const ENV_MAX_ITERATIONS: &str = "AROMCP_MAX_ITERATIONS";

/// Default loop iteration cap.
pub const DEFAULT_MAX_ITERATIONS: u64 = 100;

/// Default workflow directory relative to the working directory.
pub const DEFAULT_WORKFLOW_DIR: &str = "./workflows";

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Process-wide engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workflow_dir: PathBuf,
    /// Debug-serial mode: `parallel_foreach` executes sequentially on the
    /// main poller while preserving final state.
    pub debug_serial: bool,
    pub default_max_iterations: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workflow_dir: PathBuf::from(DEFAULT_WORKFLOW_DIR),
            debug_serial: false,
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl EngineConfig {
    /// Read configuration from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var(ENV_WORKFLOW_DIR) {
            if !dir.is_empty() {
                config.workflow_dir = PathBuf::from(dir);
            }
        }

        if let Ok(mode) = std::env::var(ENV_WORKFLOW_DEBUG) {
            config.debug_serial = mode.eq_ignore_ascii_case("serial");
        }

        if let Ok(raw) = std::env::var(ENV_MAX_ITERATIONS) {
            match raw.parse::<u64>() {
                Ok(cap) if cap > 0 => config.default_max_iterations = cap,
                _ => {
                    tracing::warn!(
                        value = raw.as_str(),
                        "ignoring invalid {ENV_MAX_ITERATIONS}, using default"
                    );
                }
            }
        }

        config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(!config.debug_serial);
        assert_eq!(config.default_max_iterations, 100);
        assert_eq!(config.workflow_dir, PathBuf::from("./workflows"));
    }
}
