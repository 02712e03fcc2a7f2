//! Per-instance execution audit log.
//!
//! Every transition the engine makes is appended here: step boundaries,
//! control-flow decisions with the evaluated condition, state writes with
//! before/after values, sub-agent lifecycle events, and warnings (iteration
//! caps, deprecated scopes). Entries live in a bounded ring buffer and are
//! exported on demand for monitoring and post-mortem diagnostics.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use aromcp_types::workflow::InstanceStatus;

/// Default ring capacity per instance.
pub const DEFAULT_TRACE_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One observed transition.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    StepStarted {
        step_id: String,
        step_type: String,
    },
    StepCompleted {
        step_id: String,
    },
    StepFailed {
        step_id: String,
        error: String,
    },
    /// A conditional or loop condition was evaluated.
    Decision {
        step_id: String,
        condition: String,
        result: bool,
    },
    LoopIteration {
        step_id: String,
        iteration: u64,
    },
    StateWrite {
        path: String,
        before: Value,
        after: Value,
    },
    StatusChanged {
        from: InstanceStatus,
        to: InstanceStatus,
    },
    SubAgentCreated {
        task_id: String,
    },
    SubAgentFinished {
        task_id: String,
        status: InstanceStatus,
    },
    Warning {
        message: String,
    },
}

/// A timestamped, sequenced trace entry.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TraceEvent,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Bounded in-memory audit ring for one instance.
#[derive(Debug)]
pub struct ExecutionTracker {
    ring: VecDeque<TraceEntry>,
    capacity: usize,
    next_seq: u64,
    steps_completed: u64,
    /// Legacy-scope paths already warned about (once per path).
    legacy_warned: HashSet<String>,
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TRACE_CAPACITY)
    }
}

impl ExecutionTracker {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            next_seq: 0,
            steps_completed: 0,
            legacy_warned: HashSet::new(),
        }
    }

    /// Append an event, evicting the oldest entry when full. Returns the
    /// sequence number, usable as a trace reference.
    pub fn record(&mut self, event: TraceEvent) -> u64 {
        if matches!(event, TraceEvent::StepCompleted { .. }) {
            self.steps_completed += 1;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(TraceEntry {
            seq,
            at: Utc::now(),
            event,
        });
        seq
    }

    /// Warn about a deprecated scope spelling, once per path.
    pub fn warn_legacy_path(&mut self, path: &str) {
        if self.legacy_warned.insert(path.to_string()) {
            tracing::warn!(path, "deprecated scope prefix; use inputs.* instead of raw.*");
            self.record(TraceEvent::Warning {
                message: format!("deprecated scope prefix in path '{path}'"),
            });
        }
    }

    pub fn steps_completed(&self) -> u64 {
        self.steps_completed
    }

    /// Snapshot the ring, oldest first.
    pub fn export(&self) -> Vec<TraceEntry> {
        self.ring.iter().cloned().collect()
    }

    /// Most recent entries, newest last.
    pub fn tail(&self, n: usize) -> Vec<TraceEntry> {
        self.ring
            .iter()
            .skip(self.ring.len().saturating_sub(n))
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
