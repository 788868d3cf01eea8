//! Run records — the unit of state for every execution attempt.
//!
//! A `Run` is created by the horizon scheduler or by a user operation,
//! moves through the state graph below, and is persisted on every
//! transition (unless speculative). Reruns are *new* runs that share the
//! original's `rerun` id; they are never in-place transitions.
//!
//! ```text
//! new ──► scheduled ──► running ──► {success, failure, error}
//!  │           │           ▲
//!  │           └── error   │ (cancellation)
//!  └───────────────────────┘ (immediate start)
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::program::Program;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    New,
    Scheduled,
    Running,
    Success,
    Failure,
    Error,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Error)
    }

    /// Whether the state graph permits moving from `self` to `next`.
    /// Terminal states are absorbing.
    pub fn can_enter(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (New, Scheduled)
                | (New, Running)
                | (New, Error)
                | (Scheduled, Running)
                | (Scheduled, Error)
                | (Running, Success)
                | (Running, Failure)
                | (Running, Error)
        )
    }

    /// Key under which the transition timestamp is recorded in `times`.
    pub fn key(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Instance
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A job id plus a concrete binding of its parameters — the
/// deduplication key for "what to run". One instance may have many runs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instance {
    pub job_id: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

impl Instance {
    pub fn new(job_id: impl Into<String>, args: BTreeMap<String, String>) -> Self {
        Self {
            job_id: job_id.into(),
            args,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Key in `times` holding the intended start time.
pub const SCHEDULE_TIME: &str = "schedule";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub inst: Instance,
    /// Run id of the original run in this rerun family; equals `run_id`
    /// for originals.
    pub rerun: String,
    /// Speculative run materialized beyond the durable horizon. Never
    /// persisted; regenerated from the clock store on restart.
    #[serde(default)]
    pub expected: bool,
    pub state: RunState,
    /// Transition name → timestamp. Always contains `schedule` once the
    /// run has an intended start time.
    #[serde(default)]
    pub times: BTreeMap<String, DateTime<Utc>>,
    /// Free-form observations (hostname, pid, return code, …)
    /// accumulated across transitions.
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
    /// Short human-readable reason for the current state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The bound program, attached at first start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<Program>,
}

impl Run {
    /// A fresh run in state `new`. `rerun` defaults to the run's own id.
    pub fn new(run_id: impl Into<String>, inst: Instance, rerun: Option<String>) -> Self {
        let run_id = run_id.into();
        let rerun = rerun.unwrap_or_else(|| run_id.clone());
        Self {
            run_id,
            inst,
            rerun,
            expected: false,
            state: RunState::New,
            times: BTreeMap::new(),
            meta: BTreeMap::new(),
            message: None,
            program: None,
        }
    }

    pub fn schedule_time(&self) -> Option<DateTime<Utc>> {
        self.times.get(SCHEDULE_TIME).copied()
    }

    pub fn is_original(&self) -> bool {
        self.rerun == self.run_id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run id generation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Produces unique, monotonic run ids of the form `r<seq>`. The sequence
/// is resumed past the largest persisted id on restart so ids stay
/// monotonic across process lifetimes.
pub struct RunIdGen {
    next: AtomicU64,
}

impl RunIdGen {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Parse the sequence number out of an id (`"r42"` → `42`).
    pub fn seq_of(run_id: &str) -> Option<u64> {
        run_id.strip_prefix('r')?.parse().ok()
    }

    /// Ensure future ids sort after `run_id`.
    pub fn observe(&self, run_id: &str) {
        if let Some(seq) = Self::seq_of(run_id) {
            self.next.fetch_max(seq + 1, Ordering::Relaxed);
        }
    }

    pub fn next_id(&self) -> String {
        format!("r{}", self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RunIdGen {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run events (for SSE broadcast)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    #[serde(rename = "run.transition")]
    Transition {
        run_id: String,
        job_id: String,
        state: RunState,
        time: DateTime<Utc>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
