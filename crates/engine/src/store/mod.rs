//! Persistent store — durable, monotonic record of runs, transitions,
//! outputs, and the scheduling horizon.
//!
//! Four sub-stores, each behind a trait so the engine stays
//! backend-agnostic. All writes are synchronous: when a call returns, the
//! data survives a process restart. A failed write is fatal for that
//! transition only — it never cascades to other runs.

mod file;
mod memory;

pub use file::FileDb;
pub use memory::MemoryDb;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::jobs::Job;
use crate::runs::{Run, RunState};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("duplicate run: {0}")]
    DuplicateRun(String),
    #[error("duplicate output {output_id} for run {run_id}")]
    DuplicateOutput { run_id: String, output_id: String },
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("output not found: {run_id}/{output_id}")]
    OutputNotFound { run_id: String, output_id: String },
    #[error("invalid output id: {0}")]
    InvalidOutputId(String),
    #[error("horizon may not move backwards: {prev} -> {requested}")]
    ClockRegression {
        prev: DateTime<Utc>,
        requested: DateTime<Utc>,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Selects runs by state, by rerun family, or all.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub state: Option<RunState>,
    pub rerun: Option<String>,
}

impl RunFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn state(state: RunState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn rerun(rerun: impl Into<String>) -> Self {
        Self {
            rerun: Some(rerun.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, run: &Run) -> bool {
        if let Some(state) = self.state {
            if run.state != state {
                return false;
            }
        }
        if let Some(rerun) = &self.rerun {
            if &run.rerun != rerun {
                return false;
            }
        }
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sub-store traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `job_id → JobDefinition`; written at load, read-only afterwards.
pub trait JobDb: Send + Sync {
    fn put(&self, job: &Job) -> Result<(), StoreError>;
    fn get(&self, job_id: &str) -> Option<Job>;
    fn list(&self) -> Vec<Job>;
}

/// `run_id → Run`. Iteration order is not semantic.
pub trait RunDb: Send + Sync {
    /// Insert a new run; fails with [`StoreError::DuplicateRun`] if the
    /// id exists.
    fn add(&self, run: &Run) -> Result<(), StoreError>;
    /// Overwrite an existing run; `time` is the transition time recorded
    /// in the journal.
    fn update(&self, run: &Run, time: DateTime<Utc>) -> Result<(), StoreError>;
    fn get(&self, run_id: &str) -> Option<Run>;
    fn query(&self, filter: &RunFilter) -> Vec<Run>;
}

/// `(run_id, output_id) → blob`; append-only. Re-adding an existing pair
/// is an error: outputs arrive exactly once, on the terminal transition.
pub trait OutputDb: Send + Sync {
    fn add(&self, run_id: &str, output_id: &str, data: &[u8]) -> Result<(), StoreError>;
    fn get(&self, run_id: &str, output_id: &str) -> Result<Vec<u8>, StoreError>;
    fn list_ids(&self, run_id: &str) -> Vec<String>;
}

/// Single slot holding the schedule horizon; non-decreasing.
pub trait ClockDb: Send + Sync {
    fn get_time(&self) -> Option<DateTime<Utc>>;
    fn set_time(&self, time: DateTime<Utc>) -> Result<(), StoreError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Database bundle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The four sub-stores the engine works against.
#[derive(Clone)]
pub struct Database {
    pub jobs: Arc<dyn JobDb>,
    pub runs: Arc<dyn RunDb>,
    pub outputs: Arc<dyn OutputDb>,
    pub clock: Arc<dyn ClockDb>,
}

impl Database {
    /// Ephemeral backend for tests.
    pub fn in_memory() -> Self {
        MemoryDb::database()
    }

    /// File-backed store rooted at `dir` (created if missing).
    pub fn open(dir: &std::path::Path) -> Result<Self, StoreError> {
        FileDb::open(dir)
    }
}
