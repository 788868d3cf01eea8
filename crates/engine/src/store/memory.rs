//! In-memory store backend. Satisfies the same contracts as the file
//! backend minus actual durability; used by tests to drive the engine
//! deterministically.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::jobs::Job;
use crate::runs::Run;

use super::{ClockDb, Database, JobDb, OutputDb, RunDb, RunFilter, StoreError};

pub struct MemoryDb;

impl MemoryDb {
    pub fn database() -> Database {
        Database {
            jobs: Arc::new(MemoryJobDb::default()),
            runs: Arc::new(MemoryRunDb::default()),
            outputs: Arc::new(MemoryOutputDb::default()),
            clock: Arc::new(MemoryClockDb::default()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sub-stores
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct MemoryJobDb {
    inner: RwLock<HashMap<String, Job>>,
}

impl JobDb for MemoryJobDb {
    fn put(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.write().insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    fn get(&self, job_id: &str) -> Option<Job> {
        self.inner.read().get(job_id).cloned()
    }

    fn list(&self) -> Vec<Job> {
        self.inner.read().values().cloned().collect()
    }
}

#[derive(Default)]
struct MemoryRunDb {
    inner: RwLock<HashMap<String, Run>>,
}

impl RunDb for MemoryRunDb {
    fn add(&self, run: &Run) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.contains_key(&run.run_id) {
            return Err(StoreError::DuplicateRun(run.run_id.clone()));
        }
        inner.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    fn update(&self, run: &Run, _time: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.contains_key(&run.run_id) {
            return Err(StoreError::RunNotFound(run.run_id.clone()));
        }
        inner.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    fn get(&self, run_id: &str) -> Option<Run> {
        self.inner.read().get(run_id).cloned()
    }

    fn query(&self, filter: &RunFilter) -> Vec<Run> {
        self.inner
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }
}

#[derive(Default)]
struct MemoryOutputDb {
    inner: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl OutputDb for MemoryOutputDb {
    fn add(&self, run_id: &str, output_id: &str, data: &[u8]) -> Result<(), StoreError> {
        let key = (run_id.to_owned(), output_id.to_owned());
        let mut inner = self.inner.write();
        if inner.contains_key(&key) {
            return Err(StoreError::DuplicateOutput {
                run_id: run_id.into(),
                output_id: output_id.into(),
            });
        }
        inner.insert(key, data.to_vec());
        Ok(())
    }

    fn get(&self, run_id: &str, output_id: &str) -> Result<Vec<u8>, StoreError> {
        self.inner
            .read()
            .get(&(run_id.to_owned(), output_id.to_owned()))
            .cloned()
            .ok_or_else(|| StoreError::OutputNotFound {
                run_id: run_id.into(),
                output_id: output_id.into(),
            })
    }

    fn list_ids(&self, run_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .read()
            .keys()
            .filter(|(r, _)| r == run_id)
            .map(|(_, o)| o.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[derive(Default)]
struct MemoryClockDb {
    inner: RwLock<Option<DateTime<Utc>>>,
}

impl ClockDb for MemoryClockDb {
    fn get_time(&self) -> Option<DateTime<Utc>> {
        *self.inner.read()
    }

    fn set_time(&self, time: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(prev) = *inner {
            if time < prev {
                return Err(StoreError::ClockRegression {
                    prev,
                    requested: time,
                });
            }
        }
        *inner = Some(time);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
