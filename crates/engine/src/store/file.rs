//! File-backed store. Runs go to an append-only JSONL journal replayed
//! last-record-wins on open (compacted when it grows well past the live
//! set); jobs and the clock are small JSON side files rewritten via
//! tmp-and-rename; each output blob is its own file.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::jobs::Job;
use crate::runs::Run;

use super::{ClockDb, Database, JobDb, OutputDb, RunDb, RunFilter, StoreError};

pub struct FileDb;

impl FileDb {
    pub fn open(dir: &Path) -> Result<Database, StoreError> {
        fs::create_dir_all(dir)?;
        Ok(Database {
            jobs: Arc::new(FileJobDb::open(dir.join("jobs.json"))?),
            runs: Arc::new(FileRunDb::open(dir.join("runs.jsonl"))?),
            outputs: Arc::new(FileOutputDb::open(dir.join("outputs"))?),
            clock: Arc::new(FileClockDb::open(dir.join("clock.json"))?),
        })
    }
}

/// Write `data` to `path` atomically (tmp file + rename).
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(data)?;
        f.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runs journal
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Serialize, Deserialize)]
struct JournalRecord {
    time: DateTime<Utc>,
    run: Run,
}

struct FileRunDb {
    path: PathBuf,
    inner: RwLock<HashMap<String, Run>>,
    /// Serializes appends so records never interleave.
    append_lock: Mutex<()>,
}

impl FileRunDb {
    fn open(path: PathBuf) -> Result<Self, StoreError> {
        let mut runs = HashMap::new();
        let mut lines = 0usize;
        if let Ok(content) = fs::read_to_string(&path) {
            for line in content.lines() {
                if line.is_empty() {
                    continue;
                }
                lines += 1;
                match serde_json::from_str::<JournalRecord>(line) {
                    Ok(record) => {
                        runs.insert(record.run.run_id.clone(), record.run);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping corrupt journal line");
                    }
                }
            }
        }

        let db = Self {
            path,
            inner: RwLock::new(runs),
            append_lock: Mutex::new(()),
        };

        // Compact when the journal holds far more records than live runs.
        let live = db.inner.read().len();
        if lines > live * 2 + 64 {
            tracing::info!(lines, live, "compacting runs journal");
            db.compact()?;
        }

        Ok(db)
    }

    fn compact(&self) -> Result<(), StoreError> {
        let _guard = self.append_lock.lock();
        let inner = self.inner.read();
        let mut buf = Vec::new();
        let now = Utc::now();
        for run in inner.values() {
            let line = serde_json::to_string(&JournalRecord {
                time: now,
                run: run.clone(),
            })?;
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
        }
        write_atomic(&self.path, &buf)
    }

    fn append(&self, run: &Run, time: DateTime<Utc>) -> Result<(), StoreError> {
        let line = serde_json::to_string(&JournalRecord {
            time,
            run: run.clone(),
        })?;
        let _guard = self.append_lock.lock();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }
}

impl RunDb for FileRunDb {
    fn add(&self, run: &Run) -> Result<(), StoreError> {
        {
            let inner = self.inner.read();
            if inner.contains_key(&run.run_id) {
                return Err(StoreError::DuplicateRun(run.run_id.clone()));
            }
        }
        self.append(run, Utc::now())?;
        self.inner.write().insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    fn update(&self, run: &Run, time: DateTime<Utc>) -> Result<(), StoreError> {
        {
            let inner = self.inner.read();
            if !inner.contains_key(&run.run_id) {
                return Err(StoreError::RunNotFound(run.run_id.clone()));
            }
        }
        self.append(run, time)?;
        self.inner.write().insert(run.run_id.clone(), run.clone());
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

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Jobs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct FileJobDb {
    path: PathBuf,
    inner: RwLock<HashMap<String, Job>>,
}

impl FileJobDb {
    fn open(path: PathBuf) -> Result<Self, StoreError> {
        let jobs = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            path,
            inner: RwLock::new(jobs),
        })
    }
}

impl JobDb for FileJobDb {
    fn put(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.insert(job.job_id.clone(), job.clone());
        let data = serde_json::to_vec_pretty(&*inner)?;
        write_atomic(&self.path, &data)
    }

    fn get(&self, job_id: &str) -> Option<Job> {
        self.inner.read().get(job_id).cloned()
    }

    fn list(&self) -> Vec<Job> {
        self.inner.read().values().cloned().collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct FileOutputDb {
    dir: PathBuf,
}

impl FileOutputDb {
    fn open(dir: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn blob_path(&self, run_id: &str, output_id: &str) -> Result<PathBuf, StoreError> {
        for id in [run_id, output_id] {
            if id.is_empty()
                || !id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
                || id.starts_with('.')
            {
                return Err(StoreError::InvalidOutputId(format!("{run_id}/{output_id}")));
            }
        }
        Ok(self.dir.join(run_id).join(output_id))
    }
}

impl OutputDb for FileOutputDb {
    fn add(&self, run_id: &str, output_id: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.blob_path(run_id, output_id)?;
        if path.exists() {
            return Err(StoreError::DuplicateOutput {
                run_id: run_id.into(),
                output_id: output_id.into(),
            });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, data)
    }

    fn get(&self, run_id: &str, output_id: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(run_id, output_id)?;
        fs::read(&path).map_err(|_| StoreError::OutputNotFound {
            run_id: run_id.into(),
            output_id: output_id.into(),
        })
    }

    fn list_ids(&self, run_id: &str) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.dir.join(run_id)) else {
            return vec![];
        };
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        ids.sort();
        ids
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Clock
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Serialize, Deserialize)]
struct ClockRecord {
    time: DateTime<Utc>,
}

struct FileClockDb {
    path: PathBuf,
    inner: RwLock<Option<DateTime<Utc>>>,
}

impl FileClockDb {
    fn open(path: PathBuf) -> Result<Self, StoreError> {
        let time = match fs::read_to_string(&path) {
            Ok(content) => Some(serde_json::from_str::<ClockRecord>(&content)?.time),
            Err(_) => None,
        };
        Ok(Self {
            path,
            inner: RwLock::new(time),
        })
    }
}

impl ClockDb for FileClockDb {
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
        let data = serde_json::to_vec(&ClockRecord { time })?;
        write_atomic(&self.path, &data)?;
        *inner = Some(time);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
