//! Job catalog — user-defined job templates loaded from a directory.
//!
//! One TOML file per job. A job holds named parameters, a program
//! template, schedule generators, and a rerun policy. The catalog is
//! read-only after load.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::program::Program;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rerun policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerunPolicy {
    /// Maximum number of reruns after the original (0 = never rerun).
    #[serde(default)]
    pub count: u32,
    /// Pause before each rerun.
    #[serde(default = "d_delay")]
    pub delay_sec: u64,
    /// No rerun is scheduled once this much time has passed since the
    /// original run's schedule time.
    #[serde(default = "d_max_delay")]
    pub max_delay_sec: u64,
}

impl Default for RerunPolicy {
    fn default() -> Self {
        Self {
            count: 0,
            delay_sec: d_delay(),
            max_delay_sec: d_max_delay(),
        }
    }
}

fn d_delay() -> u64 {
    60
}
fn d_max_delay() -> u64 {
    3_600
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schedule generators
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A lazy, monotonically-increasing producer of `(time, args)` pairs.
/// Cron-expression parsing is deliberately out of scope; these are plain
/// time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleGen {
    /// Fire every `period_sec` seconds from `anchor` (inclusive).
    Interval {
        anchor: DateTime<Utc>,
        period_sec: u64,
        #[serde(default)]
        args: BTreeMap<String, String>,
    },
    /// Fire exactly once.
    Once {
        time: DateTime<Utc>,
        #[serde(default)]
        args: BTreeMap<String, String>,
    },
}

impl ScheduleGen {
    /// All `(time, args)` with `from <= time < to`, in ascending order.
    pub fn within(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<(DateTime<Utc>, BTreeMap<String, String>)> {
        match self {
            Self::Once { time, args } => {
                if *time >= from && *time < to {
                    vec![(*time, args.clone())]
                } else {
                    vec![]
                }
            }
            Self::Interval {
                anchor,
                period_sec,
                args,
            } => {
                if *period_sec == 0 || to <= from {
                    return vec![];
                }
                let period = Duration::seconds(*period_sec as i64);
                // First tick at or after `from`.
                let mut t = if *anchor >= from {
                    *anchor
                } else {
                    let elapsed = (from - *anchor).num_seconds().max(0) as u64;
                    let steps = elapsed.div_ceil(*period_sec);
                    *anchor + Duration::seconds((steps * *period_sec) as i64)
                };
                // Sub-second remainders can land one tick early.
                while t < from {
                    t += period;
                }
                let mut out = Vec::new();
                while t < to {
                    out.push((t, args.clone()));
                    t += period;
                }
                out
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Program template
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The unbound form of a program: placeholders `{run_id}`, `{job_id}`,
/// and each parameter name are interpolated at bind time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgramTemplate {
    Process { argv: Vec<String> },
    Shell { command: String },
}

impl ProgramTemplate {
    /// Bind the template with concrete values, producing a runnable
    /// [`Program`].
    pub fn bind(&self, bindings: &BTreeMap<String, String>) -> Program {
        match self {
            Self::Process { argv } => Program::Process {
                argv: argv.iter().map(|a| template_expand(a, bindings)).collect(),
            },
            Self::Shell { command } => Program::Shell {
                command: template_expand(command, bindings),
            },
        }
    }
}

/// Literal `{name}` substitution, no escaping. Placeholders with no
/// binding are left as-is.
pub fn template_expand(template: &str, bindings: &BTreeMap<String, String>) -> String {
    let mut out = template.to_owned();
    for (name, value) in bindings {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Stable id; defaults to the definition file's stem when absent.
    #[serde(default)]
    pub job_id: String,
    /// Ordered parameter names interpolated into the program template.
    #[serde(default)]
    pub params: Vec<String>,
    pub program: ProgramTemplate,
    #[serde(default)]
    pub schedules: Vec<ScheduleGen>,
    #[serde(default)]
    pub reruns: RerunPolicy,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Catalog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("duplicate job id: {0}")]
    Duplicate(String),
    #[error("job {job_id}: {reason}")]
    Invalid { job_id: String, reason: String },
}

/// Read-mostly map from job id to job definition, loaded once at startup.
pub struct JobCatalog {
    jobs: BTreeMap<String, Job>,
}

impl JobCatalog {
    /// Load every `*.toml` file in `dir` as a job definition.
    pub fn load(dir: &Path) -> Result<Self, CatalogError> {
        let mut jobs = Vec::new();
        let entries = std::fs::read_dir(dir).map_err(|e| CatalogError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| CatalogError::Io {
                path: dir.display().to_string(),
                source: e,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let raw = std::fs::read_to_string(&path).map_err(|e| CatalogError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            let mut job: Job = toml::from_str(&raw).map_err(|e| CatalogError::Parse {
                path: path.display().to_string(),
                source: e,
            })?;
            if job.job_id.is_empty() {
                job.job_id = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
            }
            jobs.push(job);
        }
        Self::from_jobs(jobs)
    }

    /// Build a catalog from in-memory definitions (used by tests and by
    /// the file loader above).
    pub fn from_jobs(jobs: Vec<Job>) -> Result<Self, CatalogError> {
        let mut map = BTreeMap::new();
        for job in jobs {
            validate_job(&job)?;
            if map.insert(job.job_id.clone(), job.clone()).is_some() {
                return Err(CatalogError::Duplicate(job.job_id));
            }
        }
        Ok(Self { jobs: map })
    }

    pub fn get(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

fn validate_job(job: &Job) -> Result<(), CatalogError> {
    if job.job_id.is_empty() {
        return Err(CatalogError::Invalid {
            job_id: "<unnamed>".into(),
            reason: "job_id must not be empty".into(),
        });
    }
    if let ProgramTemplate::Process { argv } = &job.program {
        if argv.is_empty() {
            return Err(CatalogError::Invalid {
                job_id: job.job_id.clone(),
                reason: "program argv must not be empty".into(),
            });
        }
    }
    for (i, gen) in job.schedules.iter().enumerate() {
        if let ScheduleGen::Interval { period_sec: 0, .. } = gen {
            return Err(CatalogError::Invalid {
                job_id: job.job_id.clone(),
                reason: format!("schedules[{i}]: period_sec must be greater than 0"),
            });
        }
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
