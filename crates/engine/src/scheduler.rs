//! Horizon scheduler — materializes runs from job schedule generators.
//!
//! The scheduler owns the *schedule horizon*: the greatest time through
//! which every due run has been durably materialized. Each pass walks all
//! generators of all jobs over the window past the horizon, merged in
//! time order, and hands fresh runs to the engine. Runs beyond
//! `now + expected_cutoff` are materialized speculatively (`expected`):
//! they appear in the upcoming-run display but are not persisted, and are
//! regenerated from the persisted horizon on restart. When the durable
//! horizon later reaches a speculative run's slot, the speculative run is
//! withdrawn and replaced by a durable twin.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;

use cadence_domain::config::SchedulerConfig;

use crate::engine::Engine;
use crate::jobs::JobCatalog;
use crate::runs::Instance;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parameters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct SchedulerParams {
    /// How far ahead of the wall clock runs are materialized.
    pub lookahead: Duration,
    /// Pause between passes.
    pub tick: std::time::Duration,
    /// Upper bound on horizon advance in a single pass.
    pub max_step: Duration,
    /// Runs further out than this are speculative.
    pub expected_cutoff: Duration,
}

impl SchedulerParams {
    pub fn from_config(cfg: &SchedulerConfig) -> Self {
        Self {
            lookahead: Duration::seconds(cfg.lookahead_sec as i64),
            tick: std::time::Duration::from_secs(cfg.tick_sec),
            max_step: Duration::seconds(cfg.max_step_sec as i64),
            expected_cutoff: Duration::seconds(cfg.expected_cutoff_sec as i64),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Window materialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// All `(time, job_id, args)` entries with `from <= time < to`, merged
/// across every generator of every job. Ordered by time; ties break by
/// `(job_id, args)`.
pub fn collect_window(
    catalog: &JobCatalog,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Vec<(DateTime<Utc>, String, BTreeMap<String, String>)> {
    let mut entries = Vec::new();
    for job in catalog.iter() {
        for gen in &job.schedules {
            for (time, args) in gen.within(from, to) {
                entries.push((time, job.job_id.clone(), args));
            }
        }
    }
    entries.sort();
    entries
}

/// Identity of a materialization slot, independent of run ids.
type Slot = (i64, String, String);

fn slot(time: DateTime<Utc>, job_id: &str, args: &BTreeMap<String, String>) -> Slot {
    let args_key = args
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\u{1f}");
    (time.timestamp_millis(), job_id.to_owned(), args_key)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Scheduler {
    engine: Arc<Engine>,
    params: SchedulerParams,
    /// Persisted horizon: everything below is durably materialized.
    horizon: DateTime<Utc>,
    /// Speculative runs handed out, keyed by slot.
    expected_out: HashMap<Slot, String>,
}

impl Scheduler {
    /// Resume from the persisted horizon (or `now` on a fresh store).
    pub fn new(engine: Arc<Engine>, params: SchedulerParams) -> Self {
        let horizon = engine.db().clock.get_time().unwrap_or_else(Utc::now);
        Self {
            engine,
            params,
            horizon,
            expected_out: HashMap::new(),
        }
    }

    pub fn horizon(&self) -> DateTime<Utc> {
        self.horizon
    }

    /// Spawn the scheduling loop; it stops on the engine's shutdown token.
    pub fn spawn(self) {
        let engine = self.engine.clone();
        let token = engine.shutdown_token();
        engine.push_loop(tokio::spawn(self.run(token)));
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(horizon = %self.horizon, "scheduler starting");
        loop {
            self.pass().await;
            tokio::select! {
                _ = tokio::time::sleep(self.params.tick) => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("scheduler stopped");
                    break;
                }
            }
        }
    }

    /// One scheduling pass: materialize the durable window, persist the
    /// advanced horizon, then refresh the speculative preview window.
    pub async fn pass(&mut self) {
        let now = Utc::now();
        let target = (now + self.params.lookahead).min(self.horizon + self.params.max_step);
        let durable_target = target.min(now + self.params.expected_cutoff).max(self.horizon);

        // ── Durable window ──────────────────────────────────────────
        if durable_target > self.horizon {
            let entries = collect_window(self.engine.catalog(), self.horizon, durable_target);
            for (time, job_id, args) in entries {
                let key = slot(time, &job_id, &args);
                if let Some(speculative_id) = self.expected_out.remove(&key) {
                    if !self.engine.withdraw_expected(&speculative_id) {
                        // The speculative run already started and was
                        // promoted; no durable twin is needed.
                        continue;
                    }
                }
                let run = self
                    .engine
                    .new_run(Instance::new(job_id.clone(), args), false);
                if let Err(e) = self.engine.schedule(Some(time), run).await {
                    tracing::error!(
                        job_id = %job_id,
                        time = %time,
                        error = %e,
                        "failed to schedule materialized run"
                    );
                }
            }
            match self.engine.db().clock.set_time(durable_target) {
                Ok(()) => self.horizon = durable_target,
                Err(e) => {
                    tracing::error!(error = %e, "failed to persist schedule horizon");
                    return;
                }
            }
        }

        // ── Speculative preview window ──────────────────────────────
        if target > durable_target {
            let entries = collect_window(self.engine.catalog(), durable_target, target);
            for (time, job_id, args) in entries {
                let key = slot(time, &job_id, &args);
                if self.expected_out.contains_key(&key) {
                    continue;
                }
                let run = self
                    .engine
                    .new_run(Instance::new(job_id.clone(), args), true);
                let run_id = run.run_id.clone();
                match self.engine.schedule(Some(time), run).await {
                    Ok(_) => {
                        self.expected_out.insert(key, run_id);
                    }
                    Err(e) => tracing::warn!(
                        job_id = %job_id,
                        time = %time,
                        error = %e,
                        "failed to schedule speculative run"
                    ),
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, ProgramTemplate, RerunPolicy, ScheduleGen};
    use crate::runs::RunState;
    use crate::store::{Database, RunFilter};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    fn job_with(job_id: &str, schedules: Vec<ScheduleGen>) -> Job {
        Job {
            job_id: job_id.into(),
            params: vec![],
            program: ProgramTemplate::Shell {
                command: "true".into(),
            },
            schedules,
            reruns: RerunPolicy::default(),
        }
    }

    fn params(lookahead_sec: i64, cutoff_sec: i64) -> SchedulerParams {
        SchedulerParams {
            lookahead: Duration::seconds(lookahead_sec),
            tick: std::time::Duration::from_secs(60),
            max_step: Duration::seconds(lookahead_sec),
            expected_cutoff: Duration::seconds(cutoff_sec),
        }
    }

    // ── collect_window ──────────────────────────────────────────────

    #[test]
    fn window_merges_jobs_in_time_order() {
        let catalog = JobCatalog::from_jobs(vec![
            job_with(
                "b",
                vec![ScheduleGen::Interval {
                    anchor: t0(),
                    period_sec: 20,
                    args: BTreeMap::new(),
                }],
            ),
            job_with(
                "a",
                vec![ScheduleGen::Interval {
                    anchor: t0() + Duration::seconds(10),
                    period_sec: 20,
                    args: BTreeMap::new(),
                }],
            ),
        ])
        .unwrap();

        let entries = collect_window(&catalog, t0(), t0() + Duration::seconds(40));
        let shape: Vec<(i64, &str)> = entries
            .iter()
            .map(|(time, job, _)| ((*time - t0()).num_seconds(), job.as_str()))
            .collect();
        assert_eq!(shape, vec![(0, "b"), (10, "a"), (20, "b"), (30, "a")]);
    }

    #[test]
    fn window_ties_break_by_job_id_then_args() {
        let gen_at = |args: BTreeMap<String, String>| ScheduleGen::Once {
            time: t0(),
            args,
        };
        let catalog = JobCatalog::from_jobs(vec![
            job_with("b", vec![gen_at(BTreeMap::new())]),
            job_with(
                "a",
                vec![
                    gen_at(BTreeMap::from([("x".into(), "2".into())])),
                    gen_at(BTreeMap::from([("x".into(), "1".into())])),
                ],
            ),
        ])
        .unwrap();

        let entries = collect_window(&catalog, t0(), t0() + Duration::seconds(1));
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].1, "a");
        assert_eq!(entries[0].2.get("x"), Some(&"1".to_string()));
        assert_eq!(entries[1].1, "a");
        assert_eq!(entries[1].2.get("x"), Some(&"2".to_string()));
        assert_eq!(entries[2].1, "b");
    }

    #[test]
    fn window_bounds_are_half_open() {
        let catalog = JobCatalog::from_jobs(vec![job_with(
            "a",
            vec![
                ScheduleGen::Once {
                    time: t0(),
                    args: BTreeMap::new(),
                },
                ScheduleGen::Once {
                    time: t0() + Duration::seconds(10),
                    args: BTreeMap::new(),
                },
            ],
        )])
        .unwrap();
        let entries = collect_window(&catalog, t0(), t0() + Duration::seconds(10));
        assert_eq!(entries.len(), 1, "`to` is exclusive");
    }

    // ── passes ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn pass_materializes_durable_and_speculative_runs() {
        let near = Utc::now() + Duration::seconds(30);
        let far = Utc::now() + Duration::seconds(3_000);
        let catalog = Arc::new(
            JobCatalog::from_jobs(vec![job_with(
                "j1",
                vec![
                    ScheduleGen::Once {
                        time: near,
                        args: BTreeMap::new(),
                    },
                    ScheduleGen::Once {
                        time: far,
                        args: BTreeMap::new(),
                    },
                ],
            )])
            .unwrap(),
        );
        let engine = Engine::new(Database::in_memory(), catalog);
        let mut scheduler = Scheduler::new(engine.clone(), params(3_600, 300));

        scheduler.pass().await;

        // The near run is durable, the far one speculative.
        let stored = engine.db().runs.query(&RunFilter::all());
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].schedule_time(), Some(near));
        assert!(!stored[0].expected);

        let (all, total) = engine.list(Some(RunState::Scheduled), None, 10, 0);
        assert_eq!(total, 2, "table shows durable and speculative runs");
        let speculative: Vec<_> = all.iter().filter(|r| r.expected).collect();
        assert_eq!(speculative.len(), 1);
        assert_eq!(speculative[0].schedule_time(), Some(far));

        // Both are queued for release.
        assert_eq!(engine.queue().len(), 2);

        // The horizon advanced and was persisted.
        let horizon = engine.db().clock.get_time().expect("horizon persisted");
        assert!(horizon > near);
        assert!(horizon < far);
        assert_eq!(scheduler.horizon(), horizon);
    }

    #[tokio::test]
    async fn repeated_passes_do_not_duplicate_speculative_runs() {
        let far = Utc::now() + Duration::seconds(3_000);
        let catalog = Arc::new(
            JobCatalog::from_jobs(vec![job_with(
                "j1",
                vec![ScheduleGen::Once {
                    time: far,
                    args: BTreeMap::new(),
                }],
            )])
            .unwrap(),
        );
        let engine = Engine::new(Database::in_memory(), catalog);
        let mut scheduler = Scheduler::new(engine.clone(), params(3_600, 300));

        scheduler.pass().await;
        scheduler.pass().await;
        scheduler.pass().await;

        let (_, total) = engine.list(None, None, 10, 0);
        assert_eq!(total, 1, "one speculative run per slot");
    }

    #[tokio::test]
    async fn speculative_run_is_replaced_by_durable_twin() {
        let at = Utc::now() + Duration::milliseconds(700);
        let catalog = Arc::new(
            JobCatalog::from_jobs(vec![job_with(
                "j1",
                vec![ScheduleGen::Once {
                    time: at,
                    args: BTreeMap::new(),
                }],
            )])
            .unwrap(),
        );
        let engine = Engine::new(Database::in_memory(), catalog);
        // Cutoff well below the slot: first pass speculates.
        let mut scheduler = Scheduler::new(engine.clone(), params(3_600, 0));

        scheduler.pass().await;
        let (runs, total) = engine.list(None, None, 10, 0);
        assert_eq!(total, 1);
        assert!(runs[0].expected);
        let speculative_id = runs[0].run_id.clone();

        // Once the slot is inside the durable cutoff, the next pass
        // withdraws the speculative run and schedules a durable twin.
        let mut scheduler2 = {
            // Same engine, wider cutoff: simulates the wall clock
            // reaching the slot.
            let mut s = Scheduler::new(engine.clone(), params(3_600, 300));
            s.horizon = scheduler.horizon();
            s.expected_out = std::mem::take(&mut scheduler.expected_out);
            s
        };
        scheduler2.pass().await;

        assert!(engine.get_run(&speculative_id).is_none(), "withdrawn");
        let stored = engine.db().runs.query(&RunFilter::all());
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].expected);
        assert_ne!(stored[0].run_id, speculative_id);
        assert_eq!(engine.queue().len(), 1);
    }

    #[tokio::test]
    async fn restart_regenerates_speculative_runs_from_horizon() {
        let far = Utc::now() + Duration::seconds(3_000);
        let catalog = Arc::new(
            JobCatalog::from_jobs(vec![job_with(
                "j1",
                vec![ScheduleGen::Once {
                    time: far,
                    args: BTreeMap::new(),
                }],
            )])
            .unwrap(),
        );
        let db = Database::in_memory();

        {
            let engine = Engine::new(db.clone(), catalog.clone());
            let mut scheduler = Scheduler::new(engine.clone(), params(3_600, 300));
            scheduler.pass().await;
            let (_, total) = engine.list(None, None, 10, 0);
            assert_eq!(total, 1);
        }

        // "Restart": a fresh engine + scheduler against the same store.
        let engine = Engine::new(db.clone(), catalog);
        engine.restore();
        let mut scheduler = Scheduler::new(engine.clone(), params(3_600, 300));
        assert_eq!(scheduler.horizon(), db.clock.get_time().unwrap());
        scheduler.pass().await;

        let (runs, total) = engine.list(None, None, 10, 0);
        assert_eq!(total, 1, "speculative run regenerated exactly once");
        assert!(runs[0].expected);
        assert!(db.runs.query(&RunFilter::all()).is_empty());
    }

    #[tokio::test]
    async fn horizon_never_regresses_across_passes() {
        let catalog = Arc::new(JobCatalog::from_jobs(vec![]).unwrap());
        let engine = Engine::new(Database::in_memory(), catalog);
        let mut scheduler = Scheduler::new(engine.clone(), params(3_600, 300));

        scheduler.pass().await;
        let h1 = scheduler.horizon();
        scheduler.pass().await;
        let h2 = scheduler.horizon();
        assert!(h2 >= h1);
        assert_eq!(engine.db().clock.get_time(), Some(h2));
    }
}
