//! Crash-recovery scenarios: the engine restarted against a store left
//! by a previous instance reproduces the same scheduled and running
//! state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use cadence_engine::jobs::{Job, ProgramTemplate, RerunPolicy, ScheduleGen};
use cadence_engine::runs::Instance;
use cadence_engine::store::RunFilter;
use cadence_engine::{Database, Engine, JobCatalog, RunState, Scheduler, SchedulerParams};

fn shell_job(job_id: &str, command: &str) -> Job {
    Job {
        job_id: job_id.into(),
        params: vec![],
        program: ProgramTemplate::Shell {
            command: command.into(),
        },
        schedules: vec![],
        reruns: RerunPolicy::default(),
    }
}

fn inst(job_id: &str) -> Instance {
    Instance::new(job_id, BTreeMap::new())
}

fn catalog(jobs: Vec<Job>) -> Arc<JobCatalog> {
    Arc::new(JobCatalog::from_jobs(jobs).unwrap())
}

async fn wait_for_state(engine: &Arc<Engine>, run_id: &str, state: RunState) {
    for _ in 0..500 {
        if engine.get_run(run_id).map(|r| r.state) == Some(state) {
            return;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    panic!(
        "run {run_id} did not reach {state:?}; currently {:?}",
        engine.get_run(run_id).map(|r| r.state)
    );
}

#[tokio::test]
async fn scheduled_run_survives_restart_and_releases() {
    let dir = tempfile::tempdir().unwrap();
    let jobs = vec![shell_job("j1", "exit 0")];

    // First instance schedules a run for later, then shuts down.
    let run_id;
    let at = Utc::now() + Duration::milliseconds(500);
    {
        let db = Database::open(dir.path()).unwrap();
        let engine = Engine::new(db, catalog(jobs.clone()));
        let run = engine.new_run(inst("j1"), false);
        run_id = run.run_id.clone();
        engine.schedule(Some(at), run).await.unwrap();
        engine.shutdown().await;
    }

    // Second instance restores the queue and releases the run on time.
    let db = Database::open(dir.path()).unwrap();
    let engine = Engine::new(db, catalog(jobs));
    let report = engine.restore();
    assert_eq!(report.requeued, 1);
    assert_eq!(engine.queue().entries(), vec![(at, run_id.clone())]);

    engine.spawn_queue_loop();
    wait_for_state(&engine, &run_id, RunState::Success).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn running_run_is_reattached_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let jobs = vec![shell_job("j1", "sleep 1")];

    let run_id;
    {
        let db = Database::open(dir.path()).unwrap();
        let engine = Engine::new(db, catalog(jobs.clone()));
        let run = engine.new_run(inst("j1"), false);
        run_id = run.run_id.clone();
        engine.schedule(None, run).await.unwrap();
        wait_for_state(&engine, &run_id, RunState::Running).await;
        // Shutdown abandons the child without a terminal transition.
        engine.shutdown().await;
    }

    // The store still says running.
    {
        let db = Database::open(dir.path()).unwrap();
        assert_eq!(db.runs.get(&run_id).unwrap().state, RunState::Running);
    }

    // The second instance reattaches; the orphaned child exits while
    // detached, so the run resolves to error with a clear reason.
    let db = Database::open(dir.path()).unwrap();
    let engine = Engine::new(db, catalog(jobs));
    let report = engine.restore();
    assert_eq!(report.reattached, 1);
    assert_eq!(engine.running_ids(), vec![run_id.clone()]);

    wait_for_state(&engine, &run_id, RunState::Error).await;
    let run = engine.get_run(&run_id).unwrap();
    assert!(run
        .message
        .as_deref()
        .unwrap()
        .contains("exit status unknown"));
    engine.shutdown().await;
}

#[tokio::test]
async fn reattach_to_dead_pid_errors_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let jobs = vec![shell_job("j1", "sleep 0.3")];

    let run_id;
    {
        let db = Database::open(dir.path()).unwrap();
        let engine = Engine::new(db, catalog(jobs.clone()));
        let run = engine.new_run(inst("j1"), false);
        run_id = run.run_id.clone();
        engine.schedule(None, run).await.unwrap();
        wait_for_state(&engine, &run_id, RunState::Running).await;
        engine.shutdown().await;
    }

    // Let the orphaned child finish so its pid is gone before restart.
    tokio::time::sleep(StdDuration::from_millis(300)).await;

    let db = Database::open(dir.path()).unwrap();
    let engine = Engine::new(db, catalog(jobs));
    engine.restore();
    wait_for_state(&engine, &run_id, RunState::Error).await;
    let run = engine.get_run(&run_id).unwrap();
    let message = run.message.as_deref().unwrap();
    assert!(
        message.contains("cannot reconnect") || message.contains("exit status unknown"),
        "unexpected message: {message}"
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn restart_replay_reproduces_scheduled_set() {
    let dir = tempfile::tempdir().unwrap();
    let jobs = vec![shell_job("j1", "exit 0"), shell_job("j2", "exit 0")];

    let mut expected = Vec::new();
    {
        let db = Database::open(dir.path()).unwrap();
        let engine = Engine::new(db, catalog(jobs.clone()));
        for (i, job) in ["j1", "j2", "j1"].iter().enumerate() {
            let run = engine.new_run(inst(job), false);
            let at = Utc::now() + Duration::seconds(600 + i as i64);
            expected.push((at, run.run_id.clone()));
            engine.schedule(Some(at), run).await.unwrap();
        }
        engine.shutdown().await;
    }

    let db = Database::open(dir.path()).unwrap();
    let engine = Engine::new(db, catalog(jobs));
    engine.restore();
    assert_eq!(engine.queue().entries(), expected);
}

#[tokio::test]
async fn horizon_is_monotonic_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let jobs = vec![Job {
        job_id: "j1".into(),
        params: vec![],
        program: ProgramTemplate::Shell {
            command: "true".into(),
        },
        schedules: vec![ScheduleGen::Once {
            time: Utc::now() + Duration::seconds(3_000),
            args: BTreeMap::new(),
        }],
        reruns: RerunPolicy::default(),
    }];
    let params = SchedulerParams {
        lookahead: Duration::seconds(3_600),
        tick: StdDuration::from_secs(60),
        max_step: Duration::seconds(3_600),
        expected_cutoff: Duration::seconds(300),
    };

    let first_horizon;
    {
        let db = Database::open(dir.path()).unwrap();
        let engine = Engine::new(db, catalog(jobs.clone()));
        let mut scheduler = Scheduler::new(engine.clone(), params.clone());
        scheduler.pass().await;
        first_horizon = engine.db().clock.get_time().expect("horizon persisted");
        engine.shutdown().await;
    }

    let db = Database::open(dir.path()).unwrap();
    let engine = Engine::new(db, catalog(jobs));
    engine.restore();
    let mut scheduler = Scheduler::new(engine.clone(), params);
    assert!(scheduler.horizon() >= first_horizon);
    scheduler.pass().await;
    let second_horizon = engine.db().clock.get_time().unwrap();
    assert!(second_horizon >= first_horizon);

    // The speculative run was regenerated, still unpersisted.
    let (runs, _) = engine.list(None, None, 10, 0);
    assert_eq!(runs.len(), 1);
    assert!(runs[0].expected);
    assert!(engine.db().runs.query(&RunFilter::all()).is_empty());
    engine.shutdown().await;
}
