//! End-to-end run lifecycle scenarios against the file-backed store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use cadence_engine::jobs::{Job, ProgramTemplate, RerunPolicy};
use cadence_engine::program::OUTPUT_ID;
use cadence_engine::runs::Instance;
use cadence_engine::store::RunFilter;
use cadence_engine::{Database, Engine, JobCatalog, RunState};

fn shell_job(job_id: &str, command: &str, reruns: RerunPolicy) -> Job {
    Job {
        job_id: job_id.into(),
        params: vec![],
        program: ProgramTemplate::Shell {
            command: command.into(),
        },
        schedules: vec![],
        reruns,
    }
}

fn inst(job_id: &str) -> Instance {
    Instance::new(job_id, BTreeMap::new())
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
async fn simple_success_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    let catalog = Arc::new(
        JobCatalog::from_jobs(vec![shell_job("j1", "exit 0", RerunPolicy::default())]).unwrap(),
    );
    let engine = Engine::new(db, catalog);

    let run = engine.new_run(inst("j1"), false);
    let run_id = run.run_id.clone();
    engine.schedule(None, run).await.unwrap();
    wait_for_state(&engine, &run_id, RunState::Success).await;

    let run = engine.get_run(&run_id).unwrap();
    assert_eq!(run.meta.get("return_code"), Some(&serde_json::json!(0)));
    assert!(run.meta.contains_key("hostname"));
    assert!(run.meta.contains_key("username"));
    assert!(run.meta.contains_key("pid"));

    // Exactly one run in the store; its output blob is empty.
    let stored = engine.db().runs.query(&RunFilter::all());
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].state, RunState::Success);
    assert!(engine.output(&run_id, OUTPUT_ID).unwrap().is_empty());
}

#[tokio::test]
async fn scheduled_release_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    let catalog = Arc::new(
        JobCatalog::from_jobs(vec![shell_job("j1", "exit 0", RerunPolicy::default())]).unwrap(),
    );
    let engine = Engine::new(db, catalog);
    engine.spawn_queue_loop();

    let at = Utc::now() + Duration::milliseconds(600);
    let run = engine.new_run(inst("j1"), false);
    let run_id = run.run_id.clone();
    engine.schedule(Some(at), run).await.unwrap();

    // Before the release time: scheduled, with the intended start time.
    let run = engine.get_run(&run_id).unwrap();
    assert_eq!(run.state, RunState::Scheduled);
    assert_eq!(run.schedule_time(), Some(at));
    assert!(engine.queue().contains(&run_id));

    // After the release time: success.
    wait_for_state(&engine, &run_id, RunState::Success).await;
    let released_at = engine.get_run(&run_id).unwrap().times["running"];
    assert!(released_at >= at, "run must not start before its time");
    engine.shutdown().await;
}

#[tokio::test]
async fn failure_with_rerun_family() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    let catalog = Arc::new(
        JobCatalog::from_jobs(vec![shell_job(
            "j1",
            "exit 7",
            RerunPolicy {
                count: 2,
                delay_sec: 0,
                max_delay_sec: 3_600,
            },
        )])
        .unwrap(),
    );
    let engine = Engine::new(db, catalog);
    engine.spawn_queue_loop();

    let run = engine.new_run(inst("j1"), false);
    let original_id = run.run_id.clone();
    engine.schedule(None, run).await.unwrap();

    // Wait for the family to settle at three failed runs.
    for _ in 0..500 {
        let family = engine.db().runs.query(&RunFilter::rerun(&original_id));
        if family.len() == 3 && family.iter().all(|r| r.state == RunState::Failure) {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    tokio::time::sleep(StdDuration::from_millis(300)).await;

    let family = engine.db().runs.query(&RunFilter::rerun(&original_id));
    assert_eq!(family.len(), 3, "original plus two reruns, no more");
    for run in &family {
        assert_eq!(run.state, RunState::Failure);
        assert_eq!(run.meta.get("return_code"), Some(&serde_json::json!(7)));
        assert_eq!(run.rerun, original_id);
    }
    // Exactly one member is the original.
    assert_eq!(
        family.iter().filter(|r| r.run_id == original_id).count(),
        1
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn cancellation_before_release() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    let catalog = Arc::new(
        JobCatalog::from_jobs(vec![shell_job("j1", "exit 0", RerunPolicy::default())]).unwrap(),
    );
    let engine = Engine::new(db, catalog);
    engine.spawn_queue_loop();

    let run = engine.new_run(inst("j1"), false);
    let run_id = run.run_id.clone();
    engine
        .schedule(Some(Utc::now() + Duration::seconds(60)), run)
        .await
        .unwrap();

    let run = engine.cancel(&run_id).await.unwrap();
    assert_eq!(run.state, RunState::Error);
    assert_eq!(run.message.as_deref(), Some("cancelled"));
    // No child was ever spawned: no program bound, no pid observed.
    assert!(run.program.is_none());
    assert!(!run.meta.contains_key("pid"));
    assert!(!engine.queue().contains(&run_id));

    // Durable too.
    let stored = engine.db().runs.get(&run_id).unwrap();
    assert_eq!(stored.state, RunState::Error);
    engine.shutdown().await;
}

#[tokio::test]
async fn run_record_round_trips_through_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    let catalog = Arc::new(
        JobCatalog::from_jobs(vec![shell_job("j1", "echo {run_id}", RerunPolicy::default())])
            .unwrap(),
    );
    let engine = Engine::new(db, catalog);

    let mut args = BTreeMap::new();
    args.insert("extra".to_string(), "value".to_string());
    let run = engine.new_run(Instance::new("j1", args), false);
    let run_id = run.run_id.clone();
    engine.schedule(None, run).await.unwrap();
    wait_for_state(&engine, &run_id, RunState::Success).await;

    // Reopen the store: every field of the run must round-trip,
    // including the bound program.
    let in_memory = engine.get_run(&run_id).unwrap();
    drop(engine);
    let db = Database::open(dir.path()).unwrap();
    let reloaded = db.runs.get(&run_id).unwrap();
    assert_eq!(reloaded, in_memory);
    assert!(matches!(
        reloaded.program,
        Some(cadence_engine::Program::Shell { .. })
    ));
}
