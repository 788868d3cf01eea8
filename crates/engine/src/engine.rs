//! Lifecycle engine — owns every run's state machine.
//!
//! All state changes flow through the single `transition` mutator, which
//! enforces the state graph, persists outputs and the updated run, and
//! triggers rerun evaluation on failure. One supervision task is spawned
//! per running child; engine shutdown cancels supervision *without*
//! writing a terminal transition, leaving those runs durably `running`
//! for reattachment on the next startup.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::jobs::JobCatalog;
use crate::program::Outcome;
use crate::runs::{Run, RunEvent, RunIdGen, RunState, SCHEDULE_TIME};
use crate::store::{Database, RunFilter, StoreError};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error("unknown run: {0}")]
    UnknownRun(String),
    #[error("duplicate run: {0}")]
    DuplicateRun(String),
    #[error("run {0} is already in a terminal state")]
    AlreadyTerminal(String),
    #[error("run {0} has already started")]
    AlreadyStarted(String),
    #[error("illegal transition for run {run_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        run_id: String,
        from: RunState,
        to: RunState,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transition fields
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Updates applied alongside a state change: `meta` and `times` merge,
/// `message` overwrites, `outputs` append (terminal transitions only).
#[derive(Debug, Default)]
struct Fields {
    message: Option<String>,
    meta: BTreeMap<String, serde_json::Value>,
    times: BTreeMap<String, DateTime<Utc>>,
    outputs: BTreeMap<String, Vec<u8>>,
}

impl Fields {
    fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// What `restore` found in the store.
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub runs: usize,
    pub requeued: usize,
    pub reattached: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Engine {
    db: Database,
    catalog: Arc<JobCatalog>,
    queue: Arc<crate::queue::TimedQueue>,
    ids: RunIdGen,
    /// In-memory run table, including speculative (expected) runs.
    table: Mutex<HashMap<String, Run>>,
    /// Runs whose start is in flight (claim against double-start).
    starting: Mutex<HashSet<String>>,
    /// Supervision tasks for currently executing runs.
    running: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Queue-release and scheduler loop handles.
    loops: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    events: broadcast::Sender<RunEvent>,
}

impl Engine {
    pub fn new(db: Database, catalog: Arc<JobCatalog>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            db,
            catalog,
            queue: Arc::new(crate::queue::TimedQueue::new()),
            ids: RunIdGen::new(),
            table: Mutex::new(HashMap::new()),
            starting: Mutex::new(HashSet::new()),
            running: Mutex::new(HashMap::new()),
            loops: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            events,
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn catalog(&self) -> &Arc<JobCatalog> {
        &self.catalog
    }

    pub fn queue(&self) -> &Arc<crate::queue::TimedQueue> {
        &self.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// A fresh run (state `new`) with an engine-issued id.
    pub fn new_run(&self, inst: crate::runs::Instance, expected: bool) -> Run {
        let mut run = Run::new(self.ids.next_id(), inst, None);
        run.expected = expected;
        run
    }

    pub fn get_run(&self, run_id: &str) -> Option<Run> {
        self.table.lock().get(run_id).cloned()
    }

    /// List runs from the in-memory table (includes expected runs),
    /// newest first. Returns `(page, total_matching)`.
    pub fn list(
        &self,
        state: Option<RunState>,
        job_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> (Vec<Run>, usize) {
        let table = self.table.lock();
        let mut matching: Vec<&Run> = table
            .values()
            .filter(|r| state.map_or(true, |s| r.state == s))
            .filter(|r| job_id.map_or(true, |j| r.inst.job_id == j))
            .collect();
        matching.sort_by_key(|r| std::cmp::Reverse(RunIdGen::seq_of(&r.run_id).unwrap_or(0)));
        let total = matching.len();
        let page = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        (page, total)
    }

    /// Ids of runs with a live supervision task.
    pub fn running_ids(&self) -> Vec<String> {
        self.running.lock().keys().cloned().collect()
    }

    pub fn output(&self, run_id: &str, output_id: &str) -> Result<Vec<u8>, StoreError> {
        self.db.outputs.get(run_id, output_id)
    }

    pub fn output_ids(&self, run_id: &str) -> Vec<String> {
        self.db.outputs.list_ids(run_id)
    }

    // ── Public operations ───────────────────────────────────────────

    /// Add and schedule a new run. `time == None` starts it immediately.
    pub async fn schedule(
        self: &Arc<Self>,
        time: Option<DateTime<Utc>>,
        mut run: Run,
    ) -> Result<Run, EngineError> {
        let intended = time.unwrap_or_else(Utc::now);
        run.times.insert(SCHEDULE_TIME.into(), intended);

        {
            let mut table = self.table.lock();
            if table.contains_key(&run.run_id) {
                return Err(EngineError::DuplicateRun(run.run_id.clone()));
            }
            if !run.expected {
                match self.db.runs.add(&run) {
                    Ok(()) => {}
                    Err(StoreError::DuplicateRun(id)) => {
                        return Err(EngineError::DuplicateRun(id))
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            table.insert(run.run_id.clone(), run.clone());
        }

        match time {
            None => self.start_run(&run.run_id).await,
            Some(t) => {
                self.queue.schedule(t, run.clone());
                self.transition(&run.run_id, RunState::Scheduled, Fields::default())
            }
        }
    }

    /// Cancel a scheduled run: unschedule it and set it to `error`.
    pub async fn cancel(self: &Arc<Self>, run_id: &str) -> Result<Run, EngineError> {
        {
            let table = self.table.lock();
            let run = table
                .get(run_id)
                .ok_or_else(|| EngineError::UnknownRun(run_id.into()))?;
            if run.state.is_terminal() {
                return Err(EngineError::AlreadyTerminal(run_id.into()));
            }
            if run.state != RunState::Scheduled || self.starting.lock().contains(run_id) {
                return Err(EngineError::AlreadyStarted(run_id.into()));
            }
        }
        self.queue.unschedule(run_id);
        self.transition(run_id, RunState::Error, Fields::message("cancelled"))
    }

    /// Start a scheduled run immediately.
    pub async fn start(self: &Arc<Self>, run_id: &str) -> Result<Run, EngineError> {
        {
            let table = self.table.lock();
            let run = table
                .get(run_id)
                .ok_or_else(|| EngineError::UnknownRun(run_id.into()))?;
            if run.state.is_terminal() {
                return Err(EngineError::AlreadyTerminal(run_id.into()));
            }
            if run.state != RunState::Scheduled {
                return Err(EngineError::AlreadyStarted(run_id.into()));
            }
        }
        self.queue.unschedule(run_id);
        self.start_run(run_id).await
    }

    /// Create a rerun of `run_id`: a new run with the same instance,
    /// sharing the family's original id.
    pub async fn rerun(
        self: &Arc<Self>,
        run_id: &str,
        time: Option<DateTime<Utc>>,
    ) -> Result<Run, EngineError> {
        let (inst, family) = {
            let table = self.table.lock();
            let run = table
                .get(run_id)
                .ok_or_else(|| EngineError::UnknownRun(run_id.into()))?;
            (run.inst.clone(), run.rerun.clone())
        };
        tracing::info!(
            run_id = %run_id,
            at = %time.map(|t| t.to_rfc3339()).unwrap_or_else(|| "now".into()),
            "rerun"
        );
        let new_run = Run::new(self.ids.next_id(), inst, Some(family));
        self.schedule(time, new_run).await
    }

    /// Withdraw a speculative run that is being replaced by its durable
    /// twin. Returns false if the run already started (or is gone), in
    /// which case no twin should be created.
    pub fn withdraw_expected(&self, run_id: &str) -> bool {
        let mut table = self.table.lock();
        let withdrawable = table.get(run_id).is_some_and(|run| {
            run.expected && matches!(run.state, RunState::New | RunState::Scheduled)
        }) && !self.starting.lock().contains(run_id);
        if withdrawable {
            table.remove(run_id);
            drop(table);
            self.queue.unschedule(run_id);
        }
        withdrawable
    }

    /// Cancel all supervision (leaving running runs durable in `running`
    /// for reattachment), then stop the queue and scheduler loops.
    pub async fn shutdown(&self) {
        tracing::info!("engine shutting down");
        self.shutdown.cancel();

        let supervisions: Vec<(String, JoinHandle<()>)> =
            self.running.lock().drain().collect();
        for (run_id, handle) in supervisions {
            match handle.await {
                Ok(()) => tracing::info!(run_id = %run_id, "supervision task stopped"),
                Err(e) => tracing::warn!(run_id = %run_id, error = %e, "supervision task panicked"),
            }
        }

        let loops: Vec<JoinHandle<()>> = self.loops.lock().drain(..).collect();
        for handle in loops {
            let _ = handle.await;
        }
        tracing::info!("engine shut down");
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // ── Startup ─────────────────────────────────────────────────────

    /// Reload persisted runs: re-insert `scheduled` runs into the timed
    /// queue and reattach supervision to `running` runs.
    pub fn restore(self: &Arc<Self>) -> RestoreReport {
        let all = self.db.runs.query(&RunFilter::all());
        let mut report = RestoreReport {
            runs: all.len(),
            ..RestoreReport::default()
        };

        {
            let mut table = self.table.lock();
            for run in &all {
                self.ids.observe(&run.run_id);
                table.insert(run.run_id.clone(), run.clone());
            }
        }

        for run in all.iter().filter(|r| r.state == RunState::Scheduled) {
            if run.expected {
                // Expected runs should never have been persisted.
                tracing::error!(run_id = %run.run_id, "not rescheduling persisted expected run");
                continue;
            }
            match run.schedule_time() {
                Some(t) => {
                    self.queue.schedule(t, run.clone());
                    report.requeued += 1;
                }
                None => {
                    tracing::warn!(run_id = %run.run_id, "scheduled run has no schedule time")
                }
            }
        }

        for run in all.iter().filter(|r| r.state == RunState::Running) {
            match &run.program {
                Some(program) => {
                    tracing::info!(run_id = %run.run_id, "reattaching to running run");
                    let wait = program.reconnect(&run.meta);
                    self.supervise(&run.run_id, wait);
                    report.reattached += 1;
                }
                None => {
                    if let Err(e) = self.transition(
                        &run.run_id,
                        RunState::Error,
                        Fields::message("no program recorded; cannot reconnect"),
                    ) {
                        tracing::error!(run_id = %run.run_id, error = %e, "failed to error orphaned run");
                    }
                }
            }
        }

        report
    }

    /// Spawn the queue-release loop: started runs flow through the same
    /// internal start path as immediate schedules.
    pub fn spawn_queue_loop(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    run = engine.queue.next_due() => {
                        match engine.start_run(&run.run_id).await {
                            Ok(_) => {}
                            Err(EngineError::AlreadyStarted(_)) => {}
                            Err(e) => tracing::warn!(
                                run_id = %run.run_id,
                                error = %e,
                                "starting released run failed"
                            ),
                        }
                    }
                }
            }
            tracing::info!("timed queue loop stopped");
        });
        self.loops.lock().push(handle);
    }

    pub(crate) fn push_loop(&self, handle: JoinHandle<()>) {
        self.loops.lock().push(handle);
    }

    // ── Internal start path ─────────────────────────────────────────

    async fn start_run(self: &Arc<Self>, run_id: &str) -> Result<Run, EngineError> {
        // Claim the start, promote speculative runs, bind the program.
        let program = {
            let mut table = self.table.lock();
            let run = table
                .get_mut(run_id)
                .ok_or_else(|| EngineError::UnknownRun(run_id.into()))?;
            match run.state {
                RunState::New | RunState::Scheduled => {}
                s if s.is_terminal() => {
                    return Err(EngineError::AlreadyTerminal(run_id.into()))
                }
                _ => return Err(EngineError::AlreadyStarted(run_id.into())),
            }
            if !self.starting.lock().insert(run_id.to_owned()) {
                return Err(EngineError::AlreadyStarted(run_id.into()));
            }

            // A speculative run that actually starts becomes durable.
            if run.expected {
                run.expected = false;
                if let Err(e) = self.db.runs.add(run) {
                    self.starting.lock().remove(run_id);
                    return Err(e.into());
                }
            }

            if run.program.is_none() {
                let Some(job) = self.catalog.get(&run.inst.job_id) else {
                    let job_id = run.inst.job_id.clone();
                    drop(table);
                    self.starting.lock().remove(run_id);
                    return self.transition(
                        run_id,
                        RunState::Error,
                        Fields::message(format!("unknown job: {job_id}")),
                    );
                };
                let mut bindings = run.inst.args.clone();
                bindings.insert("run_id".into(), run.run_id.clone());
                bindings.insert("job_id".into(), run.inst.job_id.clone());
                run.program = Some(job.program.bind(&bindings));
            }
            run.program.clone().expect("program bound above")
        };

        match program.start() {
            Err(e) => {
                // Program refused to launch; terminal error.
                self.starting.lock().remove(run_id);
                self.transition(run_id, RunState::Error, Fields::message(e.message))
            }
            Ok(launch) => {
                let result = self.transition(
                    run_id,
                    RunState::Running,
                    Fields {
                        meta: launch.meta,
                        ..Fields::default()
                    },
                );
                self.starting.lock().remove(run_id);
                match result {
                    Ok(run) => {
                        self.supervise(run_id, launch.wait);
                        Ok(run)
                    }
                    Err(e) => {
                        // The child was spawned but its transition could
                        // not be recorded; drop the waiter and leave the
                        // run in its previous state.
                        tracing::error!(
                            run_id = %run_id,
                            error = %e,
                            "running transition failed; child is unsupervised"
                        );
                        Err(e)
                    }
                }
            }
        }
    }

    /// Spawn the supervision task for a running run. Engine shutdown
    /// cancels it without a terminal transition.
    fn supervise(self: &Arc<Self>, run_id: &str, wait: BoxFuture<'static, Outcome>) {
        let engine = Arc::clone(self);
        let id = run_id.to_owned();
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!(
                        run_id = %id,
                        "abandoning supervision; run stays running for reattach"
                    );
                }
                outcome = wait => engine.finish(&id, outcome),
            }
            engine.running.lock().remove(&id);
        });
        self.running.lock().insert(run_id.to_owned(), handle);
    }

    /// Completion callback: convert the child's outcome into the
    /// terminal transition.
    fn finish(self: &Arc<Self>, run_id: &str, outcome: Outcome) {
        let result = match outcome {
            Outcome::Success { meta, outputs } => self.transition(
                run_id,
                RunState::Success,
                Fields {
                    meta,
                    outputs,
                    ..Fields::default()
                },
            ),
            Outcome::Failure {
                message,
                meta,
                outputs,
            } => self.transition(
                run_id,
                RunState::Failure,
                Fields {
                    message: Some(message),
                    meta,
                    outputs,
                    ..Fields::default()
                },
            ),
            Outcome::Error {
                message,
                meta,
                outputs,
            } => self.transition(
                run_id,
                RunState::Error,
                Fields {
                    message: Some(message),
                    meta,
                    outputs,
                    ..Fields::default()
                },
            ),
        };
        if let Err(e) = result {
            tracing::error!(
                run_id = %run_id,
                error = %e,
                "terminal transition failed; run left in previous state"
            );
        }
    }

    // ── The one mutator ─────────────────────────────────────────────

    /// Apply a state change. This is the only code path that mutates a
    /// run: it enforces the state graph, persists outputs then the run
    /// (durability precedes visibility), commits the in-memory copy, and
    /// triggers rerun evaluation on failure.
    fn transition(
        self: &Arc<Self>,
        run_id: &str,
        to: RunState,
        fields: Fields,
    ) -> Result<Run, EngineError> {
        let now = Utc::now();
        let mut table = self.table.lock();
        let current = table
            .get(run_id)
            .ok_or_else(|| EngineError::UnknownRun(run_id.into()))?;
        if !current.state.can_enter(to) {
            return Err(EngineError::IllegalTransition {
                run_id: run_id.into(),
                from: current.state,
                to,
            });
        }

        let mut run = current.clone();
        run.state = to;
        run.times.extend(fields.times);
        run.times.insert(to.key().into(), now);
        run.meta.extend(fields.meta);
        if let Some(message) = fields.message {
            run.message = Some(message);
        }

        if !run.expected {
            for (output_id, blob) in &fields.outputs {
                self.db.outputs.add(&run.run_id, output_id, blob)?;
            }
            self.db.runs.update(&run, now)?;
        }

        table.insert(run_id.into(), run.clone());
        drop(table);

        tracing::debug!(run_id = %run_id, state = ?to, "transition");
        let _ = self.events.send(RunEvent::Transition {
            run_id: run.run_id.clone(),
            job_id: run.inst.job_id.clone(),
            state: to,
            time: now,
        });

        if to == RunState::Failure {
            self.spawn_rerun_eval(run.clone());
        }
        Ok(run)
    }

    // ── Rerun policy ────────────────────────────────────────────────

    /// Rerun evaluation is asynchronous from the failure transition; a
    /// rerun that fails to schedule is logged, never silently dropped.
    fn spawn_rerun_eval(self: &Arc<Self>, run: Run) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.maybe_rerun(&run).await {
                tracing::warn!(
                    run_id = %run.run_id,
                    error = %e,
                    "rerun scheduling failed"
                );
            }
        });
    }

    async fn maybe_rerun(self: &Arc<Self>, run: &Run) -> Result<(), EngineError> {
        let job = self
            .catalog
            .get(&run.inst.job_id)
            .ok_or_else(|| EngineError::UnknownJob(run.inst.job_id.clone()))?;
        let policy = &job.reruns;
        if policy.count == 0 {
            return Ok(());
        }

        // The whole family: original plus prior reruns.
        let family = self.db.runs.query(&RunFilter::rerun(&run.rerun));
        if family.len() as u32 > policy.count {
            tracing::info!(rerun = %run.rerun, "rerun count exhausted");
            return Ok(());
        }

        let now = Utc::now();
        let original = family.iter().find(|r| r.run_id == run.rerun);
        if let Some(scheduled) = original.and_then(|r| r.schedule_time()) {
            if now - scheduled > Duration::seconds(policy.max_delay_sec as i64) {
                tracing::info!(rerun = %run.rerun, "rerun max delay exceeded");
                return Ok(());
            }
        }

        let at = now + Duration::seconds(policy.delay_sec as i64);
        self.rerun(&run.run_id, Some(at)).await?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
