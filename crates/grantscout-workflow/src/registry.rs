//! Addressable runs: a shared registry of `WorkflowRun` snapshots and the
//! service that executes runs on a bounded pool of background tasks.
//!
//! The registry is a single mutex over a map. It is held only while copying
//! or updating one run, never across I/O, and is sized for dozens of
//! concurrent runs. Once a run reaches a terminal status it is frozen.
//!
//! Retention is capped: registering a run beyond the capacity evicts the
//! oldest finished runs. Pending and running runs are never evicted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use grantscout_core::{InvalidRunConfig, Phase, PhaseResult, RunConfig, RunStatus, WorkflowRun};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::pipeline::{Pipeline, RunObserver, RunSummary};

pub const DEFAULT_RETAINED_RUNS: usize = 500;

#[derive(Debug, Clone)]
pub struct WorkflowRegistry {
    runs: Arc<Mutex<HashMap<String, WorkflowRun>>>,
    capacity: usize,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RETAINED_RUNS)
    }
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            runs: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WorkflowRun>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, run: WorkflowRun) {
        let mut runs = self.lock();
        runs.insert(run.id.clone(), run);
        while runs.len() > self.capacity {
            let oldest = runs
                .values()
                .filter(|r| r.status.is_terminal())
                .min_by(|a, b| {
                    let a_done = a.completed_at.unwrap_or(a.started_at);
                    let b_done = b.completed_at.unwrap_or(b.started_at);
                    a_done.cmp(&b_done).then_with(|| a.id.cmp(&b.id))
                })
                .map(|r| r.id.clone());
            let Some(id) = oldest else {
                break;
            };
            runs.remove(&id);
            debug!(run_id = %id, "evicted finished run from registry");
        }
    }

    pub fn get(&self, id: &str) -> Option<WorkflowRun> {
        self.lock().get(id).cloned()
    }

    /// Newest first.
    pub fn list(&self, limit: usize) -> Vec<WorkflowRun> {
        let mut runs: Vec<WorkflowRun> = self.lock().values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.id.cmp(&b.id)));
        runs.truncate(limit);
        runs
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_cancelled(&self, id: &str) -> bool {
        self.lock()
            .get(id)
            .is_some_and(|run| run.status == RunStatus::Cancelled)
    }

    /// Moves a running run to `cancelled`. Any other state is left untouched
    /// and reported as `false`.
    pub fn cancel(&self, id: &str) -> bool {
        let mut runs = self.lock();
        match runs.get_mut(id) {
            Some(run) if run.status == RunStatus::Running => {
                run.status = RunStatus::Cancelled;
                run.completed_at = Some(Utc::now());
                run.current_phase = None;
                info!(run_id = id, "run cancelled");
                true
            }
            _ => false,
        }
    }

    fn update(&self, id: &str, apply: impl FnOnce(&mut WorkflowRun)) -> bool {
        let mut runs = self.lock();
        match runs.get_mut(id) {
            Some(run) if !run.status.is_terminal() => {
                apply(run);
                true
            }
            _ => false,
        }
    }

    pub fn advance_phase(&self, id: &str, phase: Phase) {
        self.update(id, |run| {
            if run.status == RunStatus::Pending {
                run.status = RunStatus::Running;
            }
            run.current_phase = Some(phase);
        });
    }

    pub fn record_phase(&self, id: &str, result: &PhaseResult, summary: &RunSummary) {
        self.update(id, |run| {
            run.phases.push(result.clone());
            copy_totals(run, summary);
        });
    }

    /// Applies the terminal summary. Ignored when the run is already terminal.
    pub fn finish(&self, id: &str, summary: RunSummary) {
        let status = summary.status;
        let applied = self.update(id, |run| {
            copy_totals(run, &summary);
            run.phases = summary.phases;
            run.status = if status.is_terminal() { status } else { RunStatus::Completed };
            run.error = summary.error;
            run.current_phase = None;
            run.completed_at = Some(Utc::now());
        });
        if applied {
            info!(run_id = id, status = %status, "run finished");
        }
    }

    pub fn fail(&self, id: &str, message: impl Into<String>) {
        let message = message.into();
        let applied = self.update(id, |run| {
            run.status = RunStatus::Failed;
            run.error = Some(message.clone());
            run.current_phase = None;
            run.completed_at = Some(Utc::now());
        });
        if applied {
            error!(run_id = id, error = %message, "run failed");
        }
    }
}

fn copy_totals(run: &mut WorkflowRun, summary: &RunSummary) {
    run.total_opportunities_found = summary.total_opportunities_found;
    run.total_opportunities_scored = summary.total_opportunities_scored;
    run.report_path.clone_from(&summary.report_path);
    run.converted_path.clone_from(&summary.converted_path);
    run.source_errors.clone_from(&summary.source_errors);
}

/// Feeds pipeline progress into the registry entry for one run.
pub struct RegistryObserver {
    registry: WorkflowRegistry,
    id: String,
}

impl RegistryObserver {
    pub fn new(registry: WorkflowRegistry, id: impl Into<String>) -> Self {
        Self {
            registry,
            id: id.into(),
        }
    }
}

impl RunObserver for RegistryObserver {
    fn phase_started(&self, phase: Phase) {
        self.registry.advance_phase(&self.id, phase);
    }

    fn phase_finished(&self, result: &PhaseResult, summary: &RunSummary) {
        self.registry.record_phase(&self.id, result, summary);
    }

    fn is_cancelled(&self) -> bool {
        self.registry.is_cancelled(&self.id)
    }
}

/// Marks the run failed if the task ends without reporting a summary.
struct FinalizeGuard {
    registry: WorkflowRegistry,
    id: String,
    armed: bool,
}

impl FinalizeGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        if self.armed {
            self.registry.fail(&self.id, "run aborted unexpectedly");
        }
    }
}

/// Starts runs in the background, at most `workers` at a time.
#[derive(Clone)]
pub struct WorkflowService {
    registry: WorkflowRegistry,
    pipeline: Arc<Pipeline>,
    workers: Arc<Semaphore>,
}

impl WorkflowService {
    pub fn new(pipeline: Pipeline, workers: usize) -> Self {
        Self::with_registry(WorkflowRegistry::new(), pipeline, workers)
    }

    pub fn with_registry(registry: WorkflowRegistry, pipeline: Pipeline, workers: usize) -> Self {
        Self {
            registry,
            pipeline: Arc::new(pipeline),
            workers: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn max_days_back(&self) -> u32 {
        self.pipeline.settings().max_days_back
    }

    /// Validates `config`, registers a pending run and schedules it. Returns
    /// the pending snapshot without waiting for any phase.
    pub fn start(&self, config: RunConfig) -> Result<WorkflowRun, InvalidRunConfig> {
        config.validate(self.max_days_back())?;

        let id = Uuid::new_v4().to_string();
        let run = WorkflowRun::pending(id.clone(), Utc::now());
        self.registry.register(run.clone());

        let registry = self.registry.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let workers = Arc::clone(&self.workers);
        let span = info_span!("workflow_run", run_id = %id);
        tokio::spawn(
            async move {
                let Ok(_permit) = workers.acquire_owned().await else {
                    registry.fail(&id, "worker pool is shut down");
                    return;
                };
                let guard = FinalizeGuard {
                    registry: registry.clone(),
                    id: id.clone(),
                    armed: true,
                };
                info!(sources = ?config.sources, days_back = config.days_back, "run started");
                let observer = RegistryObserver::new(registry.clone(), id.clone());
                let summary = pipeline.run(&id, &config, &observer).await;
                if summary.status == RunStatus::Failed {
                    warn!(error = ?summary.error, "run ended in failure");
                }
                registry.finish(&id, summary);
                guard.disarm();
            }
            .instrument(span),
        );
        Ok(run)
    }

    pub fn get_status(&self, id: &str) -> Option<WorkflowRun> {
        self.registry.get(id)
    }

    pub fn list(&self, limit: usize) -> Vec<WorkflowRun> {
        self.registry.list(limit)
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.registry.cancel(id)
    }

    /// Polls until the run is terminal. `None` for an unknown id.
    pub async fn wait_for(&self, id: &str, poll: Duration) -> Option<WorkflowRun> {
        loop {
            let run = self.registry.get(id)?;
            if run.status.is_terminal() {
                return Some(run);
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use grantscout_core::Source;
    use std::sync::atomic::Ordering;
    use tokio::sync::Notify;

    const POLL: Duration = Duration::from_millis(5);

    async fn poll_until(service: &WorkflowService, id: &str, done: impl Fn(&WorkflowRun) -> bool) -> WorkflowRun {
        for _ in 0..1000 {
            let run = service.get_status(id).unwrap();
            if done(&run) {
                return run;
            }
            tokio::time::sleep(POLL).await;
        }
        panic!("run {id} never reached the expected state");
    }

    fn single_source() -> RunConfig {
        RunConfig {
            sources: vec![Source::GrantsGov],
            ..RunConfig::default()
        }
    }

    #[test]
    fn cancel_only_applies_to_running_runs() {
        let registry = WorkflowRegistry::new();
        registry.register(WorkflowRun::pending("p", Utc::now()));
        assert!(!registry.cancel("p"));
        assert_eq!(registry.get("p").unwrap().status, RunStatus::Pending);
        assert!(!registry.cancel("missing"));

        registry.advance_phase("p", Phase::Fetch);
        assert_eq!(registry.get("p").unwrap().status, RunStatus::Running);
        assert!(registry.cancel("p"));
        let run = registry.get("p").unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.completed_at.is_some());

        let frozen = registry.get("p").unwrap();
        assert!(!registry.cancel("p"));
        assert_eq!(registry.get("p").unwrap(), frozen);
    }

    #[test]
    fn terminal_runs_ignore_later_updates() {
        let registry = WorkflowRegistry::new();
        registry.register(WorkflowRun::pending("r", Utc::now()));
        registry.advance_phase("r", Phase::Fetch);
        registry.fail("r", "boom");
        let failed = registry.get("r").unwrap();

        registry.advance_phase("r", Phase::Score);
        registry.fail("r", "again");
        assert_eq!(registry.get("r").unwrap(), failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn list_is_newest_first_and_truncated() {
        let registry = WorkflowRegistry::new();
        let now = Utc::now();
        for (i, id) in ["old", "mid", "new"].iter().enumerate() {
            registry.register(WorkflowRun::pending(*id, now + chrono::Duration::seconds(i as i64)));
        }
        let ids: Vec<_> = registry.list(2).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["new", "mid"]);
    }

    #[test]
    fn oldest_finished_runs_are_evicted_past_capacity() {
        let registry = WorkflowRegistry::with_capacity(3);
        let now = Utc::now();
        let finished = |id: &str, started: i64, done: i64| WorkflowRun {
            status: RunStatus::Completed,
            completed_at: Some(now + chrono::Duration::seconds(done)),
            ..WorkflowRun::pending(id, now + chrono::Duration::seconds(started))
        };
        registry.register(finished("a", 0, 20));
        registry.register(finished("b", 1, 5));
        registry.register(WorkflowRun::pending("c", now + chrono::Duration::seconds(2)));

        registry.register(WorkflowRun::pending("d", now + chrono::Duration::seconds(30)));
        assert_eq!(registry.len(), 3);
        assert!(registry.get("b").is_none());
        assert!(registry.get("a").is_some());

        registry.register(WorkflowRun::pending("e", now + chrono::Duration::seconds(31)));
        assert!(registry.get("a").is_none());

        // only active runs remain, so the map may grow past the cap
        registry.register(WorkflowRun::pending("f", now + chrono::Duration::seconds(32)));
        assert_eq!(registry.len(), 4);
        assert!(["c", "d", "e", "f"].iter().all(|id| registry.get(id).is_some()));
    }

    #[tokio::test]
    async fn started_run_completes_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());
        let service = WorkflowService::new(
            harness.pipeline(vec![StubAdapter::ok(Source::GrantsGov, records("g", 4))]),
            2,
        );

        let pending = service.start(single_source()).unwrap();
        assert_eq!(pending.status, RunStatus::Pending);
        assert!(pending.phases.is_empty());

        let run = service.wait_for(&pending.id, POLL).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.phases.len(), 5);
        assert_eq!(run.total_opportunities_found, Some(4));
        assert_eq!(run.total_opportunities_scored, Some(4));
        assert!(run.report_path.is_some());
        assert!(run.completed_at.is_some());
        assert_eq!(run.current_phase, None);
        assert_eq!(service.list(10).len(), 1);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_registration() {
        let dir = tempfile::tempdir().unwrap();
        let service = WorkflowService::new(Harness::new(dir.path()).pipeline(vec![]), 1);
        let err = service
            .start(RunConfig {
                days_back: 0,
                ..RunConfig::default()
            })
            .unwrap_err();
        assert!(matches!(err, InvalidRunConfig::DaysBack { got: 0, max: 30 }));
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn observed_statuses_never_go_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(dir.path());
        let service = WorkflowService::new(
            harness.pipeline(vec![StubAdapter::ok(Source::GrantsGov, records("g", 3))]),
            1,
        );
        let id = service.start(single_source()).unwrap().id;

        let mut seen = Vec::new();
        loop {
            let run = service.get_status(&id).unwrap();
            seen.push(run.status.rank());
            if run.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    }

    #[tokio::test]
    async fn cancel_stops_run_before_next_phase() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let mut harness = Harness::new(dir.path());
        harness.enrichment = Arc::new(StubEnrichment::gated(gate.clone()));
        let service = WorkflowService::new(
            harness.pipeline(vec![StubAdapter::ok(Source::GrantsGov, records("g", 3))]),
            1,
        );
        let id = service.start(single_source()).unwrap().id;

        poll_until(&service, &id, |r| r.current_phase == Some(Phase::Aggregate)).await;
        assert!(service.cancel(&id));
        let cancelled = service.get_status(&id).unwrap();
        gate.notify_one();

        let run = service.wait_for(&id, POLL).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.phases.len(), 1);
        assert_eq!(run.completed_at, cancelled.completed_at);
        assert!(!service.cancel(&id));

        // let the task reach its next checkpoint
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.filter.calls.load(Ordering::SeqCst), 0);
        assert_eq!(service.get_status(&id).unwrap(), run);
    }

    #[tokio::test]
    async fn worker_pool_bounds_concurrent_runs() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let mut harness = Harness::new(dir.path());
        harness.enrichment = Arc::new(StubEnrichment::gated(gate.clone()));
        let service = WorkflowService::new(
            harness.pipeline(vec![StubAdapter::ok(Source::GrantsGov, records("g", 2))]),
            1,
        );

        let first = service.start(single_source()).unwrap().id;
        let second = service.start(single_source()).unwrap().id;
        poll_until(&service, &first, |r| r.current_phase == Some(Phase::Aggregate)).await;
        assert_eq!(service.get_status(&second).unwrap().status, RunStatus::Pending);

        gate.notify_one();
        service.wait_for(&first, POLL).await.unwrap();
        poll_until(&service, &second, |r| r.current_phase == Some(Phase::Aggregate)).await;
        gate.notify_one();
        let second = service.wait_for(&second, POLL).await.unwrap();
        assert_eq!(second.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn panicking_stage_marks_run_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = Harness::new(dir.path());
        harness.scoring = Arc::new(FixedScorer::panicking());
        let service = WorkflowService::new(
            harness.pipeline(vec![StubAdapter::ok(Source::GrantsGov, records("g", 2))]),
            1,
        );
        let id = service.start(single_source()).unwrap().id;

        let run = service.wait_for(&id, POLL).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("run aborted unexpectedly"));
        assert_eq!(run.phases.len(), 3);
    }
}
