//! Task scheduler
//!
//! One scheduler per job. Units are queued per stage and a fixed pool of
//! workers pulls from whichever stage has ready work, deepest stage first.
//! Within one stage the queue is FIFO.
//!
//! Every unit is backed by a StageRun row. The row is claimed with a
//! conditional insert before the unit is queued, and every status change
//! after that is a compare-and-swap, so a second submission of the same
//! (stage, sub-target) pair can never run alongside the first.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use kavach_common::{
    EngineError, FindingDraft, RetryPolicy, ScanStore, Stage, StageRun, StageRunKey, StageStatus,
    SubTarget,
};

use crate::progress::ProgressTracker;

/// One (stage, sub-target) pair to execute. Global stages carry no
/// sub-target and are keyed on the root target.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub key: StageRunKey,
    pub sub_target: Option<SubTarget>,
}

impl WorkUnit {
    pub fn global<S: Into<String>>(job_id: Uuid, stage: Stage, root_key: S) -> Self {
        Self {
            key: StageRunKey::new(job_id, stage, root_key),
            sub_target: None,
        }
    }

    pub fn for_sub_target(stage: Stage, sub_target: SubTarget) -> Self {
        Self {
            key: StageRunKey::new(sub_target.job_id, stage, sub_target.dedup_key.clone()),
            sub_target: Some(sub_target),
        }
    }
}

/// Output collected across the attempts of one unit. Engines that already
/// answered are not invoked again on retry.
#[derive(Debug, Default)]
pub struct UnitProgress {
    /// (engine id, finding)
    pub findings: Vec<(String, FindingDraft)>,
    pub discovered: Vec<String>,
    pub alive: Vec<bool>,
    pub completed: HashSet<String>,
    /// Engines that failed with a non-retryable error.
    pub fatal: HashSet<String>,
    pub errors: Vec<String>,
}

/// What became of a unit.
#[derive(Debug)]
pub struct UnitOutcome {
    pub key: StageRunKey,
    pub sub_target: Option<SubTarget>,
    pub status: StageStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub progress: UnitProgress,
    pub elapsed: Duration,
}

impl UnitOutcome {
    fn settled(unit: WorkUnit, run: &StageRun, elapsed: Duration) -> Self {
        Self {
            key: unit.key,
            sub_target: unit.sub_target,
            status: run.status,
            attempts: run.attempts,
            last_error: run.last_error.clone(),
            progress: UnitProgress::default(),
            elapsed,
        }
    }
}

/// Runs one attempt of a unit.
#[async_trait]
pub trait UnitExecutor: Send + Sync {
    async fn attempt(
        &self,
        unit: &WorkUnit,
        progress: &mut UnitProgress,
        attempt: u32,
    ) -> Result<(), EngineError>;
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("scheduler overloaded: queue depth {depth} at ceiling {ceiling}")]
    Overloaded { depth: usize, ceiling: usize },

    #[error("stage run {0} is already in flight")]
    AlreadyInFlight(StageRunKey),

    #[error("stage run {0} already settled")]
    AlreadySettled(StageRunKey),

    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Resolves once the unit reaches a terminal state.
pub struct UnitHandle {
    key: StageRunKey,
    rx: oneshot::Receiver<UnitOutcome>,
}

impl UnitHandle {
    pub fn key(&self) -> &StageRunKey {
        &self.key
    }

    pub async fn wait(self) -> UnitOutcome {
        let key = self.key;
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => UnitOutcome {
                key,
                sub_target: None,
                status: StageStatus::Failed,
                attempts: 0,
                last_error: Some("scheduler stopped".to_string()),
                progress: UnitProgress::default(),
                elapsed: Duration::ZERO,
            },
        }
    }
}

/// Recorded on runs whose retries were cut short by cancellation.
pub const CANCELLED_AT_RETRY: &str = "cancelled at retry boundary";

enum Ending {
    Succeeded,
    Failed(EngineError),
    Cancelled,
}

struct Queued {
    unit: WorkUnit,
    run: StageRun,
    reply: oneshot::Sender<UnitOutcome>,
}

#[derive(Default)]
struct Queues {
    ready: BTreeMap<Stage, VecDeque<Queued>>,
    depth: usize,
}

impl Queues {
    fn pop(&mut self) -> Option<Queued> {
        let next = self
            .ready
            .iter_mut()
            .rev()
            .find_map(|(_, queue)| queue.pop_front())?;
        self.depth -= 1;
        Some(next)
    }
}

pub struct SchedulerSettings {
    pub workers: usize,
    pub queue_ceiling: usize,
    pub retry: RetryPolicy,
}

struct Inner {
    job_id: Uuid,
    store: Arc<dyn ScanStore>,
    executor: Arc<dyn UnitExecutor>,
    progress: Arc<ProgressTracker>,
    retry: RetryPolicy,
    queue_ceiling: usize,
    queues: Mutex<Queues>,
    notify: Notify,
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the worker pool. `cancel` stops dispatch: queued units are
    /// skipped and retries stop, while attempts already running finish.
    pub fn start(
        job_id: Uuid,
        store: Arc<dyn ScanStore>,
        executor: Arc<dyn UnitExecutor>,
        progress: Arc<ProgressTracker>,
        settings: SchedulerSettings,
        cancel: CancellationToken,
    ) -> Self {
        let inner = Arc::new(Inner {
            job_id,
            store,
            executor,
            progress,
            retry: settings.retry,
            queue_ceiling: settings.queue_ceiling.max(1),
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            cancel,
            shutdown: CancellationToken::new(),
        });

        let workers = (0..settings.workers.max(1))
            .map(|_| {
                let inner = inner.clone();
                tokio::spawn(async move { inner.work().await })
            })
            .collect();

        Self { inner, workers }
    }

    /// Claim the unit's StageRun and queue it.
    pub async fn submit(&self, unit: WorkUnit) -> Result<UnitHandle, SchedulerError> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }

        {
            let mut queues = inner.queues.lock().await;
            if queues.depth >= inner.queue_ceiling {
                return Err(SchedulerError::Overloaded {
                    depth: queues.depth,
                    ceiling: inner.queue_ceiling,
                });
            }
            queues.depth += 1;
        }

        let run = match inner.claim(&unit).await {
            Ok(run) => run,
            Err(e) => {
                inner.queues.lock().await.depth -= 1;
                return Err(e);
            }
        };

        let (tx, rx) = oneshot::channel();
        let key = unit.key.clone();
        inner.progress.unit_queued(&key).await;
        {
            let mut queues = inner.queues.lock().await;
            queues
                .ready
                .entry(key.stage)
                .or_default()
                .push_back(Queued {
                    unit,
                    run,
                    reply: tx,
                });
            kavach_telemetry::record_queue_depth(queues.depth);
        }
        inner.notify.notify_one();
        Ok(UnitHandle { key, rx })
    }

    pub async fn queue_depth(&self) -> usize {
        self.inner.queues.lock().await.depth
    }

    /// Stop the workers once the queue is empty. Attempts in progress are
    /// awaited.
    pub async fn shutdown(mut self) {
        self.inner.shutdown.cancel();
        for worker in std::mem::take(&mut self.workers) {
            if let Err(e) = worker.await {
                warn!(job_id = %self.inner.job_id, error = %e, "scheduler worker aborted");
            }
        }
    }
}

impl Inner {
    async fn claim(&self, unit: &WorkUnit) -> Result<StageRun, SchedulerError> {
        let run = StageRun::pending(
            unit.key.clone(),
            unit.sub_target.as_ref().map(|s| s.id),
        );
        if self.store.insert_stage_run(&run).await? {
            return Ok(run);
        }

        let existing = self
            .store
            .load_stage_run(&unit.key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("stage run {} vanished during claim", unit.key))?;
        match existing.status {
            StageStatus::Pending | StageStatus::Running => {
                Err(SchedulerError::AlreadyInFlight(unit.key.clone()))
            }
            StageStatus::Succeeded | StageStatus::Skipped => {
                Err(SchedulerError::AlreadySettled(unit.key.clone()))
            }
            StageStatus::Failed => {
                // a failed run is superseded by a fresh one, never duplicated
                let fresh = StageRun {
                    status: StageStatus::Pending,
                    attempts: 0,
                    last_error: None,
                    updated_at: Utc::now(),
                    ..existing.clone()
                };
                if self.store.update_stage_run(&existing, &fresh).await? {
                    Ok(fresh)
                } else {
                    Err(SchedulerError::AlreadyInFlight(unit.key.clone()))
                }
            }
        }
    }

    async fn work(&self) {
        loop {
            let next = self.queues.lock().await.pop();
            match next {
                Some(queued) => self.run(queued).await,
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }
    }

    async fn transition(&self, current: &StageRun, next: StageRun) -> Option<StageRun> {
        match self.store.update_stage_run(current, &next).await {
            Ok(true) => Some(next),
            Ok(false) => {
                warn!(key = %current.key(), "stage run changed underneath us");
                None
            }
            Err(e) => {
                error!(key = %current.key(), error = %e, "failed to update stage run");
                None
            }
        }
    }

    #[instrument(skip_all, fields(job_id = %self.job_id, stage = %queued.unit.key.stage, sub_target = %queued.unit.key.dedup_key))]
    async fn run(&self, queued: Queued) {
        let Queued { unit, run, reply } = queued;
        let started = Instant::now();

        if self.cancel.is_cancelled() {
            let skipped = StageRun {
                status: StageStatus::Skipped,
                last_error: Some("cancelled before dispatch".to_string()),
                updated_at: Utc::now(),
                ..run.clone()
            };
            let settled = self.transition(&run, skipped).await.unwrap_or(run);
            self.progress
                .unit_finished(&unit.key, settled.status, settled.last_error.as_deref(), Duration::ZERO)
                .await;
            let _ = reply.send(UnitOutcome::settled(unit, &settled, Duration::ZERO));
            return;
        }

        let claimed = StageRun {
            status: StageStatus::Running,
            attempts: 1,
            updated_at: Utc::now(),
            ..run.clone()
        };
        let Some(mut current) = self.transition(&run, claimed).await else {
            let stored = self.store.load_stage_run(&unit.key).await.ok().flatten().unwrap_or(run);
            let _ = reply.send(UnitOutcome::settled(unit, &stored, started.elapsed()));
            return;
        };

        let mut progress = UnitProgress::default();
        let ending = loop {
            self.progress.unit_dispatched(&unit.key, current.attempts).await;
            let err = match self.executor.attempt(&unit, &mut progress, current.attempts).await {
                Ok(()) => break Ending::Succeeded,
                Err(e) => e,
            };

            if !err.is_retryable() || current.attempts > self.retry.budget {
                break Ending::Failed(err);
            }
            if self.cancel.is_cancelled() {
                debug!("cancel observed at retry boundary");
                break Ending::Cancelled;
            }

            let backoff = self.retry.backoff(current.attempts);
            let message = err.to_string();
            self.progress
                .unit_retrying(&unit.key, current.attempts, &message, backoff)
                .await;
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.cancel.cancelled() => {
                    debug!("cancel observed during backoff");
                    break Ending::Cancelled;
                }
            }

            let retried = StageRun {
                attempts: current.attempts + 1,
                last_error: Some(message),
                updated_at: Utc::now(),
                ..current.clone()
            };
            match self.transition(&current, retried).await {
                Some(next) => current = next,
                None => break Ending::Failed(EngineError::Fatal("stage run superseded".to_string())),
            }
        };

        let finished = match ending {
            Ending::Succeeded => StageRun {
                status: StageStatus::Succeeded,
                updated_at: Utc::now(),
                ..current.clone()
            },
            Ending::Failed(e) => StageRun {
                status: StageStatus::Failed,
                last_error: Some(e.to_string()),
                updated_at: Utc::now(),
                ..current.clone()
            },
            Ending::Cancelled => StageRun {
                status: StageStatus::Skipped,
                last_error: Some(CANCELLED_AT_RETRY.to_string()),
                updated_at: Utc::now(),
                ..current.clone()
            },
        };
        let settled = self.transition(&current, finished.clone()).await.unwrap_or(finished);
        let elapsed = started.elapsed();
        self.progress
            .unit_finished(&unit.key, settled.status, settled.last_error.as_deref(), elapsed)
            .await;

        let _ = reply.send(UnitOutcome {
            key: unit.key,
            sub_target: unit.sub_target,
            status: settled.status,
            attempts: settled.attempts,
            last_error: settled.last_error,
            progress,
            elapsed,
        });
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::NullPublisher;
    use kavach_common::{StageRunFilter, SubTargetKind};
    use kavach_storage::MemoryStore;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    struct Scripted {
        calls: AtomicU32,
        fail_first: u32,
        error: EngineError,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Scripted {
        fn new(fail_first: u32, error: EngineError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                error,
                delay: Duration::ZERO,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl UnitExecutor for Scripted {
        async fn attempt(
            &self,
            _unit: &WorkUnit,
            progress: &mut UnitProgress,
            _attempt: u32,
        ) -> Result<(), EngineError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                return Err(self.error.clone());
            }
            progress.discovered.push(format!("call-{call}"));
            Ok(())
        }
    }

    fn settings(workers: usize, budget: u32) -> SchedulerSettings {
        SchedulerSettings {
            workers,
            queue_ceiling: 100,
            retry: RetryPolicy {
                budget,
                base_backoff_ms: 1,
                max_backoff_ms: 5,
                factor: 2,
            },
        }
    }

    fn setup(
        executor: Arc<dyn UnitExecutor>,
        settings: SchedulerSettings,
    ) -> (Scheduler, Arc<MemoryStore>, Uuid, CancellationToken) {
        let store = Arc::new(MemoryStore::new());
        let job_id = Uuid::new_v4();
        let progress = Arc::new(ProgressTracker::new(job_id, store.clone(), Arc::new(NullPublisher)));
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::start(job_id, store.clone(), executor, progress, settings, cancel.clone());
        (scheduler, store, job_id, cancel)
    }

    fn unit(job_id: Uuid, key: &str) -> WorkUnit {
        let sub = SubTarget::new(job_id, key.into(), key.into(), SubTargetKind::Domain, Stage::Discovery);
        WorkUnit::for_sub_target(Stage::VulnerabilityDetection, sub)
    }

    #[tokio::test]
    async fn timeout_retries_then_fails() {
        let exec = Arc::new(Scripted::new(10, EngineError::Timeout(Duration::from_millis(5))));
        let (scheduler, store, job_id, _) = setup(exec.clone(), settings(2, 2));

        let outcome = scheduler.submit(unit(job_id, "a.example.com")).await.unwrap().wait().await;
        assert_eq!(outcome.status, StageStatus::Failed);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 3);

        let stored = store.load_stage_run(&outcome.key).await.unwrap().unwrap();
        assert_eq!(stored.status, StageStatus::Failed);
        assert!(stored.last_error.unwrap().contains("timed out"));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn transient_error_recovers_within_budget() {
        let exec = Arc::new(Scripted::new(1, EngineError::ConnectionReset("rst".into())));
        let (scheduler, _, job_id, _) = setup(exec.clone(), settings(1, 2));

        let outcome = scheduler.submit(unit(job_id, "b.example.com")).await.unwrap().wait().await;
        assert_eq!(outcome.status, StageStatus::Succeeded);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.progress.discovered, vec!["call-2".to_string()]);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let exec = Arc::new(Scripted::new(5, EngineError::MalformedTarget("bad".into())));
        let (scheduler, _, job_id, _) = setup(exec.clone(), settings(1, 3));

        let outcome = scheduler.submit(unit(job_id, "c.example.com")).await.unwrap().wait().await;
        assert_eq!(outcome.status, StageStatus::Failed);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected() {
        let exec = Arc::new(Scripted::new(0, EngineError::Fatal("unused".into())).with_delay(Duration::from_millis(50)));
        let (scheduler, _, job_id, _) = setup(exec, settings(1, 0));

        let first = scheduler.submit(unit(job_id, "d.example.com")).await.unwrap();
        let second = scheduler.submit(unit(job_id, "d.example.com")).await;
        assert!(matches!(second, Err(SchedulerError::AlreadyInFlight(_))));

        assert_eq!(first.wait().await.status, StageStatus::Succeeded);
        let third = scheduler.submit(unit(job_id, "d.example.com")).await;
        assert!(matches!(third, Err(SchedulerError::AlreadySettled(_))));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn failed_run_is_superseded() {
        let exec = Arc::new(Scripted::new(1, EngineError::Fatal("boom".into())));
        let (scheduler, store, job_id, _) = setup(exec, settings(1, 0));

        let failed = scheduler.submit(unit(job_id, "e.example.com")).await.unwrap().wait().await;
        assert_eq!(failed.status, StageStatus::Failed);

        let retried = scheduler.submit(unit(job_id, "e.example.com")).await.unwrap().wait().await;
        assert_eq!(retried.status, StageStatus::Succeeded);

        let runs = store.query_stage_runs(&StageRunFilter::job(job_id)).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, StageStatus::Succeeded);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn overload_is_signalled() {
        let exec = Arc::new(Scripted::new(0, EngineError::Fatal("unused".into())).with_delay(Duration::from_millis(100)));
        let mut s = settings(1, 0);
        s.queue_ceiling = 2;
        let (scheduler, _, job_id, _) = setup(exec, s);

        let mut handles = Vec::new();
        let mut overloaded = 0;
        for i in 0..6 {
            match scheduler.submit(unit(job_id, &format!("h{i}.example.com"))).await {
                Ok(h) => handles.push(h),
                Err(SchedulerError::Overloaded { ceiling, .. }) => {
                    assert_eq!(ceiling, 2);
                    overloaded += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(overloaded > 0);
        for h in handles {
            assert_eq!(h.wait().await.status, StageStatus::Succeeded);
        }
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_skips_queued_units() {
        let exec = Arc::new(Scripted::new(0, EngineError::Fatal("unused".into())).with_delay(Duration::from_millis(100)));
        let (scheduler, _, job_id, cancel) = setup(exec.clone(), settings(1, 0));

        let running = scheduler.submit(unit(job_id, "x.example.com")).await.unwrap();
        let queued = scheduler.submit(unit(job_id, "y.example.com")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert_eq!(running.wait().await.status, StageStatus::Succeeded);
        assert_eq!(queued.wait().await.status, StageStatus::Skipped);
        assert!(matches!(
            scheduler.submit(unit(job_id, "z.example.com")).await,
            Err(SchedulerError::Cancelled)
        ));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_during_backoff_skips_the_run() {
        let exec = Arc::new(Scripted::new(10, EngineError::Timeout(Duration::from_millis(1))));
        let mut s = settings(1, 2);
        s.retry.base_backoff_ms = 500;
        s.retry.max_backoff_ms = 5_000;
        let (scheduler, store, job_id, cancel) = setup(exec.clone(), s);

        let handle = scheduler.submit(unit(job_id, "w.example.com")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let outcome = handle.wait().await;
        assert_eq!(outcome.status, StageStatus::Skipped);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.last_error.as_deref(), Some(CANCELLED_AT_RETRY));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);

        let stored = store.load_stage_run(&outcome.key).await.unwrap().unwrap();
        assert_eq!(stored.status, StageStatus::Skipped);
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_respects_worker_count() {
        let exec = Arc::new(Scripted::new(0, EngineError::Fatal("unused".into())).with_delay(Duration::from_millis(10)));
        let (scheduler, _, job_id, _) = setup(exec.clone(), settings(3, 0));

        let mut handles = Vec::new();
        for i in 0..20 {
            handles.push(scheduler.submit(unit(job_id, &format!("n{i}.example.com"))).await.unwrap());
        }
        for h in handles {
            assert_eq!(h.wait().await.status, StageStatus::Succeeded);
        }
        assert!(exec.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert_eq!(scheduler.queue_depth().await, 0);
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_submissions_claim_each_key_once() {
        let exec = Arc::new(Scripted::new(0, EngineError::Fatal("unused".into())).with_delay(Duration::from_millis(5)));
        let (scheduler, store, job_id, _) = setup(exec.clone(), settings(4, 0));
        let scheduler = Arc::new(scheduler);

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..40 {
            let scheduler = scheduler.clone();
            tasks.spawn(async move {
                let key = format!("k{}.example.com", i % 5);
                match scheduler.submit(unit(job_id, &key)).await {
                    Ok(handle) => Some(handle.wait().await.status),
                    Err(SchedulerError::AlreadyInFlight(_) | SchedulerError::AlreadySettled(_)) => None,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            });
        }
        let mut ran = 0;
        while let Some(joined) = tasks.join_next().await {
            if let Some(status) = joined.unwrap() {
                assert_eq!(status, StageStatus::Succeeded);
                ran += 1;
            }
        }
        assert_eq!(ran, 5);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 5);

        let runs = store.query_stage_runs(&StageRunFilter::job(job_id)).await.unwrap();
        assert_eq!(runs.len(), 5);
        assert!(runs.iter().all(|r| r.status == StageStatus::Succeeded && r.attempts == 1));
    }
}
