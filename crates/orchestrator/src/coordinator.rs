//! Scan coordinator
//!
//! Owns the job lifecycle: `queued -> running -> {completed | partial |
//! failed | cancelled}` and is the only writer of job status. Each submitted
//! job gets its own driver task, scheduler and pipeline; the driver feeds
//! unit outcomes back into the pipeline until nothing is left in flight,
//! then aggregates and settles the final status.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use kavach_common::{
    Authorizer, Capability, Engine, EventKind, EventPublisher, FanOut, Finding, JobFilter,
    JobStatus, OrchestratorConfig, ProgressEvent, RecordStatus, ScanJob, ScanRequest, ScanStore,
    Stage, StageRun, StageRunFilter, StageRunKey, StageSelection, StageStatus, SubTarget,
    VulnerabilityRecord,
};
use kavach_target_resolver::{RootTarget, SubTargetSet, TargetResolver};

use crate::aggregator::aggregate;
use crate::authz::AllowAll;
use crate::pipeline::{EngineGate, StagePipeline};
use crate::progress::ProgressTracker;
use crate::publisher::NullPublisher;
use crate::rate_limiter::RateLimiter;
use crate::scheduler::{Scheduler, SchedulerError, SchedulerSettings, UnitOutcome, WorkUnit};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("too many active jobs: {active} running, limit {limit}")]
    Overloaded { active: usize, limit: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("job {0} is still running")]
    StillRunning(Uuid),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Per-stage StageRun counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StageCounts {
    fn add(&mut self, status: StageStatus) {
        match status {
            StageStatus::Pending => self.pending += 1,
            StageStatus::Running => self.running += 1,
            StageStatus::Succeeded => self.succeeded += 1,
            StageStatus::Failed => self.failed += 1,
            StageStatus::Skipped => self.skipped += 1,
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed + self.skipped
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedUnit {
    pub stage: Stage,
    pub sub_target: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Queryable snapshot of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job: ScanJob,
    pub stages: BTreeMap<Stage, StageCounts>,
    pub failed_units: Vec<FailedUnit>,
    pub sub_targets: usize,
    pub findings: usize,
    pub vulnerabilities: usize,
}

type ParkedCounts = Arc<parking_lot::Mutex<BTreeMap<Stage, usize>>>;

struct ActiveJob {
    cancel: CancellationToken,
    done: watch::Receiver<Option<JobStatus>>,
    parked: ParkedCounts,
}

#[derive(Clone)]
pub struct Coordinator {
    config: Arc<OrchestratorConfig>,
    store: Arc<dyn ScanStore>,
    authorizer: Arc<dyn Authorizer>,
    publisher: Arc<dyn EventPublisher>,
    engines: Vec<Arc<dyn Engine>>,
    gates: HashMap<String, EngineGate>,
    active: Arc<parking_lot::Mutex<HashMap<Uuid, ActiveJob>>>,
}

impl Coordinator {
    pub fn new(config: OrchestratorConfig, store: Arc<dyn ScanStore>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            authorizer: Arc::new(AllowAll),
            publisher: Arc::new(NullPublisher),
            engines: Vec::new(),
            gates: HashMap::new(),
            active: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Register an engine. Its in-flight cap is the lower of the configured
    /// limit and the engine's own; both caps and rate limits are shared by
    /// every job.
    #[must_use]
    pub fn with_engine(mut self, engine: Arc<dyn Engine>) -> Self {
        let id = engine.id().to_string();
        let cap = [self.config.engine_limits.get(&id).copied(), engine.concurrency_limit()]
            .into_iter()
            .flatten()
            .min();

        let mut gate = EngineGate::default();
        if let Some(cap) = cap {
            gate = gate.with_cap(Arc::new(Semaphore::new(cap.max(1))));
        }
        if let Some(&rps) = self.config.engine_rate_limits.get(&id) {
            gate = gate.with_limiter(Arc::new(RateLimiter::new(rps)));
        }
        debug!(engine = %id, capability = %engine.capability(), ?cap, "engine registered");

        self.gates.insert(id, gate);
        self.engines.push(engine);
        self
    }

    #[must_use]
    pub fn with_engines<I: IntoIterator<Item = Arc<dyn Engine>>>(self, engines: I) -> Self {
        engines.into_iter().fold(self, Coordinator::with_engine)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn engine_ids(&self) -> Vec<&str> {
        self.engines.iter().map(|e| e.id()).collect()
    }

    fn tracker(&self, job_id: Uuid) -> Arc<ProgressTracker> {
        Arc::new(ProgressTracker::new(
            job_id,
            self.store.clone(),
            self.publisher.clone(),
        ))
    }

    /// Validate, authorize and persist a job, then start it in the
    /// background. Returns as soon as the job is queued.
    #[instrument(skip(self, request), fields(target = %request.target, owner = %request.owner))]
    pub async fn submit(&self, request: ScanRequest) -> Result<Uuid, CoordinatorError> {
        let root = RootTarget::parse(&request.target, self.config.discovery.allow_large_cidr)
            .map_err(|e| CoordinatorError::InvalidTarget(e.to_string()))?;

        match self.authorizer.can_submit(&request.owner, &request.target).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(CoordinatorError::Unauthorized(format!(
                    "{} may not scan {}",
                    request.owner, request.target
                )))
            }
            Err(e) => {
                return Err(CoordinatorError::Unauthorized(format!(
                    "authorization check failed: {e}"
                )))
            }
        }

        let job = ScanJob::new(request, root.key());
        let cancel = CancellationToken::new();
        let parked = ParkedCounts::default();
        let (done_tx, done_rx) = watch::channel(None);
        {
            let mut active = self.active.lock();
            let limit = self.config.max_active_jobs.max(1);
            if active.len() >= limit {
                return Err(CoordinatorError::Overloaded {
                    active: active.len(),
                    limit,
                });
            }
            active.insert(
                job.id,
                ActiveJob {
                    cancel: cancel.clone(),
                    done: done_rx,
                    parked: parked.clone(),
                },
            );
        }

        if let Err(e) = self.store.save_job(&job).await {
            self.active.lock().remove(&job.id);
            return Err(e.into());
        }

        let job_id = job.id;
        self.tracker(job_id)
            .job_event(
                EventKind::JobQueued,
                json!({ "target": job.root_target, "stages": job.config.stages }),
            )
            .await;
        info!(job_id = %job_id, root = %root, "job queued");

        let coordinator = self.clone();
        tokio::spawn(async move {
            let status = match coordinator.run_job(job, root, cancel, parked).await {
                Ok(status) => status,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "job driver failed");
                    coordinator.force_fail(job_id).await
                }
            };
            coordinator.active.lock().remove(&job_id);
            done_tx.send_replace(Some(status));
        });

        Ok(job_id)
    }

    async fn force_fail(&self, job_id: Uuid) -> JobStatus {
        let from = [JobStatus::Queued, JobStatus::Running, JobStatus::Partial];
        match self.store.transition_job(job_id, &from, JobStatus::Failed).await {
            Ok(true) => JobStatus::Failed,
            _ => match self.store.load_job(job_id).await {
                Ok(Some(job)) => job.status,
                _ => JobStatus::Failed,
            },
        }
    }

    fn build_pipeline(
        &self,
        job: &ScanJob,
        root: RootTarget,
        tracker: Arc<ProgressTracker>,
    ) -> StagePipeline {
        let mut resolver = TargetResolver::new(self.config.discovery.clone());
        for engine in &self.engines {
            if engine.capability() == Capability::Discover {
                resolver.add_method(engine.clone());
            }
        }

        let mut pipeline = StagePipeline::new(
            job.id,
            root,
            Arc::new(resolver),
            tracker,
            self.config.unit_timeout(),
        );
        for engine in &self.engines {
            if engine.capability() == Capability::Discover {
                continue;
            }
            let mut gate = self.gates.get(engine.id()).cloned().unwrap_or_default();
            if let Some(&limit) = job.config.engine_limits.get(engine.id()) {
                gate = gate.with_cap(Arc::new(Semaphore::new(limit.max(1))));
            }
            pipeline = pipeline.with_engine(engine.clone(), gate);
        }
        pipeline
    }

    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn run_job(
        &self,
        job: ScanJob,
        root: RootTarget,
        cancel: CancellationToken,
        parked: ParkedCounts,
    ) -> anyhow::Result<JobStatus> {
        let job_id = job.id;
        let tracker = self.tracker(job_id);

        if !self
            .store
            .transition_job(job_id, &[JobStatus::Queued], JobStatus::Running)
            .await?
        {
            let status = self
                .store
                .load_job(job_id)
                .await?
                .map_or(JobStatus::Cancelled, |j| j.status);
            info!(status = %status, "job left the queue before it started");
            tracker.job_finished(status).await;
            return Ok(status);
        }
        tracker
            .job_event(EventKind::JobStarted, json!({ "root": job.root_target }))
            .await;
        info!(root = %root, "job started");

        let workers = job
            .config
            .max_concurrency
            .unwrap_or(self.config.max_concurrency)
            .max(1);
        let root_sub = root.as_sub_target(job_id);
        let pipeline = Arc::new(self.build_pipeline(&job, root, tracker.clone()));
        let dispatch = cancel.child_token();
        let scheduler = Scheduler::start(
            job_id,
            self.store.clone(),
            pipeline,
            tracker.clone(),
            SchedulerSettings {
                workers,
                queue_ceiling: self.config.queue_ceiling,
                retry: self.config.retry.clone(),
            },
            dispatch.clone(),
        );

        let mut run = JobRun {
            job_id,
            stages: job.config.stages.clone(),
            root_sub,
            store: self.store.clone(),
            tracker: tracker.clone(),
            scheduler,
            admitted: SubTargetSet::new(),
            in_flight: JoinSet::new(),
            backlog: Backlog::new(parked),
            discovery_failed: false,
        };
        run.dispatch(WorkUnit::global(job_id, Stage::Discovery, job.root_key.clone()))
            .await;
        let deadline_hit = run
            .drive(self.config.job_timeout(), &cancel, &dispatch)
            .await;

        let JobRun {
            scheduler,
            discovery_failed,
            stages,
            ..
        } = run;
        scheduler.shutdown().await;

        let aggregation_key = StageRunKey::new(job_id, Stage::Aggregation, job.root_key.clone());
        if discovery_failed {
            let skipped = StageRun::skipped(aggregation_key, None, "discovery yielded no sub-targets");
            self.store.insert_stage_run(&skipped).await?;
        } else if let Err(e) = self.aggregate_job(job_id, &job.root_key, &tracker).await {
            error!(error = %e, "aggregation failed");
        }

        let status = self
            .settle(job_id, &stages, discovery_failed, deadline_hit, cancel.is_cancelled())
            .await?;
        let from = [JobStatus::Running, JobStatus::Partial];
        let status = if self.store.transition_job(job_id, &from, status).await? {
            status
        } else {
            self.store
                .load_job(job_id)
                .await?
                .map_or(status, |j| j.status)
        };

        info!(status = %status, "job finished");
        tracker.job_finished(status).await;
        tracker.print_summary().await;
        Ok(status)
    }

    /// Final status from the StageRun table.
    async fn settle(
        &self,
        job_id: Uuid,
        stages: &StageSelection,
        discovery_failed: bool,
        deadline_hit: bool,
        cancelled: bool,
    ) -> anyhow::Result<JobStatus> {
        if cancelled {
            return Ok(JobStatus::Cancelled);
        }
        if discovery_failed {
            return Ok(JobStatus::Failed);
        }
        if deadline_hit {
            return Ok(JobStatus::Partial);
        }

        let runs = self.store.query_stage_runs(&StageRunFilter::job(job_id)).await?;
        let failures = runs.iter().filter(|r| r.status == StageStatus::Failed).count();
        if failures == 0 {
            return Ok(JobStatus::Completed);
        }

        let eligible = if stages.contains(Stage::VulnerabilityDetection) {
            Stage::VulnerabilityDetection
        } else {
            stages
                .iter()
                .filter(|s| s.fan_out() == FanOut::PerSubTarget)
                .last()
                .unwrap_or(Stage::Discovery)
        };
        let eligible_success = runs
            .iter()
            .any(|r| r.stage == eligible && r.status == StageStatus::Succeeded);
        debug!(failures, eligible = %eligible, eligible_success, "settling job");
        Ok(if eligible_success {
            JobStatus::Partial
        } else {
            JobStatus::Failed
        })
    }

    /// Run the aggregator over the job's stored findings as a global
    /// StageRun. A settled aggregation run is superseded, which is how
    /// re-aggregation works.
    async fn aggregate_job(
        &self,
        job_id: Uuid,
        root_key: &str,
        tracker: &ProgressTracker,
    ) -> Result<usize, CoordinatorError> {
        let key = StageRunKey::new(job_id, Stage::Aggregation, root_key);
        let pending = StageRun::pending(key.clone(), None);
        let claimed = if self.store.insert_stage_run(&pending).await? {
            pending
        } else {
            let existing = self
                .store
                .load_stage_run(&key)
                .await?
                .ok_or_else(|| CoordinatorError::NotFound(key.to_string()))?;
            if !existing.status.is_terminal() {
                return Err(CoordinatorError::StillRunning(job_id));
            }
            let fresh = StageRun {
                status: StageStatus::Pending,
                attempts: 0,
                last_error: None,
                updated_at: Utc::now(),
                ..existing.clone()
            };
            if !self.store.update_stage_run(&existing, &fresh).await? {
                return Err(CoordinatorError::StillRunning(job_id));
            }
            fresh
        };

        let running = StageRun {
            status: StageStatus::Running,
            attempts: claimed.attempts + 1,
            updated_at: Utc::now(),
            ..claimed.clone()
        };
        if !self.store.update_stage_run(&claimed, &running).await? {
            return Err(CoordinatorError::StillRunning(job_id));
        }
        tracker.unit_dispatched(&key, running.attempts).await;

        let started = Instant::now();
        let result = self.merge_findings(job_id).await;
        let finished = match &result {
            Ok(_) => StageRun {
                status: StageStatus::Succeeded,
                updated_at: Utc::now(),
                ..running.clone()
            },
            Err(e) => StageRun {
                status: StageStatus::Failed,
                last_error: Some(e.to_string()),
                updated_at: Utc::now(),
                ..running.clone()
            },
        };
        if !self.store.update_stage_run(&running, &finished).await? {
            warn!(job_id = %job_id, "aggregation run changed underneath us");
        }
        tracker
            .unit_finished(&key, finished.status, finished.last_error.as_deref(), started.elapsed())
            .await;

        let (findings, records) = result?;
        tracker
            .job_event(
                EventKind::AggregationCompleted,
                json!({ "findings": findings, "records": records }),
            )
            .await;
        info!(job_id = %job_id, findings, records, "aggregation completed");
        Ok(records)
    }

    async fn merge_findings(&self, job_id: Uuid) -> anyhow::Result<(usize, usize)> {
        let findings = self.store.findings(job_id).await?;
        let existing = self.store.vulnerabilities(job_id).await?;
        let records = aggregate(&findings, &self.config.aggregation, &existing);
        self.store.save_vulnerabilities(&records).await?;
        Ok((findings.len(), records.len()))
    }

    /// Resolves with the job's status once it is terminal (or, for a job
    /// with no live driver, its stored status).
    pub async fn wait(&self, job_id: Uuid) -> Result<JobStatus, CoordinatorError> {
        let rx = self.active.lock().get(&job_id).map(|a| a.done.clone());
        if let Some(mut rx) = rx {
            if let Ok(done) = rx.wait_for(Option::is_some).await {
                if let Some(status) = *done {
                    return Ok(status);
                }
            }
        }
        self.store
            .load_job(job_id)
            .await?
            .map(|j| j.status)
            .ok_or_else(|| CoordinatorError::NotFound(job_id.to_string()))
    }

    /// Request cancellation. A queued job is cancelled at once; a running
    /// job stops dispatching and moves to `cancelled` once in-flight units
    /// drain. Returns the status at the time of the call.
    pub async fn cancel(&self, job_id: Uuid) -> Result<JobStatus, CoordinatorError> {
        let job = self
            .store
            .load_job(job_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(job_id.to_string()))?;
        if job.status.is_terminal() {
            return Ok(job.status);
        }

        self.tracker(job_id)
            .job_event(EventKind::CancelRequested, json!({ "status": job.status }))
            .await;
        let token = self.active.lock().get(&job_id).map(|a| a.cancel.clone());

        if job.status == JobStatus::Queued
            && self
                .store
                .transition_job(job_id, &[JobStatus::Queued], JobStatus::Cancelled)
                .await?
        {
            if let Some(token) = token {
                token.cancel();
            }
            info!(job_id = %job_id, "queued job cancelled");
            return Ok(JobStatus::Cancelled);
        }

        match token {
            Some(token) => {
                token.cancel();
                info!(job_id = %job_id, "cancel requested, draining in-flight units");
                Ok(job.status)
            }
            // partial with no driver means the drain already finished
            None if job.status == JobStatus::Partial => Ok(JobStatus::Partial),
            None => {
                // no driver in this process; nothing will drain
                let from = [JobStatus::Queued, JobStatus::Running];
                self.store
                    .transition_job(job_id, &from, JobStatus::Cancelled)
                    .await?;
                Ok(JobStatus::Cancelled)
            }
        }
    }

    pub async fn status(&self, job_id: Uuid) -> Result<JobView, CoordinatorError> {
        let job = self
            .store
            .load_job(job_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(job_id.to_string()))?;

        let runs = self.store.query_stage_runs(&StageRunFilter::job(job_id)).await?;
        let mut stages: BTreeMap<Stage, StageCounts> = BTreeMap::new();
        // parked units have no stage run yet
        if let Some(active) = self.active.lock().get(&job_id) {
            for (stage, parked) in active.parked.lock().iter() {
                stages.entry(*stage).or_default().pending += parked;
            }
        }
        let mut failed_units = Vec::new();
        for run in &runs {
            stages.entry(run.stage).or_default().add(run.status);
            if run.status == StageStatus::Failed {
                failed_units.push(FailedUnit {
                    stage: run.stage,
                    sub_target: run.dedup_key.clone(),
                    attempts: run.attempts,
                    last_error: run.last_error.clone(),
                });
            }
        }

        Ok(JobView {
            job,
            stages,
            failed_units,
            sub_targets: self.store.sub_targets(job_id).await?.len(),
            findings: self.store.findings(job_id).await?.len(),
            vulnerabilities: self.store.vulnerabilities(job_id).await?.len(),
        })
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScanJob>, CoordinatorError> {
        Ok(self.store.list_jobs(filter).await?)
    }

    pub async fn sub_targets(&self, job_id: Uuid) -> Result<Vec<SubTarget>, CoordinatorError> {
        Ok(self.store.sub_targets(job_id).await?)
    }

    pub async fn findings(&self, job_id: Uuid) -> Result<Vec<Finding>, CoordinatorError> {
        Ok(self.store.findings(job_id).await?)
    }

    pub async fn vulnerabilities(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<VulnerabilityRecord>, CoordinatorError> {
        Ok(self.store.vulnerabilities(job_id).await?)
    }

    pub async fn events(&self, job_id: Uuid) -> Result<Vec<ProgressEvent>, CoordinatorError> {
        Ok(self.store.events(job_id).await?)
    }

    /// Remove a finished job and everything it owns except its
    /// vulnerability records.
    pub async fn delete_job(&self, job_id: Uuid) -> Result<(), CoordinatorError> {
        if self.active.lock().contains_key(&job_id) {
            return Err(CoordinatorError::StillRunning(job_id));
        }
        if self.store.load_job(job_id).await?.is_none() {
            return Err(CoordinatorError::NotFound(job_id.to_string()));
        }
        self.store.delete_job(job_id).await?;
        info!(job_id = %job_id, "job deleted");
        Ok(())
    }

    pub async fn triage(
        &self,
        job_id: Uuid,
        record_id: Uuid,
        status: RecordStatus,
    ) -> Result<VulnerabilityRecord, CoordinatorError> {
        let mut record = self
            .store
            .vulnerabilities(job_id)
            .await?
            .into_iter()
            .find(|r| r.id == record_id)
            .ok_or_else(|| CoordinatorError::NotFound(record_id.to_string()))?;
        record.status = status;
        self.store.save_vulnerabilities(std::slice::from_ref(&record)).await?;
        info!(job_id = %job_id, record_id = %record_id, status = status.as_str(), "record triaged");
        Ok(record)
    }

    /// Re-run aggregation over a finished job's findings. Triage status of
    /// existing records is kept.
    pub async fn reaggregate(&self, job_id: Uuid) -> Result<usize, CoordinatorError> {
        if self.active.lock().contains_key(&job_id) {
            return Err(CoordinatorError::StillRunning(job_id));
        }
        let job = self
            .store
            .load_job(job_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(job_id.to_string()))?;
        let tracker = self.tracker(job_id);
        self.aggregate_job(job_id, &job.root_key, &tracker).await
    }
}

/// Units refused by scheduler backpressure, resubmitted as it drains.
/// Per-stage counts are shared with job views.
struct Backlog {
    units: VecDeque<WorkUnit>,
    parked: ParkedCounts,
}

impl Backlog {
    fn new(parked: ParkedCounts) -> Self {
        Self {
            units: VecDeque::new(),
            parked,
        }
    }

    fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    fn park(&self, stage: Stage) {
        *self.parked.lock().entry(stage).or_default() += 1;
    }

    fn push_back(&mut self, unit: WorkUnit) {
        self.park(unit.key.stage);
        self.units.push_back(unit);
    }

    fn push_front(&mut self, unit: WorkUnit) {
        self.park(unit.key.stage);
        self.units.push_front(unit);
    }

    fn pop_front(&mut self) -> Option<WorkUnit> {
        let unit = self.units.pop_front()?;
        let mut parked = self.parked.lock();
        if let Some(count) = parked.get_mut(&unit.key.stage) {
            *count -= 1;
            if *count == 0 {
                parked.remove(&unit.key.stage);
            }
        }
        Some(unit)
    }
}

/// Driver state of one running job.
struct JobRun {
    job_id: Uuid,
    stages: StageSelection,
    root_sub: SubTarget,
    store: Arc<dyn ScanStore>,
    tracker: Arc<ProgressTracker>,
    scheduler: Scheduler,
    admitted: SubTargetSet,
    in_flight: JoinSet<UnitOutcome>,
    backlog: Backlog,
    discovery_failed: bool,
}

impl JobRun {
    /// Feed outcomes back into the pipeline until nothing is in flight.
    /// Returns whether the job deadline fired.
    async fn drive(
        &mut self,
        job_timeout: Duration,
        cancel: &CancellationToken,
        dispatch: &CancellationToken,
    ) -> bool {
        let deadline = tokio::time::sleep(job_timeout);
        tokio::pin!(deadline);
        let mut deadline_hit = false;
        let mut cancel_seen = false;

        loop {
            if self.in_flight.is_empty() {
                if self.backlog.is_empty() {
                    break;
                }
                if dispatch.is_cancelled() {
                    self.drop_backlog().await;
                } else {
                    self.flush_backlog().await;
                }
                continue;
            }

            tokio::select! {
                Some(joined) = self.in_flight.join_next() => {
                    match joined {
                        Ok(outcome) => self.on_outcome(outcome).await,
                        Err(e) => error!(job_id = %self.job_id, error = %e, "unit task aborted"),
                    }
                    if dispatch.is_cancelled() {
                        self.drop_backlog().await;
                    } else {
                        self.flush_backlog().await;
                    }
                }
                _ = &mut deadline, if !deadline_hit => {
                    deadline_hit = true;
                    dispatch.cancel();
                    warn!(job_id = %self.job_id, timeout = ?job_timeout, "job deadline exceeded, draining");
                    match self
                        .store
                        .transition_job(self.job_id, &[JobStatus::Running], JobStatus::Partial)
                        .await
                    {
                        Ok(_) => {}
                        Err(e) => error!(job_id = %self.job_id, error = %e, "failed to mark job partial"),
                    }
                    self.tracker
                        .job_event(
                            EventKind::DeadlineExceeded,
                            json!({ "timeout_secs": job_timeout.as_secs() }),
                        )
                        .await;
                }
                _ = cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    info!(job_id = %self.job_id, in_flight = self.in_flight.len(), "cancel observed, draining");
                    self.drop_backlog().await;
                }
            }
        }
        deadline_hit
    }

    async fn dispatch(&mut self, unit: WorkUnit) {
        match self.scheduler.submit(unit.clone()).await {
            Ok(handle) => {
                self.in_flight.spawn(handle.wait());
            }
            Err(SchedulerError::Overloaded { depth, ceiling }) => {
                if self.backlog.is_empty() {
                    warn!(job_id = %self.job_id, depth, ceiling, "scheduler overloaded, parking units");
                    self.tracker
                        .job_event(
                            EventKind::Backpressure,
                            json!({ "depth": depth, "ceiling": ceiling }),
                        )
                        .await;
                }
                self.backlog.push_back(unit);
            }
            Err(e) => self.rejected(unit, e).await,
        }
    }

    async fn rejected(&mut self, unit: WorkUnit, err: SchedulerError) {
        match err {
            SchedulerError::Cancelled => self.skip(unit, "cancelled before dispatch").await,
            SchedulerError::AlreadyInFlight(key) | SchedulerError::AlreadySettled(key) => {
                debug!(key = %key, "unit already claimed");
            }
            SchedulerError::Overloaded { .. } => self.backlog.push_back(unit),
            SchedulerError::Store(e) => {
                error!(key = %unit.key, error = %e, "failed to claim stage run");
            }
        }
    }

    async fn flush_backlog(&mut self) {
        while let Some(unit) = self.backlog.pop_front() {
            match self.scheduler.submit(unit.clone()).await {
                Ok(handle) => {
                    self.in_flight.spawn(handle.wait());
                }
                Err(SchedulerError::Overloaded { .. }) => {
                    self.backlog.push_front(unit);
                    break;
                }
                Err(e) => self.rejected(unit, e).await,
            }
        }
    }

    async fn drop_backlog(&mut self) {
        while let Some(unit) = self.backlog.pop_front() {
            self.skip(unit, "cancelled before dispatch").await;
        }
    }

    /// Record a unit as skipped without running it.
    async fn skip(&self, unit: WorkUnit, reason: &str) {
        let run = StageRun::skipped(
            unit.key.clone(),
            unit.sub_target.as_ref().map(|s| s.id),
            reason,
        );
        match self.store.insert_stage_run(&run).await {
            Ok(true) => {
                self.tracker
                    .unit_finished(&unit.key, StageStatus::Skipped, Some(reason), Duration::ZERO)
                    .await;
            }
            Ok(false) => debug!(key = %unit.key, "unit already has a stage run"),
            Err(e) => error!(key = %unit.key, error = %e, "failed to record skipped unit"),
        }
    }

    async fn skip_downstream(&self, sub: &SubTarget, after: Stage, reason: &str) {
        let downstream: Vec<_> = self.stages.remaining_after(after).collect();
        for stage in downstream {
            self.skip(WorkUnit::for_sub_target(stage, sub.clone()), reason)
                .await;
        }
    }

    async fn advance(&mut self, sub: SubTarget, from: Stage) {
        if let Some(next) = self.stages.next_after(from) {
            self.dispatch(WorkUnit::for_sub_target(next, sub)).await;
        }
    }

    /// Pass raw values through dedup and persist the new sub-targets.
    async fn admit(&mut self, values: &[String], stage: Stage, parent: Option<&SubTarget>) -> Vec<SubTarget> {
        let mut admitted = Vec::new();
        for value in values {
            let Some(sub) = self.admitted.admit(self.job_id, value, stage, parent) else {
                continue;
            };
            match self.store.insert_sub_target(&sub).await {
                Ok(true) => admitted.push(sub),
                Ok(false) => debug!(key = %sub.dedup_key, "sub-target already stored"),
                Err(e) => error!(key = %sub.dedup_key, error = %e, "failed to store sub-target"),
            }
        }
        admitted
    }

    async fn persist_findings(&self, outcome: &mut UnitOutcome) {
        if outcome.progress.findings.is_empty() {
            return;
        }
        let sub_id = outcome
            .sub_target
            .as_ref()
            .map_or(self.root_sub.id, |s| s.id);
        let findings: Vec<Finding> = std::mem::take(&mut outcome.progress.findings)
            .into_iter()
            .map(|(engine, draft)| Finding::from_draft(self.job_id, sub_id, &engine, draft))
            .collect();
        if let Err(e) = self.store.save_findings(&findings).await {
            error!(key = %outcome.key, error = %e, "failed to store findings");
        }
    }

    async fn on_outcome(&mut self, mut outcome: UnitOutcome) {
        debug!(
            key = %outcome.key,
            status = %outcome.status,
            attempts = outcome.attempts,
            elapsed = ?outcome.elapsed,
            "unit settled"
        );
        self.persist_findings(&mut outcome).await;
        let succeeded = outcome.status == StageStatus::Succeeded;
        let reason = outcome
            .last_error
            .clone()
            .unwrap_or_else(|| format!("{} did not succeed", outcome.key.stage));

        match outcome.key.stage {
            Stage::Discovery => {
                if !succeeded {
                    if outcome.status == StageStatus::Failed {
                        warn!(job_id = %self.job_id, error = %reason, "discovery failed");
                        self.discovery_failed = true;
                    }
                    return;
                }
                let subs = self.admit(&outcome.progress.discovered, Stage::Discovery, None).await;
                if subs.is_empty() {
                    warn!(job_id = %self.job_id, "discovery yielded no sub-targets");
                    self.discovery_failed = true;
                    return;
                }
                info!(job_id = %self.job_id, count = subs.len(), "sub-targets discovered");
                self.tracker
                    .job_event(EventKind::SubTargetsDiscovered, json!({ "count": subs.len() }))
                    .await;
                for sub in subs {
                    self.advance(sub, Stage::Discovery).await;
                }
            }
            Stage::LiveHostCheck => {
                let Some(sub) = outcome.sub_target else { return };
                let alive = &outcome.progress.alive;
                if !succeeded {
                    self.skip_downstream(&sub, Stage::LiveHostCheck, &reason).await;
                } else if !alive.is_empty() && alive.iter().all(|a| !a) {
                    debug!(sub_target = %sub.dedup_key, "host not alive");
                    self.skip_downstream(&sub, Stage::LiveHostCheck, "host not alive").await;
                } else {
                    self.advance(sub, Stage::LiveHostCheck).await;
                }
            }
            Stage::EndpointEnumeration => {
                let Some(sub) = outcome.sub_target else { return };
                if !succeeded {
                    self.skip_downstream(&sub, Stage::EndpointEnumeration, &reason).await;
                    return;
                }
                let endpoints = self
                    .admit(&outcome.progress.discovered, Stage::EndpointEnumeration, Some(&sub))
                    .await;
                if !endpoints.is_empty() {
                    info!(sub_target = %sub.dedup_key, count = endpoints.len(), "endpoints discovered");
                    self.tracker
                        .emit(
                            ProgressEvent::new(self.job_id, EventKind::SubTargetsDiscovered)
                                .with_stage(Stage::EndpointEnumeration)
                                .with_sub_target(sub.dedup_key.clone())
                                .with_payload(json!({ "count": endpoints.len() })),
                        )
                        .await;
                }
                for endpoint in endpoints {
                    self.advance(endpoint, Stage::EndpointEnumeration).await;
                }
                self.advance(sub, Stage::EndpointEnumeration).await;
            }
            Stage::VulnerabilityDetection | Stage::Aggregation => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::ScopeAllowlist;
    use crate::publisher::BroadcastPublisher;
    use async_trait::async_trait;
    use kavach_common::{
        EngineError, EngineOutput, FindingDraft, InvokeContext, RetryPolicy, Severity,
    };
    use kavach_storage::MemoryStore;
    use std::collections::HashSet;

    struct Names(Vec<&'static str>);

    #[async_trait]
    impl Engine for Names {
        fn id(&self) -> &str {
            "names"
        }

        fn capability(&self) -> Capability {
            Capability::Discover
        }

        async fn invoke(&self, _t: &SubTarget, _c: &InvokeContext) -> Result<EngineOutput, EngineError> {
            Ok(EngineOutput::discovered(self.0.iter().map(|s| s.to_string()).collect()))
        }
    }

    struct BrokenDiscovery;

    #[async_trait]
    impl Engine for BrokenDiscovery {
        fn id(&self) -> &str {
            "broken-discovery"
        }

        fn capability(&self) -> Capability {
            Capability::Discover
        }

        async fn invoke(&self, _t: &SubTarget, _c: &InvokeContext) -> Result<EngineOutput, EngineError> {
            Err(EngineError::Unavailable("upstream down".into()))
        }
    }

    /// Live for every host except `dead`; enumerates `endpoints` per host.
    struct Prober {
        dead: Vec<&'static str>,
        endpoints: HashMap<&'static str, Vec<&'static str>>,
    }

    #[async_trait]
    impl Engine for Prober {
        fn id(&self) -> &str {
            "prober"
        }

        fn capability(&self) -> Capability {
            Capability::Enumerate
        }

        async fn invoke(&self, t: &SubTarget, ctx: &InvokeContext) -> Result<EngineOutput, EngineError> {
            match ctx.stage {
                Stage::LiveHostCheck => Ok(EngineOutput::alive(!self.dead.contains(&t.dedup_key.as_str()))),
                _ => Ok(EngineOutput::discovered(
                    self.endpoints
                        .get(t.dedup_key.as_str())
                        .map(|eps| eps.iter().map(|s| s.to_string()).collect())
                        .unwrap_or_default(),
                )),
            }
        }
    }

    #[derive(Clone)]
    enum Behaviour {
        Report(&'static str, Severity),
        TimeOut,
        Sleep(Duration),
    }

    struct Detector {
        id: &'static str,
        script: HashMap<&'static str, Behaviour>,
        seen: parking_lot::Mutex<Vec<String>>,
    }

    impl Detector {
        fn new(id: &'static str, script: Vec<(&'static str, Behaviour)>) -> Arc<Self> {
            Arc::new(Self {
                id,
                script: script.into_iter().collect(),
                seen: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Engine for Detector {
        fn id(&self) -> &str {
            self.id
        }

        fn capability(&self) -> Capability {
            Capability::Detect
        }

        async fn invoke(&self, t: &SubTarget, ctx: &InvokeContext) -> Result<EngineOutput, EngineError> {
            self.seen.lock().push(t.dedup_key.clone());
            match self.script.get(t.dedup_key.as_str()).cloned() {
                Some(Behaviour::Report(sig, severity)) => Ok(EngineOutput::findings(vec![
                    FindingDraft::new("outdated_software", format!("{sig} is outdated"))
                        .with_signature(sig)
                        .with_severity(severity),
                ])),
                Some(Behaviour::TimeOut) => Err(EngineError::Timeout(ctx.timeout)),
                Some(Behaviour::Sleep(d)) => {
                    tokio::time::sleep(d).await;
                    Ok(EngineOutput::default())
                }
                None => Ok(EngineOutput::default()),
            }
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrency: 4,
            retry: RetryPolicy {
                budget: 2,
                base_backoff_ms: 1,
                max_backoff_ms: 5,
                factor: 2,
            },
            unit_timeout_ms: 2_000,
            ..OrchestratorConfig::default()
        }
    }

    fn coordinator(config: OrchestratorConfig) -> (Coordinator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Coordinator::new(config, store.clone()), store)
    }

    fn prober() -> Arc<Prober> {
        Arc::new(Prober {
            dead: Vec::new(),
            endpoints: HashMap::new(),
        })
    }

    #[tokio::test]
    async fn duplicate_findings_merge_into_one_record() {
        let (coordinator, _) = coordinator(config());
        let coordinator = coordinator
            .with_engine(Arc::new(Names(vec!["www.example.com", "api.example.com"])))
            .with_engine(prober())
            .with_engine(Detector::new("det-a", vec![("api.example.com", Behaviour::Report("nginx/1.14.0", Severity::High))]))
            .with_engine(Detector::new("det-b", vec![("api.example.com", Behaviour::Report("nginx/1.14.0", Severity::Medium))]));

        let id = coordinator.submit(ScanRequest::new("example.com", "alice")).await.unwrap();
        assert_eq!(coordinator.wait(id).await.unwrap(), JobStatus::Completed);

        let view = coordinator.status(id).await.unwrap();
        assert_eq!(view.sub_targets, 2);
        assert_eq!(view.stages[&Stage::LiveHostCheck].succeeded, 2);
        assert_eq!(view.stages[&Stage::VulnerabilityDetection].succeeded, 2);
        assert_eq!(view.stages[&Stage::Aggregation].succeeded, 1);
        assert!(view.failed_units.is_empty());

        let records = coordinator.vulnerabilities(id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].finding_ids.len(), 2);
        assert_eq!(records[0].severity, Severity::High);
    }

    #[tokio::test]
    async fn exhausted_retries_make_the_job_partial() {
        let (coordinator, _) = coordinator(config());
        let detector = Detector::new(
            "det",
            vec![
                ("www.example.com", Behaviour::TimeOut),
                ("api.example.com", Behaviour::Report("openssh/7.4", Severity::Medium)),
            ],
        );
        let coordinator = coordinator
            .with_engine(Arc::new(Names(vec!["www.example.com", "api.example.com"])))
            .with_engine(detector.clone());

        let id = coordinator.submit(ScanRequest::new("example.com", "alice")).await.unwrap();
        assert_eq!(coordinator.wait(id).await.unwrap(), JobStatus::Partial);

        let view = coordinator.status(id).await.unwrap();
        assert_eq!(view.failed_units.len(), 1);
        let failed = &view.failed_units[0];
        assert_eq!(failed.sub_target, "www.example.com");
        assert_eq!(failed.attempts, 3);
        assert!(failed.last_error.as_deref().is_some_and(|e| !e.is_empty()));

        let www_calls = detector.seen.lock().iter().filter(|k| *k == "www.example.com").count();
        assert_eq!(www_calls, 3);
        assert_eq!(coordinator.vulnerabilities(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zero_discovery_fails_the_job() {
        let (coordinator, _) = coordinator(config());
        let coordinator = coordinator.with_engine(Arc::new(BrokenDiscovery));

        let id = coordinator.submit(ScanRequest::new("example.com", "alice")).await.unwrap();
        assert_eq!(coordinator.wait(id).await.unwrap(), JobStatus::Failed);

        let view = coordinator.status(id).await.unwrap();
        assert_eq!(view.stages[&Stage::Discovery].failed, 1);
        assert_eq!(view.stages[&Stage::Aggregation].skipped, 1);
        let kinds: Vec<_> = coordinator.events(id).await.unwrap().into_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::ResolverPartialFailure));
    }

    #[tokio::test]
    async fn out_of_scope_and_duplicate_names_are_dropped() {
        let (coordinator, _) = coordinator(config());
        let coordinator = coordinator.with_engine(Arc::new(Names(vec![
            "WWW.example.com",
            "https://www.example.com/",
            "www.example.com.",
            "api.example.com",
            "evil.test",
        ])));

        let id = coordinator.submit(ScanRequest::new("example.com", "alice")).await.unwrap();
        assert_eq!(coordinator.wait(id).await.unwrap(), JobStatus::Completed);

        let subs = coordinator.sub_targets(id).await.unwrap();
        let keys: HashSet<_> = subs.iter().map(|s| s.dedup_key.as_str()).collect();
        assert_eq!(subs.len(), keys.len());
        assert_eq!(keys, HashSet::from(["www.example.com", "api.example.com"]));
    }

    #[tokio::test]
    async fn dead_hosts_skip_and_endpoints_reach_detection() {
        let (coordinator, _) = coordinator(config());
        let detector = Detector::new("det", vec![]);
        let prober = Arc::new(Prober {
            dead: vec!["old.example.com"],
            endpoints: HashMap::from([("api.example.com", vec!["api.example.com:8080"])]),
        });
        let coordinator = coordinator
            .with_engine(Arc::new(Names(vec!["api.example.com", "old.example.com"])))
            .with_engine(prober)
            .with_engine(detector.clone());

        let id = coordinator.submit(ScanRequest::new("example.com", "alice")).await.unwrap();
        assert_eq!(coordinator.wait(id).await.unwrap(), JobStatus::Completed);

        let view = coordinator.status(id).await.unwrap();
        assert_eq!(view.stages[&Stage::EndpointEnumeration].skipped, 1);
        assert_eq!(view.stages[&Stage::VulnerabilityDetection].skipped, 1);

        let seen: HashSet<_> = detector.seen.lock().iter().cloned().collect();
        assert!(seen.contains("api.example.com:8080"));
        assert!(seen.contains("api.example.com"));
        assert!(!seen.contains("old.example.com"));

        let subs = coordinator.sub_targets(id).await.unwrap();
        let endpoint = subs.iter().find(|s| s.dedup_key == "api.example.com:8080").unwrap();
        let parent = subs.iter().find(|s| s.dedup_key == "api.example.com").unwrap();
        assert_eq!(endpoint.parent_id, Some(parent.id));
        assert_eq!(endpoint.discovered_via, Stage::EndpointEnumeration);
    }

    #[tokio::test]
    async fn cancel_drains_and_ends_cancelled() {
        let mut cfg = config();
        cfg.max_concurrency = 1;
        let (coordinator, _) = coordinator(cfg);
        let names: Vec<&'static str> = vec![
            "a.example.com",
            "b.example.com",
            "c.example.com",
            "d.example.com",
        ];
        let script = names
            .iter()
            .map(|n| (*n, Behaviour::Sleep(Duration::from_millis(150))))
            .collect();
        let detector = Detector::new("slow", script);
        let coordinator = coordinator
            .with_engine(Arc::new(Names(names)))
            .with_engine(detector.clone());

        let id = coordinator.submit(ScanRequest::new("example.com", "alice")).await.unwrap();
        while detector.seen.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        coordinator.cancel(id).await.unwrap();
        assert_eq!(coordinator.wait(id).await.unwrap(), JobStatus::Cancelled);

        let view = coordinator.status(id).await.unwrap();
        let detection = view.stages[&Stage::VulnerabilityDetection];
        assert_eq!(detection.pending + detection.running, 0);
        assert!(detection.skipped > 0);
        assert!(detector.seen.lock().len() < 4);

        let kinds: Vec<_> = coordinator.events(id).await.unwrap().into_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::CancelRequested));
        assert_eq!(kinds.last(), Some(&EventKind::JobFinished));
    }

    #[tokio::test]
    async fn parked_units_count_as_pending() {
        let mut cfg = config();
        cfg.max_concurrency = 1;
        cfg.queue_ceiling = 1;
        let (coordinator, _) = coordinator(cfg);
        let names: Vec<&'static str> = vec![
            "a.example.com",
            "b.example.com",
            "c.example.com",
            "d.example.com",
        ];
        let script = names
            .iter()
            .map(|n| (*n, Behaviour::Sleep(Duration::from_millis(200))))
            .collect();
        let coordinator = coordinator
            .with_engine(Arc::new(Names(names)))
            .with_engine(Detector::new("slow", script));

        let request = ScanRequest::new("example.com", "alice")
            .with_stages(StageSelection::from(vec![Stage::VulnerabilityDetection]));
        let id = coordinator.submit(request).await.unwrap();

        let mut all_visible = false;
        for _ in 0..100 {
            let view = coordinator.status(id).await.unwrap();
            if let Some(detection) = view.stages.get(&Stage::VulnerabilityDetection) {
                if detection.pending + detection.running == 4 {
                    all_visible = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(all_visible, "parked detection units missing from the view");

        assert_eq!(coordinator.wait(id).await.unwrap(), JobStatus::Completed);
        let view = coordinator.status(id).await.unwrap();
        let detection = view.stages[&Stage::VulnerabilityDetection];
        assert_eq!(detection.pending + detection.running, 0);
        assert_eq!(detection.succeeded, 4);

        let kinds: Vec<_> = coordinator.events(id).await.unwrap().into_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::Backpressure));
    }

    #[tokio::test]
    async fn deadline_forces_partial() {
        let mut cfg = config();
        cfg.job_timeout_secs = 1;
        cfg.max_concurrency = 1;
        let (coordinator, _) = coordinator(cfg);
        let detector = Detector::new(
            "slow",
            vec![
                ("a.example.com", Behaviour::Sleep(Duration::from_millis(1_500))),
                ("b.example.com", Behaviour::Sleep(Duration::from_millis(1_500))),
            ],
        );
        let coordinator = coordinator
            .with_engine(Arc::new(Names(vec!["a.example.com", "b.example.com"])))
            .with_engine(detector.clone());

        let id = coordinator.submit(ScanRequest::new("example.com", "alice")).await.unwrap();
        assert_eq!(coordinator.wait(id).await.unwrap(), JobStatus::Partial);
        assert_eq!(detector.seen.lock().len(), 1);

        let view = coordinator.status(id).await.unwrap();
        assert_eq!(view.stages[&Stage::Aggregation].succeeded, 1);
        let kinds: Vec<_> = coordinator.events(id).await.unwrap().into_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::DeadlineExceeded));
    }

    #[tokio::test]
    async fn submission_is_validated_and_bounded() {
        let mut cfg = config();
        cfg.max_active_jobs = 1;
        let (coordinator, _) = coordinator(cfg);
        let allowlist = ScopeAllowlist::from_entries(&["*.example.com"]).unwrap();
        let coordinator = coordinator
            .with_authorizer(Arc::new(allowlist))
            .with_engine(Detector::new("slow", vec![("example.com", Behaviour::Sleep(Duration::from_millis(200)))]));

        assert!(matches!(
            coordinator.submit(ScanRequest::new("not a target!", "alice")).await,
            Err(CoordinatorError::InvalidTarget(_))
        ));
        assert!(matches!(
            coordinator.submit(ScanRequest::new("other.test", "alice")).await,
            Err(CoordinatorError::Unauthorized(_))
        ));

        let first = coordinator.submit(ScanRequest::new("example.com", "alice")).await.unwrap();
        assert!(matches!(
            coordinator.submit(ScanRequest::new("example.com", "bob")).await,
            Err(CoordinatorError::Overloaded { limit: 1, .. })
        ));
        assert!(matches!(
            coordinator.delete_job(first).await,
            Err(CoordinatorError::StillRunning(_))
        ));
        assert_eq!(coordinator.wait(first).await.unwrap(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn triage_survives_reaggregation_and_delete_keeps_records() {
        let (coordinator, _) = coordinator(config());
        let coordinator = coordinator
            .with_engine(Arc::new(Names(vec!["api.example.com"])))
            .with_engine(Detector::new("det", vec![("api.example.com", Behaviour::Report("redis/6.0.0", Severity::High))]));

        let id = coordinator.submit(ScanRequest::new("example.com", "alice")).await.unwrap();
        coordinator.wait(id).await.unwrap();
        let record = coordinator.vulnerabilities(id).await.unwrap().remove(0);

        coordinator.triage(id, record.id, RecordStatus::Confirmed).await.unwrap();
        assert_eq!(coordinator.reaggregate(id).await.unwrap(), 1);
        let again = coordinator.vulnerabilities(id).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].status, RecordStatus::Confirmed);
        assert_eq!(again[0].finding_ids, record.finding_ids);

        coordinator.delete_job(id).await.unwrap();
        assert!(coordinator.findings(id).await.unwrap().is_empty());
        assert!(coordinator.events(id).await.unwrap().is_empty());
        assert_eq!(coordinator.vulnerabilities(id).await.unwrap().len(), 1);
        assert!(matches!(coordinator.status(id).await, Err(CoordinatorError::NotFound(_))));
    }

    #[tokio::test]
    async fn stage_selection_limits_the_pipeline() {
        let (coordinator, _) = coordinator(config());
        let detector = Detector::new("det", vec![]);
        let coordinator = coordinator
            .with_engine(Arc::new(Names(vec!["www.example.com"])))
            .with_engine(prober())
            .with_engine(detector.clone());

        let request = ScanRequest::new("example.com", "alice")
            .with_stages(StageSelection::from(vec![Stage::LiveHostCheck]));
        let id = coordinator.submit(request).await.unwrap();
        assert_eq!(coordinator.wait(id).await.unwrap(), JobStatus::Completed);

        let view = coordinator.status(id).await.unwrap();
        assert!(view.stages.contains_key(&Stage::LiveHostCheck));
        assert!(!view.stages.contains_key(&Stage::EndpointEnumeration));
        assert!(!view.stages.contains_key(&Stage::VulnerabilityDetection));
        assert!(detector.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn address_roots_skip_name_discovery() {
        let (coordinator, _) = coordinator(config());
        let coordinator = coordinator.with_engine(Arc::new(Names(vec!["www.example.com"])));

        let id = coordinator.submit(ScanRequest::new("192.0.2.0/30", "alice")).await.unwrap();
        assert_eq!(coordinator.wait(id).await.unwrap(), JobStatus::Completed);
        let keys: Vec<_> = coordinator
            .sub_targets(id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.dedup_key)
            .collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.starts_with("192.0.2.")));
    }

    #[tokio::test]
    async fn progress_reaches_subscribers() {
        let publisher = Arc::new(BroadcastPublisher::new(1024));
        let mut rx = publisher.subscribe();
        let (coordinator, _) = coordinator(config());
        let coordinator = coordinator
            .with_publisher(publisher)
            .with_engine(Arc::new(Names(vec!["www.example.com"])));

        let id = coordinator.submit(ScanRequest::new("example.com", "alice")).await.unwrap();
        coordinator.wait(id).await.unwrap();

        let (job, first) = rx.recv().await.unwrap();
        assert_eq!(job, id);
        assert_eq!(first.kind, EventKind::JobQueued);
        let mut last = first.kind;
        while let Ok((_, event)) = rx.try_recv() {
            last = event.kind;
        }
        assert_eq!(last, EventKind::JobFinished);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_jobs_stay_isolated() {
        let mut cfg = config();
        cfg.max_active_jobs = 8;
        let (coordinator, store) = coordinator(cfg);
        let coordinator = coordinator
            .with_engine(Arc::new(Names(vec!["a.example.com", "b.example.com", "c.example.com"])))
            .with_engine(prober())
            .with_engine(Detector::new("det", vec![("b.example.com", Behaviour::Report("exim/4.92", Severity::Critical))]));

        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(coordinator.submit(ScanRequest::new("example.com", "alice")).await.unwrap());
        }
        for id in &ids {
            assert_eq!(coordinator.wait(*id).await.unwrap(), JobStatus::Completed);
            let runs = store.query_stage_runs(&StageRunFilter::job(*id)).await.unwrap();
            let mut keys = HashSet::new();
            for run in &runs {
                assert!(run.status.is_terminal());
                assert!(keys.insert((run.stage, run.dedup_key.clone())));
            }
            assert_eq!(coordinator.vulnerabilities(*id).await.unwrap().len(), 1);
        }
        assert_eq!(coordinator.list_jobs(&JobFilter::default()).await.unwrap().len(), 6);
    }
}
