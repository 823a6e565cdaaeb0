//! Seams between the orchestrator and everything it does not own
//!
//! - `Engine`: one external scanning capability behind a uniform contract
//! - `ScanStore`: durable save/load/query for job-owned rows
//! - `Authorizer`: one-time submission check
//! - `EventPublisher`: best-effort push channel for progress events

use crate::error::EngineError;
use crate::types::{
    Capability, EngineOutput, Finding, InvokeContext, JobFilter, JobStatus, ProgressEvent,
    ScanJob, Stage, StageRun, StageRunFilter, StageRunKey, SubTarget, VulnerabilityRecord,
};
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Uniform adapter contract. Implementations must keep no per-invocation
/// state so many calls can run concurrently.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Stable identifier, used for caps, rate limits and trust ordering.
    fn id(&self) -> &str;

    fn capability(&self) -> Capability;

    /// Whether this engine takes part in `stage`.
    fn serves(&self, stage: Stage) -> bool {
        self.capability().stages().contains(&stage)
    }

    /// Whether this engine can do anything with `target`.
    fn accepts(&self, _target: &SubTarget) -> bool {
        true
    }

    /// Cap imposed by the engine itself, e.g. a third-party rate ceiling.
    fn concurrency_limit(&self) -> Option<usize> {
        None
    }

    async fn invoke(
        &self,
        target: &SubTarget,
        ctx: &InvokeContext,
    ) -> std::result::Result<EngineOutput, EngineError>;
}

/// Persistence collaborator.
///
/// Conditional methods return `Ok(false)` when the precondition did not hold;
/// that is how concurrent writers detect they lost a race.
#[async_trait]
pub trait ScanStore: Send + Sync {
    async fn save_job(&self, job: &ScanJob) -> Result<()>;

    async fn load_job(&self, id: Uuid) -> Result<Option<ScanJob>>;

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScanJob>>;

    /// Compare-and-swap on job status.
    async fn transition_job(&self, id: Uuid, from: &[JobStatus], to: JobStatus) -> Result<bool>;

    /// Cascades sub-targets, stage runs, findings and events. Vulnerability
    /// records are kept.
    async fn delete_job(&self, id: Uuid) -> Result<()>;

    /// Inserts unless the (job, dedup key) pair already exists.
    async fn insert_sub_target(&self, sub_target: &SubTarget) -> Result<bool>;

    async fn sub_targets(&self, job_id: Uuid) -> Result<Vec<SubTarget>>;

    /// Inserts unless a run with the same key already exists.
    async fn insert_stage_run(&self, run: &StageRun) -> Result<bool>;

    async fn load_stage_run(&self, key: &StageRunKey) -> Result<Option<StageRun>>;

    /// Replace `expected` with `next` only if the stored row still has
    /// `expected`'s status and attempt count.
    async fn update_stage_run(&self, expected: &StageRun, next: &StageRun) -> Result<bool>;

    async fn query_stage_runs(&self, filter: &StageRunFilter) -> Result<Vec<StageRun>>;

    async fn save_findings(&self, findings: &[Finding]) -> Result<()>;

    async fn findings(&self, job_id: Uuid) -> Result<Vec<Finding>>;

    /// Upsert by record id.
    async fn save_vulnerabilities(&self, records: &[VulnerabilityRecord]) -> Result<()>;

    async fn vulnerabilities(&self, job_id: Uuid) -> Result<Vec<VulnerabilityRecord>>;

    async fn append_event(&self, event: &ProgressEvent) -> Result<()>;

    async fn events(&self, job_id: Uuid) -> Result<Vec<ProgressEvent>>;
}

/// Checked once, before a job is created.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn can_submit(&self, user: &str, target: &str) -> Result<bool>;
}

/// Push channel. Must never block the caller on delivery.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, job_id: Uuid, event: &ProgressEvent);
}
