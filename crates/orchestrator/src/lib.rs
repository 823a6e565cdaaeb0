//! Orchestrator - job lifecycle, stage pipeline and work distribution
//!
//! A [`Coordinator`] accepts scan requests and drives each job through
//! discovery, live-host checks, endpoint enumeration and detection. Units of
//! work are claimed through the store, run by a bounded [`Scheduler`] pool
//! with retry and backoff, and their findings are merged by [`aggregate`].

mod aggregator;
mod authz;
mod coordinator;
mod pipeline;
mod progress;
mod publisher;
mod rate_limiter;
mod scheduler;

pub use aggregator::{aggregate, normalized_signature, record_key};
pub use authz::{AllowAll, ScopeAllowlist};
pub use coordinator::{Coordinator, CoordinatorError, FailedUnit, JobView, StageCounts};
pub use pipeline::{EngineGate, StagePipeline};
pub use progress::{ProgressTracker, UnitCounters};
pub use publisher::{BroadcastPublisher, NullPublisher};
pub use rate_limiter::RateLimiter;
pub use scheduler::{
    Scheduler, SchedulerError, SchedulerSettings, UnitExecutor, UnitHandle, UnitOutcome,
    UnitProgress, WorkUnit,
};
