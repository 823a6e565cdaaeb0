//! Kavach Common - shared model and contracts
//!
//! This crate provides the data model, error taxonomy, configuration and
//! collaborator traits used across the Kavach scan orchestrator.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use config::{AggregationPolicy, DiscoveryConfig, OrchestratorConfig, RetryPolicy, SeverityPolicy};
pub use error::{EngineError, KavachError, KavachResult};
pub use traits::{Authorizer, Engine, EventPublisher, ScanStore};
pub use types::{
    Capability, EngineOutput, EventKind, FanOut, Finding, FindingDraft, InvokeContext, JobConfig,
    JobFilter, JobStatus, ProgressEvent, RecordKey, RecordStatus, ScanJob, ScanRequest, Severity,
    Stage, StageRun, StageRunFilter, StageRunKey, StageSelection, StageStatus, SubTarget,
    SubTargetKind, VulnerabilityRecord,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
