//! Core data model for the Kavach scan orchestrator
//!
//! Every entity here is a plain serde-friendly row. Jobs exclusively own their
//! sub-targets, stage runs, findings and progress events; vulnerability
//! records are derived and are allowed to outlive the job that produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::KavachError;

/// Namespace for deterministic vulnerability record ids.
const RECORD_NAMESPACE: Uuid = Uuid::from_u128(0x6b61_7661_6368_0000_7675_6c6e_7265_6364);

/// Pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovery,
    LiveHostCheck,
    EndpointEnumeration,
    VulnerabilityDetection,
    Aggregation,
}

/// How a stage fans out over the sub-target set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOut {
    /// One unit per sub-target.
    PerSubTarget,
    /// One unit for the whole job, keyed on the root target.
    Global,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Discovery,
        Stage::LiveHostCheck,
        Stage::EndpointEnumeration,
        Stage::VulnerabilityDetection,
        Stage::Aggregation,
    ];

    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Stage::Discovery => "discovery",
            Stage::LiveHostCheck => "live_host_check",
            Stage::EndpointEnumeration => "endpoint_enumeration",
            Stage::VulnerabilityDetection => "vulnerability_detection",
            Stage::Aggregation => "aggregation",
        }
    }

    /// Stage whose terminal state gates this one.
    #[must_use]
    pub const fn input(&self) -> Option<Stage> {
        match self {
            Stage::Discovery => None,
            Stage::LiveHostCheck => Some(Stage::Discovery),
            Stage::EndpointEnumeration => Some(Stage::LiveHostCheck),
            Stage::VulnerabilityDetection => Some(Stage::EndpointEnumeration),
            Stage::Aggregation => Some(Stage::VulnerabilityDetection),
        }
    }

    #[must_use]
    pub const fn fan_out(&self) -> FanOut {
        match self {
            Stage::Discovery | Stage::Aggregation => FanOut::Global,
            _ => FanOut::PerSubTarget,
        }
    }

    /// Engine capability that serves this stage. Aggregation is internal.
    #[must_use]
    pub const fn capability(&self) -> Option<Capability> {
        match self {
            Stage::Discovery => Some(Capability::Discover),
            Stage::LiveHostCheck | Stage::EndpointEnumeration => Some(Capability::Enumerate),
            Stage::VulnerabilityDetection => Some(Capability::Detect),
            Stage::Aggregation => None,
        }
    }

    /// Whether this stage's output is a set of new sub-targets.
    #[must_use]
    pub const fn produces_sub_targets(&self) -> bool {
        matches!(self, Stage::Discovery | Stage::EndpointEnumeration)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = KavachError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .or(match normalized.as_str() {
                "live" | "livehost" => Some(Stage::LiveHostCheck),
                "endpoints" | "enumeration" => Some(Stage::EndpointEnumeration),
                "detection" | "detect" => Some(Stage::VulnerabilityDetection),
                _ => None,
            })
            .ok_or_else(|| KavachError::Config(format!("unknown stage '{s}'")))
    }
}

/// Capability set an engine adapter can implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Discover,
    Enumerate,
    Detect,
}

impl Capability {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Capability::Discover => "discover",
            Capability::Enumerate => "enumerate",
            Capability::Detect => "detect",
        }
    }

    /// Stages an engine with this capability serves by default.
    #[must_use]
    pub const fn stages(&self) -> &'static [Stage] {
        match self {
            Capability::Discover => &[Stage::Discovery],
            Capability::Enumerate => &[Stage::LiveHostCheck, Stage::EndpointEnumeration],
            Capability::Detect => &[Stage::VulnerabilityDetection],
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which stages a job runs. Discovery and Aggregation are always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Stage>", into = "Vec<Stage>")]
pub struct StageSelection {
    stages: BTreeSet<Stage>,
}

impl StageSelection {
    #[must_use]
    pub fn all() -> Self {
        Self::from(Stage::ALL.to_vec())
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    /// First selected per-sub-target stage strictly after `stage`.
    #[must_use]
    pub fn next_after(&self, stage: Stage) -> Option<Stage> {
        self.stages
            .iter()
            .copied()
            .find(|s| *s > stage && s.fan_out() == FanOut::PerSubTarget)
    }

    /// Selected per-sub-target stages strictly after `stage`.
    pub fn remaining_after(&self, stage: Stage) -> impl Iterator<Item = Stage> + '_ {
        self.stages
            .iter()
            .copied()
            .filter(move |s| *s > stage && s.fan_out() == FanOut::PerSubTarget)
    }

    pub fn iter(&self) -> impl Iterator<Item = Stage> + '_ {
        self.stages.iter().copied()
    }
}

impl Default for StageSelection {
    fn default() -> Self {
        Self::all()
    }
}

impl From<Vec<Stage>> for StageSelection {
    fn from(stages: Vec<Stage>) -> Self {
        let mut set: BTreeSet<Stage> = stages.into_iter().collect();
        set.insert(Stage::Discovery);
        set.insert(Stage::Aggregation);
        Self { stages: set }
    }
}

impl From<StageSelection> for Vec<Stage> {
    fn from(selection: StageSelection) -> Self {
        selection.stages.into_iter().collect()
    }
}

/// Lifecycle of a scan job. Only the coordinator writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Partial,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Partial => "partial",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled never change again. A partial job may
    /// still be cancelled while its in-flight units drain.
    #[inline]
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job knobs captured at submission time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub stages: StageSelection,
    /// Overrides the orchestrator-wide worker pool size.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Lowers (never raises) per-engine concurrency caps for this job.
    #[serde(default)]
    pub engine_limits: HashMap<String, usize>,
}

/// What the submission surface hands the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub target: String,
    pub owner: String,
    #[serde(default)]
    pub config: JobConfig,
}

impl ScanRequest {
    #[must_use]
    pub fn new<T: Into<String>, O: Into<String>>(target: T, owner: O) -> Self {
        Self {
            target: target.into(),
            owner: owner.into(),
            config: JobConfig::default(),
        }
    }

    #[must_use]
    pub fn with_stages(mut self, stages: StageSelection) -> Self {
        self.config.stages = stages;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.config.max_concurrency = Some(max_concurrency);
        self
    }

    #[must_use]
    pub fn with_engine_limit<S: Into<String>>(mut self, engine: S, limit: usize) -> Self {
        self.config.engine_limits.insert(engine.into(), limit);
        self
    }
}

/// One end-to-end orchestrated run against a root target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: Uuid,
    pub root_target: String,
    /// Normalized key of the root target; global stage runs are keyed on it.
    pub root_key: String,
    pub owner: String,
    pub config: JobConfig,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ScanJob {
    #[must_use]
    pub fn new(request: ScanRequest, root_key: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            root_target: request.target,
            root_key,
            owner: request.owner,
            config: request.config,
            status: JobStatus::Queued,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Apply a status change and stamp the matching timestamps.
    pub fn set_status(&mut self, status: JobStatus) {
        let now = Utc::now();
        if status == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() || status == JobStatus::Partial {
            self.finished_at = Some(now);
        }
        self.status = status;
        self.updated_at = now;
    }

    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - start).to_std().ok()
    }
}

/// Shape of a sub-target value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTargetKind {
    Domain,
    Ip,
    Url,
    /// `host:port`
    Endpoint,
}

/// A discovered host/endpoint/URL scoped under a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTarget {
    pub id: Uuid,
    pub job_id: Uuid,
    pub value: String,
    /// Unique within the job.
    pub dedup_key: String,
    pub kind: SubTargetKind,
    pub discovered_via: Stage,
    pub parent_id: Option<Uuid>,
    pub discovered_at: DateTime<Utc>,
}

impl SubTarget {
    /// Ids are derived from the job and dedup key so re-discovery is stable.
    #[must_use]
    pub fn new(
        job_id: Uuid,
        value: String,
        dedup_key: String,
        kind: SubTargetKind,
        discovered_via: Stage,
    ) -> Self {
        Self {
            id: Uuid::new_v5(&job_id, dedup_key.as_bytes()),
            job_id,
            value,
            dedup_key,
            kind,
            discovered_via,
            parent_id: None,
            discovered_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Host part of the value, without scheme, port or path.
    #[must_use]
    pub fn host(&self) -> &str {
        let rest = self
            .value
            .split_once("://")
            .map_or(self.value.as_str(), |(_, r)| r);
        let rest = rest.split('/').next().unwrap_or(rest);
        match rest.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => rest,
        }
    }

    /// Explicit port, if the value carries one.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        let rest = self
            .value
            .split_once("://")
            .map_or(self.value.as_str(), |(_, r)| r);
        let rest = rest.split('/').next().unwrap_or(rest);
        rest.rsplit_once(':').and_then(|(_, p)| p.parse().ok())
    }
}

impl fmt::Display for SubTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage address of a stage run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageRunKey {
    pub job_id: Uuid,
    pub stage: Stage,
    pub dedup_key: String,
}

impl StageRunKey {
    #[must_use]
    pub fn new<S: Into<String>>(job_id: Uuid, stage: Stage, dedup_key: S) -> Self {
        Self {
            job_id,
            stage,
            dedup_key: dedup_key.into(),
        }
    }
}

impl fmt::Display for StageRunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.job_id, self.stage, self.dedup_key)
    }
}

/// Execution record of one (stage, sub-target) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRun {
    pub job_id: Uuid,
    pub stage: Stage,
    pub dedup_key: String,
    /// `None` for global stages.
    pub sub_target_id: Option<Uuid>,
    pub status: StageStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StageRun {
    #[must_use]
    pub fn pending(key: StageRunKey, sub_target_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            job_id: key.job_id,
            stage: key.stage,
            dedup_key: key.dedup_key,
            sub_target_id,
            status: StageStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn skipped(key: StageRunKey, sub_target_id: Option<Uuid>, reason: &str) -> Self {
        let mut run = Self::pending(key, sub_target_id);
        run.status = StageStatus::Skipped;
        run.last_error = Some(reason.to_string());
        run
    }

    #[must_use]
    pub fn key(&self) -> StageRunKey {
        StageRunKey::new(self.job_id, self.stage, self.dedup_key.clone())
    }
}

/// Severity scale, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Lenient parse for engine output; unknown labels map to `Info`.
    #[must_use]
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" | "crit" => Severity::Critical,
            "high" => Severity::High,
            "medium" | "moderate" | "med" => Severity::Medium,
            "low" => Severity::Low,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finding as produced by an engine, before the orchestrator stamps ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingDraft {
    pub finding_type: String,
    pub title: String,
    /// Engine-supplied stable signature; derived from evidence when absent.
    pub signature: Option<String>,
    pub severity: Severity,
    pub confidence: f32,
    pub evidence: Value,
}

impl FindingDraft {
    #[must_use]
    pub fn new<T: Into<String>, S: Into<String>>(finding_type: T, title: S) -> Self {
        Self {
            finding_type: finding_type.into(),
            title: title.into(),
            signature: None,
            severity: Severity::Info,
            confidence: 1.0,
            evidence: Value::Null,
        }
    }

    #[must_use]
    pub fn with_signature<S: Into<String>>(mut self, signature: S) -> Self {
        self.signature = Some(signature.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_evidence(mut self, evidence: Value) -> Self {
        self.evidence = evidence;
        self
    }
}

/// Immutable raw output unit of one engine against one sub-target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub job_id: Uuid,
    pub sub_target_id: Uuid,
    pub engine: String,
    pub finding_type: String,
    pub title: String,
    pub signature: Option<String>,
    pub severity: Severity,
    pub confidence: f32,
    pub evidence: Value,
    pub observed_at: DateTime<Utc>,
}

impl Finding {
    #[must_use]
    pub fn from_draft(job_id: Uuid, sub_target_id: Uuid, engine: &str, draft: FindingDraft) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            sub_target_id,
            engine: engine.to_string(),
            finding_type: draft.finding_type,
            title: draft.title,
            signature: draft.signature,
            severity: draft.severity,
            confidence: draft.confidence,
            evidence: draft.evidence,
            observed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    #[default]
    Open,
    Confirmed,
    FalsePositive,
}

impl RecordStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Open => "open",
            RecordStatus::Confirmed => "confirmed",
            RecordStatus::FalsePositive => "false_positive",
        }
    }
}

/// Grouping key for aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub finding_type: String,
    pub sub_target_id: Uuid,
    pub signature: String,
}

impl RecordKey {
    /// Deterministic record id for this key.
    #[must_use]
    pub fn record_id(&self) -> Uuid {
        let name = format!(
            "{}\u{1f}{}\u{1f}{}",
            self.finding_type, self.sub_target_id, self.signature
        );
        Uuid::new_v5(&RECORD_NAMESPACE, name.as_bytes())
    }
}

/// Canonical deduplicated vulnerability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub sub_target_id: Uuid,
    pub finding_type: String,
    pub signature: String,
    pub title: String,
    pub severity: Severity,
    pub confidence: f32,
    /// Engine whose finding represents the group.
    pub primary_engine: String,
    pub engines: Vec<String>,
    pub evidence: Value,
    pub status: RecordStatus,
    /// Sorted contributing finding ids.
    pub finding_ids: Vec<Uuid>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl VulnerabilityRecord {
    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey {
            finding_type: self.finding_type.clone(),
            sub_target_id: self.sub_target_id,
            signature: self.signature.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobQueued,
    JobStarted,
    SubTargetsDiscovered,
    UnitQueued,
    UnitDispatched,
    UnitRetrying,
    UnitSucceeded,
    UnitFailed,
    UnitSkipped,
    ResolverPartialFailure,
    Backpressure,
    DeadlineExceeded,
    CancelRequested,
    AggregationCompleted,
    JobFinished,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventKind::JobQueued => "job_queued",
            EventKind::JobStarted => "job_started",
            EventKind::SubTargetsDiscovered => "sub_targets_discovered",
            EventKind::UnitQueued => "unit_queued",
            EventKind::UnitDispatched => "unit_dispatched",
            EventKind::UnitRetrying => "unit_retrying",
            EventKind::UnitSucceeded => "unit_succeeded",
            EventKind::UnitFailed => "unit_failed",
            EventKind::UnitSkipped => "unit_skipped",
            EventKind::ResolverPartialFailure => "resolver_partial_failure",
            EventKind::Backpressure => "backpressure",
            EventKind::DeadlineExceeded => "deadline_exceeded",
            EventKind::CancelRequested => "cancel_requested",
            EventKind::AggregationCompleted => "aggregation_completed",
            EventKind::JobFinished => "job_finished",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only informational record of something that happened to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub id: Uuid,
    pub job_id: Uuid,
    pub stage: Option<Stage>,
    pub sub_target: Option<String>,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub payload: Value,
}

impl ProgressEvent {
    #[must_use]
    pub fn new(job_id: Uuid, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            stage: None,
            sub_target: None,
            kind,
            at: Utc::now(),
            payload: Value::Null,
        }
    }

    #[must_use]
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    #[must_use]
    pub fn with_sub_target<S: Into<String>>(mut self, sub_target: S) -> Self {
        self.sub_target = Some(sub_target.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Filter for job listing.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub owner: Option<String>,
    pub status: Option<JobStatus>,
}

/// Filter for stage-run queries.
#[derive(Debug, Clone)]
pub struct StageRunFilter {
    pub job_id: Uuid,
    pub stage: Option<Stage>,
    pub status: Option<StageStatus>,
}

impl StageRunFilter {
    #[must_use]
    pub fn job(job_id: Uuid) -> Self {
        Self {
            job_id,
            stage: None,
            status: None,
        }
    }

    #[must_use]
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    #[must_use]
    pub fn status(mut self, status: StageStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn matches(&self, run: &StageRun) -> bool {
        run.job_id == self.job_id
            && self.stage.map_or(true, |s| s == run.stage)
            && self.status.map_or(true, |s| s == run.status)
    }
}

/// Per-invocation context handed to an engine.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    pub job_id: Uuid,
    pub stage: Stage,
    /// 1-based.
    pub attempt: u32,
    pub timeout: Duration,
    pub params: Value,
}

impl InvokeContext {
    #[must_use]
    pub fn new(job_id: Uuid, stage: Stage, timeout: Duration) -> Self {
        Self {
            job_id,
            stage,
            attempt: 1,
            timeout,
            params: Value::Null,
        }
    }
}

/// What one engine invocation returns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineOutput {
    pub findings: Vec<FindingDraft>,
    /// Raw sub-target candidates (discover / enumerate engines).
    pub discovered: Vec<String>,
    /// Liveness verdict; `None` when the engine has no opinion.
    pub alive: Option<bool>,
}

impl EngineOutput {
    #[must_use]
    pub fn findings(findings: Vec<FindingDraft>) -> Self {
        Self {
            findings,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn discovered(discovered: Vec<String>) -> Self {
        Self {
            discovered,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn alive(alive: bool) -> Self {
        Self {
            alive: Some(alive),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_findings(mut self, findings: Vec<FindingDraft>) -> Self {
        self.findings.extend(findings);
        self
    }

}
