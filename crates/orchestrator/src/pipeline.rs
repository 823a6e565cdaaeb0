//! Stage pipeline
//!
//! Executes one attempt of a work unit. Discovery goes through the target
//! resolver; every other per-sub-target stage fans the sub-target out to
//! the engines serving that stage. Engines that already answered during an
//! earlier attempt are not invoked again.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use kavach_common::{
    Engine, EngineError, EngineOutput, EventKind, InvokeContext, KavachError, Stage, SubTarget,
};
use kavach_target_resolver::{RootTarget, TargetResolver};

use crate::progress::ProgressTracker;
use crate::rate_limiter::RateLimiter;
use crate::scheduler::{UnitExecutor, UnitProgress, WorkUnit};

/// Admission controls for one engine: in-flight caps (shared and per job)
/// and an optional request-rate ceiling.
#[derive(Clone, Default)]
pub struct EngineGate {
    caps: Vec<Arc<Semaphore>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl EngineGate {
    #[inline]
    #[must_use]
    pub fn with_cap(mut self, cap: Arc<Semaphore>) -> Self {
        self.caps.push(cap);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    async fn invoke(
        &self,
        engine: &dyn Engine,
        target: &SubTarget,
        ctx: &InvokeContext,
    ) -> Result<EngineOutput, EngineError> {
        let mut permits = Vec::with_capacity(self.caps.len());
        for cap in &self.caps {
            let permit = cap
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::Unavailable("engine gate closed".to_string()))?;
            permits.push(permit);
        }
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
        match timeout(ctx.timeout, engine.invoke(target, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(ctx.timeout)),
        }
    }
}

pub struct StagePipeline {
    job_id: Uuid,
    root: RootTarget,
    resolver: Arc<TargetResolver>,
    engines: Vec<Arc<dyn Engine>>,
    gates: HashMap<String, EngineGate>,
    unit_timeout: Duration,
    progress: Arc<ProgressTracker>,
}

impl StagePipeline {
    pub fn new(
        job_id: Uuid,
        root: RootTarget,
        resolver: Arc<TargetResolver>,
        progress: Arc<ProgressTracker>,
        unit_timeout: Duration,
    ) -> Self {
        Self {
            job_id,
            root,
            resolver,
            engines: Vec::new(),
            gates: HashMap::new(),
            unit_timeout,
            progress,
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn Engine>, gate: EngineGate) -> Self {
        self.gates.insert(engine.id().to_string(), gate);
        self.engines.push(engine);
        self
    }

    async fn discover(&self, progress: &mut UnitProgress) -> Result<(), EngineError> {
        let resolution = self.resolver.resolve(self.job_id, &self.root).await;
        for failure in &resolution.failures {
            if let KavachError::ResolverPartialFailure { method, reason } = failure {
                self.progress
                    .job_event(
                        EventKind::ResolverPartialFailure,
                        json!({ "method": method, "reason": reason }),
                    )
                    .await;
            }
            progress.errors.push(failure.to_string());
        }

        if resolution.sub_targets.is_empty() {
            let detail = if progress.errors.is_empty() {
                String::new()
            } else {
                format!(" ({})", progress.errors.join("; "))
            };
            return Err(EngineError::Fatal(format!(
                "discovery yielded no sub-targets{detail}"
            )));
        }
        progress.discovered = resolution
            .sub_targets
            .into_iter()
            .map(|s| s.value)
            .collect();
        Ok(())
    }

    #[instrument(skip_all, fields(stage = %stage, sub_target = %target.dedup_key, attempt = attempt))]
    async fn fan_out(
        &self,
        stage: Stage,
        target: &SubTarget,
        progress: &mut UnitProgress,
        attempt: u32,
    ) -> Result<(), EngineError> {
        let pending: Vec<_> = self
            .engines
            .iter()
            .filter(|e| e.serves(stage) && e.accepts(target))
            .filter(|e| !progress.completed.contains(e.id()) && !progress.fatal.contains(e.id()))
            .cloned()
            .collect();
        if pending.is_empty() {
            debug!("no engine left to run");
            return Ok(());
        }

        let mut tasks = JoinSet::new();
        for engine in pending {
            let gate = self.gates.get(engine.id()).cloned().unwrap_or_default();
            let target = target.clone();
            let mut ctx = InvokeContext::new(self.job_id, stage, self.unit_timeout);
            ctx.attempt = attempt;
            tasks.spawn(async move {
                let result = gate.invoke(engine.as_ref(), &target, &ctx).await;
                (engine.id().to_string(), result)
            });
        }

        let mut retryable = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (engine, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "engine task aborted");
                    retryable.push(EngineError::Unavailable(e.to_string()));
                    continue;
                }
            };
            match result {
                Ok(output) => {
                    kavach_telemetry::record_engine_invocation(&engine, "ok");
                    debug!(
                        engine = %engine,
                        findings = output.findings.len(),
                        discovered = output.discovered.len(),
                        "engine finished"
                    );
                    progress
                        .findings
                        .extend(output.findings.into_iter().map(|f| (engine.clone(), f)));
                    progress.discovered.extend(output.discovered);
                    if let Some(alive) = output.alive {
                        progress.alive.push(alive);
                    }
                    progress.completed.insert(engine);
                }
                Err(e) if e.is_retryable() => {
                    kavach_telemetry::record_engine_invocation(&engine, "retryable");
                    warn!(engine = %engine, error = %e, "engine failed, will retry");
                    progress.errors.push(format!("{engine}: {e}"));
                    retryable.push(e);
                }
                Err(e) => {
                    kavach_telemetry::record_engine_invocation(&engine, "fatal");
                    warn!(engine = %engine, error = %e, "engine failed");
                    progress.errors.push(format!("{engine}: {e}"));
                    progress.fatal.insert(engine);
                }
            }
        }

        if let Some(first) = retryable.into_iter().next() {
            return Err(first);
        }
        if !progress.fatal.is_empty() {
            let mut failed: Vec<_> = progress.fatal.iter().cloned().collect();
            failed.sort();
            let reason = progress
                .errors
                .iter()
                .rev()
                .find(|msg| failed.iter().any(|id| msg.starts_with(id.as_str())))
                .cloned()
                .unwrap_or_else(|| format!("engines failed: {}", failed.join(", ")));
            return Err(EngineError::Fatal(reason));
        }
        Ok(())
    }
}

#[async_trait]
impl UnitExecutor for StagePipeline {
    async fn attempt(
        &self,
        unit: &WorkUnit,
        progress: &mut UnitProgress,
        attempt: u32,
    ) -> Result<(), EngineError> {
        let stage = unit.key.stage;
        match (stage, &unit.sub_target) {
            (Stage::Discovery, _) => self.discover(progress).await,
            (Stage::Aggregation, _) => Err(EngineError::Fatal(
                "aggregation is run by the coordinator".to_string(),
            )),
            (_, Some(target)) => self.fan_out(stage, target, progress, attempt).await,
            (_, None) => Err(EngineError::MalformedTarget(format!(
                "{stage} needs a sub-target"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::NullPublisher;
    use kavach_common::{Capability, DiscoveryConfig, FindingDraft, SubTargetKind};
    use kavach_storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        id: &'static str,
        calls: AtomicUsize,
        result: Result<EngineOutput, EngineError>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Probe {
        fn new(id: &'static str, result: Result<EngineOutput, EngineError>) -> Self {
            Self {
                id,
                calls: AtomicUsize::new(0),
                result,
                delay: Duration::ZERO,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Engine for Probe {
        fn id(&self) -> &str {
            self.id
        }

        fn capability(&self) -> Capability {
            Capability::Detect
        }

        async fn invoke(
            &self,
            _target: &SubTarget,
            _ctx: &InvokeContext,
        ) -> Result<EngineOutput, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn pipeline(job_id: Uuid) -> StagePipeline {
        let store = Arc::new(MemoryStore::new());
        let progress = Arc::new(ProgressTracker::new(job_id, store, Arc::new(NullPublisher)));
        StagePipeline::new(
            job_id,
            RootTarget::Domain("example.com".into()),
            Arc::new(TargetResolver::new(DiscoveryConfig::default())),
            progress,
            Duration::from_millis(200),
        )
    }

    fn unit(job_id: Uuid) -> WorkUnit {
        let sub = SubTarget::new(
            job_id,
            "api.example.com".into(),
            "api.example.com".into(),
            SubTargetKind::Domain,
            Stage::Discovery,
        );
        WorkUnit::for_sub_target(Stage::VulnerabilityDetection, sub)
    }

    #[tokio::test]
    async fn discovery_without_methods_yields_root() {
        let job_id = Uuid::new_v4();
        let p = pipeline(job_id);
        let mut progress = UnitProgress::default();
        p.attempt(&WorkUnit::global(job_id, Stage::Discovery, "example.com"), &mut progress, 1)
            .await
            .unwrap();
        assert_eq!(progress.discovered, vec!["example.com".to_string()]);
    }

    #[tokio::test]
    async fn successful_engines_are_not_rerun() {
        let job_id = Uuid::new_v4();
        let good = Arc::new(Probe::new(
            "good",
            Ok(EngineOutput::findings(vec![FindingDraft::new("outdated_software", "old")])),
        ));
        let flaky = Arc::new(Probe::new(
            "flaky",
            Err(EngineError::Timeout(Duration::from_millis(1))),
        ));
        let p = pipeline(job_id)
            .with_engine(good.clone(), EngineGate::default())
            .with_engine(flaky.clone(), EngineGate::default());

        let unit = unit(job_id);
        let mut progress = UnitProgress::default();
        assert!(p.attempt(&unit, &mut progress, 1).await.unwrap_err().is_retryable());
        assert!(p.attempt(&unit, &mut progress, 2).await.is_err());

        assert_eq!(good.calls.load(Ordering::SeqCst), 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
        assert_eq!(progress.findings.len(), 1);
        assert_eq!(progress.findings[0].0, "good");
    }

    #[tokio::test]
    async fn fatal_engine_fails_the_unit_but_keeps_findings() {
        let job_id = Uuid::new_v4();
        let good = Arc::new(Probe::new(
            "good",
            Ok(EngineOutput::findings(vec![FindingDraft::new("open_port", "22")])),
        ));
        let broken = Arc::new(Probe::new("broken", Err(EngineError::AuthRejected("401".into()))));
        let p = pipeline(job_id)
            .with_engine(good, EngineGate::default())
            .with_engine(broken, EngineGate::default());

        let mut progress = UnitProgress::default();
        let err = p.attempt(&unit(job_id), &mut progress, 1).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("broken"));
        assert_eq!(progress.findings.len(), 1);
    }

    #[tokio::test]
    async fn slow_engine_times_out() {
        let job_id = Uuid::new_v4();
        let mut slow = Probe::new("slow", Ok(EngineOutput::default()));
        slow.delay = Duration::from_secs(5);
        let p = pipeline(job_id).with_engine(Arc::new(slow), EngineGate::default());

        let mut progress = UnitProgress::default();
        let err = p.attempt(&unit(job_id), &mut progress, 1).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn engine_cap_is_shared_across_units() {
        let job_id = Uuid::new_v4();
        let mut probe = Probe::new("capped", Ok(EngineOutput::default()));
        probe.delay = Duration::from_millis(20);
        let probe = Arc::new(probe);
        let gate = EngineGate::default().with_cap(Arc::new(Semaphore::new(1)));
        let p = Arc::new(pipeline(job_id).with_engine(probe.clone(), gate));

        let mut tasks = JoinSet::new();
        for i in 0..4 {
            let p = p.clone();
            tasks.spawn(async move {
                let sub = SubTarget::new(
                    job_id,
                    format!("h{i}.example.com"),
                    format!("h{i}.example.com"),
                    SubTargetKind::Domain,
                    Stage::Discovery,
                );
                let unit = WorkUnit::for_sub_target(Stage::VulnerabilityDetection, sub);
                let mut progress = UnitProgress::default();
                p.attempt(&unit, &mut progress, 1).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            assert!(joined.unwrap().is_ok());
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
        assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 1);
    }
}
