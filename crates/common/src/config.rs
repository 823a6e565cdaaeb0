//! Orchestrator configuration
//!
//! Every field has a default so a partial JSON file is enough. Durations are
//! plain millisecond / second integers to keep config files readable.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::types::StageSelection;

/// Retry budget and exponential backoff for one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub budget: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: 2,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let mult = u64::from(self.factor.max(1)).saturating_pow(exp);
        Duration::from_millis(
            self.base_backoff_ms
                .saturating_mul(mult)
                .min(self.max_backoff_ms),
        )
    }
}

/// Which discovery methods run and how their output is scoped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Engine ids to run; empty means every registered discover engine.
    pub methods: Vec<String>,
    /// Add the root target itself to the discovered set.
    pub include_root: bool,
    /// Drop names that are not the root domain or below it.
    pub enforce_scope: bool,
    /// Expand CIDRs larger than 4096 hosts.
    pub allow_large_cidr: bool,
    pub method_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            methods: Vec::new(),
            include_root: false,
            enforce_scope: true,
            allow_large_cidr: false,
            method_timeout_secs: 120,
        }
    }
}

impl DiscoveryConfig {
    #[must_use]
    pub fn method_timeout(&self) -> Duration {
        Duration::from_secs(self.method_timeout_secs)
    }
}

/// How disagreeing severities inside one record are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityPolicy {
    /// Highest severity wins; engine trust picks the representative among ties.
    #[default]
    Max,
    /// The most trusted contributing engine's severity wins.
    MostTrusted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationPolicy {
    pub severity: SeverityPolicy,
    /// Engine ids, most trusted first.
    pub engine_trust: Vec<String>,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            severity: SeverityPolicy::Max,
            engine_trust: vec![
                "external-nuclei".to_string(),
                "banner-version".to_string(),
                "http-headers".to_string(),
                "tcp-probe".to_string(),
            ],
        }
    }
}

impl AggregationPolicy {
    /// Lower rank is more trusted. Unlisted engines rank after listed ones.
    #[must_use]
    pub fn rank(&self, engine: &str) -> usize {
        self.engine_trust
            .iter()
            .position(|e| e == engine)
            .unwrap_or(self.engine_trust.len())
    }
}

/// Orchestrator-wide tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Worker pool size per job.
    pub max_concurrency: usize,
    /// Per-engine in-flight caps.
    pub engine_limits: HashMap<String, usize>,
    /// Per-engine request rate ceilings (requests per second).
    pub engine_rate_limits: HashMap<String, u32>,
    pub retry: RetryPolicy,
    /// Per engine invocation.
    pub unit_timeout_ms: u64,
    /// Wall-clock ceiling per job.
    pub job_timeout_secs: u64,
    /// Queued units per job before submissions are refused.
    pub queue_ceiling: usize,
    /// Jobs allowed to run at once before new submissions are refused.
    pub max_active_jobs: usize,
    pub discovery: DiscoveryConfig,
    pub aggregation: AggregationPolicy,
    /// Stage selection for submissions that do not name their own.
    pub stages: StageSelection,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            engine_limits: HashMap::new(),
            engine_rate_limits: HashMap::new(),
            retry: RetryPolicy::default(),
            unit_timeout_ms: 30_000,
            job_timeout_secs: 3_600,
            queue_ceiling: 10_000,
            max_active_jobs: 8,
            discovery: DiscoveryConfig::default(),
            aggregation: AggregationPolicy::default(),
            stages: StageSelection::all(),
        }
    }
}

impl OrchestratorConfig {
    /// Fast preset: short timeouts, no retries, wide pool.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            max_concurrency: 64,
            retry: RetryPolicy {
                budget: 0,
                ..RetryPolicy::default()
            },
            unit_timeout_ms: 10_000,
            ..Self::default()
        }
    }

    /// Accurate preset: longer timeouts and a bigger retry budget.
    #[must_use]
    pub fn accurate() -> Self {
        Self {
            max_concurrency: 8,
            retry: RetryPolicy {
                budget: 3,
                base_backoff_ms: 500,
                ..RetryPolicy::default()
            },
            unit_timeout_ms: 90_000,
            ..Self::default()
        }
    }

    /// Stealth preset: narrow pool and explicit per-engine rate ceilings.
    #[must_use]
    pub fn stealth() -> Self {
        let mut engine_rate_limits = HashMap::new();
        engine_rate_limits.insert("tcp-probe".to_string(), 20);
        engine_rate_limits.insert("dns-bruteforce".to_string(), 10);
        engine_rate_limits.insert("http-headers".to_string(), 5);
        Self {
            max_concurrency: 2,
            engine_rate_limits,
            unit_timeout_ms: 60_000,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "fast" => Some(Self::fast()),
            "balanced" | "default" => Some(Self::default()),
            "accurate" => Some(Self::accurate()),
            "stealth" => Some(Self::stealth()),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn unit_timeout(&self) -> Duration {
        Duration::from_millis(self.unit_timeout_ms)
    }

    #[inline]
    #[must_use]
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(2), Duration::from_millis(400));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
        assert_eq!(p.backoff(30), Duration::from_millis(5_000));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: OrchestratorConfig =
            serde_json::from_str(r#"{"max_concurrency": 3, "retry": {"budget": 5}}"#).unwrap();
        assert_eq!(cfg.max_concurrency, 3);
        assert_eq!(cfg.retry.budget, 5);
        assert_eq!(cfg.retry.base_backoff_ms, 200);
        assert_eq!(cfg.queue_ceiling, 10_000);
    }

    #[test]
    fn presets() {
        assert_eq!(OrchestratorConfig::fast().retry.budget, 0);
        assert!(OrchestratorConfig::stealth().engine_rate_limits.contains_key("tcp-probe"));
        assert!(OrchestratorConfig::preset("nope").is_none());
    }

    #[test]
    fn trust_rank() {
        let policy = AggregationPolicy {
            severity: SeverityPolicy::Max,
            engine_trust: vec!["a".into(), "b".into()],
        };
        assert!(policy.rank("a") < policy.rank("b"));
        assert_eq!(policy.rank("zzz"), 2);
    }
}
