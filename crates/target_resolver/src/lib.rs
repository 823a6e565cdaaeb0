//! Target Resolver - root target expansion and sub-target deduplication
//!
//! Takes a root target, runs every configured discovery method in parallel
//! and merges their output into a deduplicated, normalized sub-target set.
//! A failing method is logged and skipped; if all of them fail the result is
//! simply empty and the caller decides what that means.
//!
//! The same dedup logic (`SubTargetSet`) is reused by the pipeline so that no
//! logical target is scanned twice within one job.

mod root;

pub use root::{is_valid_hostname, RootTarget, MAX_HOSTS};

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use kavach_common::{
    Capability, DiscoveryConfig, Engine, EngineError, InvokeContext, KavachError, Stage,
    SubTarget, SubTargetKind,
};

/// Lower-case, strip scheme, credentials, fragment, trailing slashes and
/// trailing DNS dots, and wildcard prefixes.
#[must_use]
pub fn normalize(raw: &str) -> String {
    let mut s = raw.trim().to_ascii_lowercase();
    if let Some((_, rest)) = s.split_once("://") {
        s = rest.to_string();
    }
    if let Some(idx) = s.find('#') {
        s.truncate(idx);
    }
    if let Some(at) = s.find('@') {
        if !s[..at].contains('/') {
            s = s[at + 1..].to_string();
        }
    }
    while let Some(rest) = s.strip_prefix("*.") {
        s = rest.to_string();
    }
    while s.ends_with('/') {
        s.pop();
    }
    // trailing root dot on the host part only
    let (host, tail) = match s.find(['/', ':']) {
        Some(idx) => s.split_at(idx),
        None => (s.as_str(), ""),
    };
    let host = host.trim_end_matches('.');
    format!("{host}{tail}")
}

/// Shape of a normalized key.
#[must_use]
pub fn classify(key: &str) -> SubTargetKind {
    if key.contains('/') {
        return SubTargetKind::Url;
    }
    if key.parse::<IpAddr>().is_ok() {
        return SubTargetKind::Ip;
    }
    match key.rsplit_once(':') {
        Some((_, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            SubTargetKind::Endpoint
        }
        _ => SubTargetKind::Domain,
    }
}

/// Whether `key`'s host is `domain` or below it.
#[must_use]
pub fn in_scope(key: &str, domain: &str) -> bool {
    let host = key.split(['/', ':']).next().unwrap_or(key);
    host == domain || host.ends_with(&format!(".{domain}"))
}

/// Dedup keys already admitted for one job.
#[derive(Debug, Default, Clone)]
pub struct SubTargetSet {
    keys: HashSet<String>,
}

impl SubTargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize `raw` and admit it unless its key was seen before.
    pub fn admit(
        &mut self,
        job_id: Uuid,
        raw: &str,
        stage: Stage,
        parent: Option<&SubTarget>,
    ) -> Option<SubTarget> {
        let key = normalize(raw);
        if key.is_empty() || !self.keys.insert(key.clone()) {
            return None;
        }
        let kind = classify(&key);
        // URLs keep their scheme for display; everything else shows the key
        let value = if kind == SubTargetKind::Url && raw.contains("://") {
            raw.trim().trim_end_matches('/').to_string()
        } else {
            key.clone()
        };
        let mut sub = SubTarget::new(job_id, value, key, kind, stage);
        if let Some(parent) = parent {
            sub = sub.with_parent(parent.id);
        }
        Some(sub)
    }

    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Output of one resolve call.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Sorted by dedup key.
    pub sub_targets: Vec<SubTarget>,
    /// One `ResolverPartialFailure` per failing method.
    pub failures: Vec<KavachError>,
}

pub struct TargetResolver {
    config: DiscoveryConfig,
    methods: Vec<Arc<dyn Engine>>,
}

impl TargetResolver {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            methods: Vec::new(),
        }
    }

    /// Register a discovery method. Non-discover engines are ignored.
    pub fn with_method(mut self, method: Arc<dyn Engine>) -> Self {
        self.add_method(method);
        self
    }

    pub fn add_method(&mut self, method: Arc<dyn Engine>) {
        if method.capability() == Capability::Discover {
            self.methods.push(method);
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    fn active_methods(&self) -> Vec<Arc<dyn Engine>> {
        self.methods
            .iter()
            .filter(|m| self.config.methods.is_empty() || self.config.methods.iter().any(|id| id == m.id()))
            .cloned()
            .collect()
    }

    /// Expand `root` into its sub-target set.
    ///
    /// Address-shaped roots expand directly. Name roots run every active
    /// discovery method concurrently; with none configured the root itself
    /// is the only sub-target.
    #[instrument(skip(self), fields(root = %root))]
    pub async fn resolve(&self, job_id: Uuid, root: &RootTarget) -> Resolution {
        let mut set = SubTargetSet::new();
        let mut resolution = Resolution::default();

        if root.is_address_form() {
            for ip in root.addresses() {
                if let Some(sub) = set.admit(job_id, &ip.to_string(), Stage::Discovery, None) {
                    resolution.sub_targets.push(sub);
                }
            }
            debug!(count = resolution.sub_targets.len(), "expanded address root");
            return resolution;
        }

        let methods = self.active_methods();
        let root_sub = root.as_sub_target(job_id);
        if methods.is_empty() || self.config.include_root {
            if let Some(sub) = set.admit(job_id, &root_sub.value, Stage::Discovery, None) {
                resolution.sub_targets.push(sub);
            }
        }
        if methods.is_empty() {
            info!("no discovery methods configured, scanning root only");
            return resolution;
        }

        let method_timeout = self.config.method_timeout();
        let mut tasks = JoinSet::new();
        for method in methods {
            let target = root_sub.clone();
            let ctx = InvokeContext::new(job_id, Stage::Discovery, method_timeout);
            tasks.spawn(async move {
                let id = method.id().to_string();
                let result = match timeout(method_timeout, method.invoke(&target, &ctx)).await {
                    Ok(r) => r,
                    Err(_) => Err(EngineError::Timeout(method_timeout)),
                };
                (id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (method, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "discovery method task aborted");
                    resolution.failures.push(KavachError::ResolverPartialFailure {
                        method: "unknown".into(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            match result {
                Ok(output) => {
                    let mut admitted = 0usize;
                    for candidate in &output.discovered {
                        let key = normalize(candidate);
                        if self.config.enforce_scope {
                            if let Some(domain) = root.domain() {
                                if !in_scope(&key, domain) {
                                    debug!(method = %method, candidate = %candidate, "out of scope, dropped");
                                    continue;
                                }
                            }
                        }
                        if let Some(sub) = set.admit(job_id, candidate, Stage::Discovery, None) {
                            resolution.sub_targets.push(sub);
                            admitted += 1;
                        }
                    }
                    info!(method = %method, reported = output.discovered.len(), admitted, "discovery method finished");
                }
                Err(e) => {
                    warn!(method = %method, error = %e, "discovery method failed, skipping");
                    resolution.failures.push(KavachError::ResolverPartialFailure {
                        method,
                        reason: e.to_string(),
                    });
                }
            }
        }

        resolution
            .sub_targets
            .sort_by(|a, b| a.dedup_key.cmp(&b.dedup_key));
        resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kavach_common::EngineOutput;

    struct StaticMethod {
        id: &'static str,
        names: Vec<&'static str>,
    }

    #[async_trait]
    impl Engine for StaticMethod {
        fn id(&self) -> &str {
            self.id
        }

        fn capability(&self) -> Capability {
            Capability::Discover
        }

        async fn invoke(
            &self,
            _target: &SubTarget,
            _ctx: &InvokeContext,
        ) -> Result<EngineOutput, EngineError> {
            Ok(EngineOutput::discovered(
                self.names.iter().map(|s| s.to_string()).collect(),
            ))
        }
    }

    struct FailingMethod;

    #[async_trait]
    impl Engine for FailingMethod {
        fn id(&self) -> &str {
            "broken"
        }

        fn capability(&self) -> Capability {
            Capability::Discover
        }

        async fn invoke(
            &self,
            _target: &SubTarget,
            _ctx: &InvokeContext,
        ) -> Result<EngineOutput, EngineError> {
            Err(EngineError::ConnectionReset("peer went away".into()))
        }
    }

    fn domain_root() -> RootTarget {
        RootTarget::parse("example.com", false).unwrap()
    }

    #[test]
    fn normalize_strips_noise() {
        assert_eq!(normalize("HTTPS://WWW.Example.com/"), "www.example.com");
        assert_eq!(normalize("*.api.example.com."), "api.example.com");
        assert_eq!(normalize("http://user:pw@host.example.com:8080/a/#frag"), "host.example.com:8080/a");
        assert_eq!(normalize("  example.com//  "), "example.com");
    }

    #[test]
    fn classify_keys() {
        assert_eq!(classify("example.com"), SubTargetKind::Domain);
        assert_eq!(classify("10.0.0.1"), SubTargetKind::Ip);
        assert_eq!(classify("example.com:443"), SubTargetKind::Endpoint);
        assert_eq!(classify("example.com/login"), SubTargetKind::Url);
    }

    #[test]
    fn scope_check() {
        assert!(in_scope("api.example.com", "example.com"));
        assert!(in_scope("example.com:443", "example.com"));
        assert!(!in_scope("badexample.com", "example.com"));
        assert!(!in_scope("example.org", "example.com"));
    }

    #[test]
    fn set_rejects_duplicate_keys() {
        let job = Uuid::new_v4();
        let mut set = SubTargetSet::new();
        assert!(set.admit(job, "WWW.example.com", Stage::Discovery, None).is_some());
        assert!(set.admit(job, "https://www.example.com/", Stage::Discovery, None).is_none());
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn merges_and_dedups_across_methods() {
        let resolver = TargetResolver::new(DiscoveryConfig::default())
            .with_method(Arc::new(StaticMethod {
                id: "a",
                names: vec!["www.example.com", "API.example.com", "evil.org"],
            }))
            .with_method(Arc::new(StaticMethod {
                id: "b",
                names: vec!["https://api.example.com/", "*.mail.example.com"],
            }));
        let res = resolver.resolve(Uuid::new_v4(), &domain_root()).await;
        let keys: Vec<_> = res.sub_targets.iter().map(|s| s.dedup_key.as_str()).collect();
        assert_eq!(keys, vec!["api.example.com", "mail.example.com", "www.example.com"]);
        assert!(res.failures.is_empty());
    }

    #[tokio::test]
    async fn partial_failure_is_tolerated() {
        let resolver = TargetResolver::new(DiscoveryConfig::default())
            .with_method(Arc::new(FailingMethod))
            .with_method(Arc::new(StaticMethod {
                id: "ok",
                names: vec!["www.example.com"],
            }));
        let res = resolver.resolve(Uuid::new_v4(), &domain_root()).await;
        assert_eq!(res.sub_targets.len(), 1);
        assert_eq!(res.failures.len(), 1);
        assert!(matches!(
            &res.failures[0],
            KavachError::ResolverPartialFailure { method, .. } if method == "broken"
        ));
    }

    #[tokio::test]
    async fn all_methods_failing_yields_empty_set() {
        let resolver = TargetResolver::new(DiscoveryConfig::default()).with_method(Arc::new(FailingMethod));
        let res = resolver.resolve(Uuid::new_v4(), &domain_root()).await;
        assert!(res.sub_targets.is_empty());
        assert_eq!(res.failures.len(), 1);
    }

    #[tokio::test]
    async fn no_methods_means_root_only() {
        let resolver = TargetResolver::new(DiscoveryConfig::default());
        let res = resolver.resolve(Uuid::new_v4(), &domain_root()).await;
        assert_eq!(res.sub_targets.len(), 1);
        assert_eq!(res.sub_targets[0].dedup_key, "example.com");
    }

    #[tokio::test]
    async fn include_root_adds_root() {
        let config = DiscoveryConfig {
            include_root: true,
            ..DiscoveryConfig::default()
        };
        let resolver = TargetResolver::new(config).with_method(Arc::new(StaticMethod {
            id: "a",
            names: vec!["www.example.com"],
        }));
        let res = resolver.resolve(Uuid::new_v4(), &domain_root()).await;
        assert_eq!(res.sub_targets.len(), 2);
    }

    #[tokio::test]
    async fn address_roots_expand_without_methods() {
        let resolver = TargetResolver::new(DiscoveryConfig::default()).with_method(Arc::new(FailingMethod));
        let root = RootTarget::parse("192.168.1.1-192.168.1.3", false).unwrap();
        let res = resolver.resolve(Uuid::new_v4(), &root).await;
        assert_eq!(res.sub_targets.len(), 3);
        assert!(res.sub_targets.iter().all(|s| s.kind == SubTargetKind::Ip));
    }

    #[tokio::test]
    async fn method_filter_selects_subset() {
        let config = DiscoveryConfig {
            methods: vec!["b".into()],
            ..DiscoveryConfig::default()
        };
        let resolver = TargetResolver::new(config)
            .with_method(Arc::new(StaticMethod { id: "a", names: vec!["a.example.com"] }))
            .with_method(Arc::new(StaticMethod { id: "b", names: vec!["b.example.com"] }));
        let res = resolver.resolve(Uuid::new_v4(), &domain_root()).await;
        assert_eq!(res.sub_targets.len(), 1);
        assert_eq!(res.sub_targets[0].dedup_key, "b.example.com");
    }
}
