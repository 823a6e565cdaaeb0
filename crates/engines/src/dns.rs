//! Wordlist-driven subdomain discovery over DNS

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::TokioAsyncResolver;
use uuid::Uuid;

use kavach_common::{Capability, Engine, EngineError, EngineOutput, InvokeContext, SubTarget};

/// Common labels tried when no wordlist is configured.
pub const DEFAULT_WORDLIST: &[&str] = &[
    "www", "mail", "api", "dev", "staging", "test", "admin", "portal", "vpn", "remote", "app",
    "beta", "blog", "cdn", "docs", "git", "m", "ns1", "ns2", "smtp", "webmail", "shop", "status",
    "auth", "sso", "internal", "intranet", "jenkins", "grafana", "kibana",
];

enum Lookup {
    Hit(Vec<IpAddr>),
    Miss,
    TimedOut,
    Failed(String),
}

fn classify(result: Result<Vec<IpAddr>, ResolveError>) -> Lookup {
    match result {
        Ok(ips) if ips.is_empty() => Lookup::Miss,
        Ok(ips) => Lookup::Hit(ips),
        Err(e) => match e.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => Lookup::Miss,
            ResolveErrorKind::Timeout => Lookup::TimedOut,
            _ => Lookup::Failed(e.to_string()),
        },
    }
}

/// Drop names whose addresses are all served by a wildcard record.
#[must_use]
pub fn filter_wildcards(hits: Vec<(String, Vec<IpAddr>)>, wildcard: &HashSet<IpAddr>) -> Vec<String> {
    let mut names: Vec<String> = hits
        .into_iter()
        .filter(|(_, ips)| wildcard.is_empty() || ips.iter().any(|ip| !wildcard.contains(ip)))
        .map(|(name, _)| name)
        .collect();
    names.sort();
    names
}

/// Resolves `<label>.<domain>` for every wordlist label.
pub struct DnsBruteforce {
    resolver: TokioAsyncResolver,
    wordlist: Arc<Vec<String>>,
    parallelism: usize,
}

impl DnsBruteforce {
    /// Resolver using the public default upstreams.
    pub fn new(wordlist: Vec<String>) -> Self {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self::with_resolver(resolver, wordlist)
    }

    pub fn with_resolver(resolver: TokioAsyncResolver, wordlist: Vec<String>) -> Self {
        let wordlist = if wordlist.is_empty() {
            DEFAULT_WORDLIST.iter().map(|w| (*w).to_string()).collect()
        } else {
            wordlist
        };
        Self {
            resolver,
            wordlist: Arc::new(wordlist),
            parallelism: 32,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    async fn lookup(resolver: &TokioAsyncResolver, name: &str) -> Lookup {
        classify(
            resolver
                .lookup_ip(name)
                .await
                .map(|lookup| lookup.iter().collect()),
        )
    }

    /// Addresses returned for a random label, if the zone has a wildcard.
    async fn wildcard_addresses(&self, domain: &str) -> HashSet<IpAddr> {
        let probe = format!("kavach-{}.{domain}", Uuid::new_v4().simple());
        match Self::lookup(&self.resolver, &probe).await {
            Lookup::Hit(ips) => {
                debug!(domain, "wildcard DNS detected");
                ips.into_iter().collect()
            }
            _ => HashSet::new(),
        }
    }
}

#[async_trait]
impl Engine for DnsBruteforce {
    fn id(&self) -> &str {
        "dns-bruteforce"
    }

    fn capability(&self) -> Capability {
        Capability::Discover
    }

    #[instrument(skip(self, _ctx), fields(domain = %target.host()))]
    async fn invoke(
        &self,
        target: &SubTarget,
        _ctx: &InvokeContext,
    ) -> Result<EngineOutput, EngineError> {
        let domain = target.host().to_string();
        if domain.parse::<IpAddr>().is_ok() {
            return Err(EngineError::MalformedTarget(format!("{domain} is not a domain")));
        }

        let wildcard = self.wildcard_addresses(&domain).await;
        let gate = Arc::new(Semaphore::new(self.parallelism));
        let mut lookups = JoinSet::new();
        for label in self.wordlist.iter() {
            let name = format!("{label}.{domain}");
            let resolver = self.resolver.clone();
            let gate = gate.clone();
            lookups.spawn(async move {
                let _permit = gate.acquire_owned().await;
                let outcome = Self::lookup(&resolver, &name).await;
                (name, outcome)
            });
        }

        let (mut hits, mut timeouts, mut failures) = (Vec::new(), 0usize, 0usize);
        while let Some(joined) = lookups.join_next().await {
            match joined {
                Ok((name, Lookup::Hit(ips))) => hits.push((name, ips)),
                Ok((_, Lookup::Miss)) => {}
                Ok((_, Lookup::TimedOut)) => timeouts += 1,
                Ok((name, Lookup::Failed(reason))) => {
                    debug!(name, reason, "lookup failed");
                    failures += 1;
                }
                Err(e) => {
                    warn!(error = %e, "lookup task panicked");
                    failures += 1;
                }
            }
        }

        let total = self.wordlist.len();
        if hits.is_empty() && total > 0 && timeouts + failures == total {
            return Err(EngineError::Unavailable(format!(
                "all {total} lookups for {domain} failed ({timeouts} timed out)"
            )));
        }

        let names = filter_wildcards(hits, &wildcard);
        debug!(domain, found = names.len(), timeouts, failures, "bruteforce finished");
        Ok(EngineOutput::discovered(names))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn wildcard_hits_are_dropped() {
        let hits = vec![
            ("www.example.com".to_string(), vec![ip(1)]),
            ("junk.example.com".to_string(), vec![ip(9)]),
            ("api.example.com".to_string(), vec![ip(9), ip(2)]),
        ];
        let wildcard: HashSet<IpAddr> = [ip(9)].into_iter().collect();
        assert_eq!(
            filter_wildcards(hits, &wildcard),
            vec!["api.example.com".to_string(), "www.example.com".to_string()]
        );
    }

    #[test]
    fn no_wildcard_keeps_everything() {
        let hits = vec![("b.example.com".to_string(), vec![ip(1)]), ("a.example.com".to_string(), vec![ip(1)])];
        assert_eq!(filter_wildcards(hits, &HashSet::new()).len(), 2);
    }

    #[test]
    fn empty_answers_are_misses() {
        assert!(matches!(classify(Ok(Vec::new())), Lookup::Miss));
        assert!(matches!(classify(Ok(vec![ip(1)])), Lookup::Hit(_)));
    }

    #[tokio::test]
    async fn empty_wordlist_uses_defaults() {
        let engine = DnsBruteforce::new(Vec::new());
        assert_eq!(engine.wordlist.len(), DEFAULT_WORDLIST.len());
        assert_eq!(engine.capability(), Capability::Discover);
    }
}
