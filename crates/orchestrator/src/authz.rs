//! Submission authorization
//!
//! Checked once when a job is created, never again per stage.

use anyhow::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;

use kavach_common::{Authorizer, KavachError, KavachResult};
use kavach_target_resolver::RootTarget;

/// Accepts every submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn can_submit(&self, _user: &str, _target: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Accepts targets covered by an allowlist of exact hosts, domain suffixes
/// and networks.
///
/// Entry forms: `host.example.com` (exact), `*.example.com` (the domain and
/// everything below it), `10.0.0.0/8` (network).
#[derive(Debug, Clone, Default)]
pub struct ScopeAllowlist {
    hosts: HashSet<String>,
    suffixes: Vec<String>,
    networks: Vec<IpNet>,
}

impl ScopeAllowlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> KavachResult<Self> {
        entries
            .iter()
            .try_fold(Self::new(), |list, entry| list.with_entry(entry.as_ref()))
    }

    pub fn with_entry(self, entry: &str) -> KavachResult<Self> {
        let entry = entry.trim().to_ascii_lowercase();
        if entry.is_empty() {
            return Err(KavachError::Config("empty allowlist entry".into()));
        }
        if entry.contains('/') {
            let net = IpNet::from_str(&entry)
                .map_err(|e| KavachError::Config(format!("invalid network '{entry}': {e}")))?;
            return Ok(self.allow_network(net));
        }
        match entry.strip_prefix("*.") {
            Some(domain) => Ok(self.allow_domain(domain)),
            None => Ok(self.allow_host(&entry)),
        }
    }

    #[inline]
    #[must_use]
    pub fn allow_host(mut self, host: &str) -> Self {
        self.hosts.insert(host.trim_end_matches('.').to_ascii_lowercase());
        self
    }

    #[inline]
    #[must_use]
    pub fn allow_domain(mut self, domain: &str) -> Self {
        self.suffixes
            .push(domain.trim_matches('.').to_ascii_lowercase());
        self
    }

    #[inline]
    #[must_use]
    pub fn allow_network(mut self, net: IpNet) -> Self {
        self.networks.push(net);
        self
    }

    fn covers_host(&self, host: &str) -> bool {
        if let Ok(ip) = IpAddr::from_str(host) {
            return self.covers_ip(ip);
        }
        self.hosts.contains(host)
            || self
                .suffixes
                .iter()
                .any(|d| host == d || host.ends_with(&format!(".{d}")))
    }

    fn covers_ip(&self, ip: IpAddr) -> bool {
        self.hosts.contains(&ip.to_string()) || self.networks.iter().any(|net| net.contains(&ip))
    }

    /// Whether the whole of `target` falls inside the allowlist.
    #[must_use]
    pub fn covers(&self, target: &RootTarget) -> bool {
        match target {
            RootTarget::Domain(name) => self.covers_host(name),
            RootTarget::Url { host, .. } => self.covers_host(host),
            RootTarget::Ip(ip) => self.covers_ip(*ip),
            RootTarget::Cidr(net) => {
                let net = IpNet::V4(*net);
                self.networks.iter().any(|allowed| allowed.contains(&net))
            }
            RootTarget::Range(start, end) => self.networks.iter().any(|allowed| {
                allowed.contains(&IpAddr::V4(*start)) && allowed.contains(&IpAddr::V4(*end))
            }),
        }
    }
}

#[async_trait]
impl Authorizer for ScopeAllowlist {
    async fn can_submit(&self, _user: &str, target: &str) -> Result<bool> {
        match RootTarget::parse(target, true) {
            Ok(root) => Ok(self.covers(&root)),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist() -> ScopeAllowlist {
        ScopeAllowlist::from_entries(&["app.internal.test", "*.example.com", "10.0.0.0/16"]).unwrap()
    }

    #[tokio::test]
    async fn hosts_and_suffixes() {
        let list = allowlist();
        assert!(list.can_submit("alice", "app.internal.test").await.unwrap());
        assert!(!list.can_submit("alice", "other.internal.test").await.unwrap());
        assert!(list.can_submit("alice", "example.com").await.unwrap());
        assert!(list.can_submit("alice", "https://api.example.com/v1").await.unwrap());
        assert!(!list.can_submit("alice", "notexample.com").await.unwrap());
    }

    #[tokio::test]
    async fn networks() {
        let list = allowlist();
        assert!(list.can_submit("bob", "10.0.3.4").await.unwrap());
        assert!(list.can_submit("bob", "10.0.1.0/24").await.unwrap());
        assert!(list.can_submit("bob", "10.0.0.1-10.0.0.20").await.unwrap());
        assert!(!list.can_submit("bob", "10.0.0.0/8").await.unwrap());
        assert!(!list.can_submit("bob", "10.0.255.250-10.1.0.5").await.unwrap());
        assert!(!list.can_submit("bob", "192.168.1.1").await.unwrap());
    }

    #[test]
    fn rejects_bad_network_entries() {
        assert!(ScopeAllowlist::from_entries(&["10.0.0.0/99"]).is_err());
    }

    #[tokio::test]
    async fn allow_all() {
        assert!(AllowAll.can_submit("anyone", "anything").await.unwrap());
    }
}
