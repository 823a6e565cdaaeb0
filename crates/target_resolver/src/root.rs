//! Root target parsing
//!
//! Accepted forms:
//! - domain: "example.com"
//! - URL: "https://example.com/app"
//! - single IPv4/IPv6 address: "1.2.3.4"
//! - CIDR: "192.168.1.0/24"
//! - range: "192.168.1.1-192.168.1.10"

use ipnet::Ipv4Net;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

use kavach_common::{KavachError, KavachResult, Stage, SubTarget, SubTargetKind};

use crate::normalize;

/// Expansion guard for CIDR and range roots.
pub const MAX_HOSTS: u128 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootTarget {
    Domain(String),
    Url { raw: String, host: String },
    Ip(IpAddr),
    Cidr(Ipv4Net),
    Range(Ipv4Addr, Ipv4Addr),
}

impl RootTarget {
    /// Parse and validate a root target. Oversized CIDRs and ranges are
    /// rejected unless `allow_large` is set.
    pub fn parse(raw: &str, allow_large: bool) -> KavachResult<Self> {
        let t = raw.trim();
        if t.is_empty() {
            return Err(KavachError::InvalidTarget("no target specified".into()));
        }

        if let Ok(net) = t.parse::<Ipv4Net>() {
            let prefix = net.prefix_len();
            let hosts = if prefix >= 32 { 1u128 } else { 1u128 << (32 - prefix) };
            if hosts > MAX_HOSTS && !allow_large {
                return Err(KavachError::InvalidTarget(format!(
                    "CIDR {net} expands to {hosts} hosts which exceeds the limit of {MAX_HOSTS}"
                )));
            }
            return Ok(RootTarget::Cidr(net));
        }

        if let Ok(ip) = t.parse::<IpAddr>() {
            return Ok(RootTarget::Ip(ip));
        }

        if let Some((start, end)) = t.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.trim().parse::<Ipv4Addr>(), end.trim().parse::<Ipv4Addr>()) {
                let (s, e) = (u32::from(start), u32::from(end));
                if s > e {
                    return Err(KavachError::InvalidTarget(format!("invalid range {t}: start > end")));
                }
                let hosts = u128::from(e - s) + 1;
                if hosts > MAX_HOSTS && !allow_large {
                    return Err(KavachError::InvalidTarget(format!(
                        "range {t} expands to {hosts} hosts which exceeds the limit of {MAX_HOSTS}"
                    )));
                }
                return Ok(RootTarget::Range(start, end));
            }
        }

        if t.contains("://") {
            let key = normalize(t);
            let host = key.split('/').next().unwrap_or_default();
            let host = host.rsplit_once(':').map_or(host, |(h, p)| {
                if p.chars().all(|c| c.is_ascii_digit()) { h } else { host }
            });
            if !is_valid_hostname(host) && host.parse::<IpAddr>().is_err() {
                return Err(KavachError::InvalidTarget(format!("invalid URL host in {t}")));
            }
            return Ok(RootTarget::Url {
                raw: t.to_string(),
                host: host.to_string(),
            });
        }

        let name = normalize(t);
        if !is_valid_hostname(&name) {
            return Err(KavachError::InvalidTarget(format!("invalid hostname {t}")));
        }
        Ok(RootTarget::Domain(name))
    }

    /// Normalized dedup key of the root itself.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            RootTarget::Domain(d) => d.clone(),
            RootTarget::Url { raw, .. } => normalize(raw),
            RootTarget::Ip(ip) => ip.to_string(),
            RootTarget::Cidr(net) => net.to_string(),
            RootTarget::Range(s, e) => format!("{s}-{e}"),
        }
    }

    /// Domain that discovered names must fall under.
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        match self {
            RootTarget::Domain(d) => Some(d),
            RootTarget::Url { host, .. } if host.parse::<IpAddr>().is_err() => Some(host),
            _ => None,
        }
    }

    /// Whether the root is address-shaped and needs no name discovery.
    #[must_use]
    pub fn is_address_form(&self) -> bool {
        matches!(self, RootTarget::Ip(_) | RootTarget::Cidr(_) | RootTarget::Range(..))
    }

    /// Host addresses covered by an address-shaped root.
    #[must_use]
    pub fn addresses(&self) -> Vec<IpAddr> {
        match self {
            RootTarget::Ip(ip) => vec![*ip],
            // ipnet yields every address for /31 and /32
            RootTarget::Cidr(net) => net.hosts().map(IpAddr::V4).collect(),
            RootTarget::Range(start, end) => (u32::from(*start)..=u32::from(*end))
                .map(|v| IpAddr::V4(Ipv4Addr::from(v)))
                .collect(),
            RootTarget::Domain(_) | RootTarget::Url { .. } => Vec::new(),
        }
    }

    /// The root as a sub-target, used as discovery-method input.
    #[must_use]
    pub fn as_sub_target(&self, job_id: Uuid) -> SubTarget {
        let (value, kind) = match self {
            RootTarget::Domain(d) => (d.clone(), SubTargetKind::Domain),
            RootTarget::Url { raw, .. } => (raw.clone(), SubTargetKind::Url),
            RootTarget::Ip(ip) => (ip.to_string(), SubTargetKind::Ip),
            other => (other.key(), SubTargetKind::Ip),
        };
        SubTarget::new(job_id, value, self.key(), kind, Stage::Discovery)
    }
}

impl fmt::Display for RootTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// RFC 1123-ish hostname check on an already-normalized name.
#[must_use]
pub fn is_valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}
