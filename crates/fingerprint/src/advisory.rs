//! Outdated-software advisories
//!
//! A small table of products and the first version that is not affected.
//! Deployments can load their own table from JSON.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;

use kavach_common::Severity;

use crate::service::ServiceMatch;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advisory {
    /// Lower-case product name as reported by the fingerprinter.
    pub product: String,
    /// First unaffected version.
    pub fixed_in: String,
    pub severity: Severity,
    pub reference: String,
}

/// An advisory that applies to an observed service.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvisoryHit<'a> {
    pub advisory: &'a Advisory,
    pub product: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryDb {
    entries: Vec<Advisory>,
}

fn entry(product: &str, fixed_in: &str, severity: Severity, reference: &str) -> Advisory {
    Advisory {
        product: product.to_string(),
        fixed_in: fixed_in.to_string(),
        severity,
        reference: reference.to_string(),
    }
}

impl Default for AdvisoryDb {
    fn default() -> Self {
        Self {
            entries: vec![
                entry("openssh", "8.8", Severity::Medium, "CVE-2021-41617"),
                entry("nginx", "1.20.1", Severity::High, "CVE-2021-23017"),
                entry("apache", "2.4.52", Severity::High, "CVE-2021-44790"),
                entry("microsoft-iis", "10.0", Severity::Medium, "end-of-life IIS release"),
                entry("proftpd", "1.3.7", Severity::High, "CVE-2020-9273"),
                entry("vsftpd", "3.0.0", Severity::Medium, "end-of-life vsftpd release"),
                entry("exim", "4.94.2", Severity::Critical, "CVE-2020-28017"),
                entry("postfix", "3.5.0", Severity::Low, "end-of-life Postfix release"),
                entry("mariadb", "10.5.0", Severity::Medium, "end-of-life MariaDB release"),
                entry("redis", "6.2.7", Severity::High, "CVE-2022-24735"),
            ],
        }
    }
}

impl AdvisoryDb {
    pub fn from_entries(entries: Vec<Advisory>) -> Self {
        Self { entries }
    }

    /// Load a JSON array of advisories.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read advisory file {}", path.display()))?;
        let entries: Vec<Advisory> =
            serde_json::from_str(&raw).context("failed to parse advisory file")?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Advisory whose `fixed_in` is above the observed version, if any.
    pub fn check(&self, service: &ServiceMatch) -> Option<AdvisoryHit<'_>> {
        let product = service.product.as_deref()?;
        let version = service.version.as_deref()?;
        self.entries
            .iter()
            .filter(|a| a.product == product)
            .find(|a| compare_versions(version, &a.fixed_in) == Ordering::Less)
            .map(|advisory| AdvisoryHit {
                advisory,
                product: product.to_string(),
                version: version.to_string(),
            })
    }
}

fn components(version: &str) -> Vec<u64> {
    version
        .split(['.', '-', '_'])
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// Numeric dotted comparison; suffixes like `p1` or `b` are ignored.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a, b) = (components(a), components(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_compare() {
        assert_eq!(compare_versions("1.14.0", "1.20.1"), Ordering::Less);
        assert_eq!(compare_versions("8.2p1", "8.8"), Ordering::Less);
        assert_eq!(compare_versions("2.4.52", "2.4.52"), Ordering::Equal);
        assert_eq!(compare_versions("2.4", "2.4.0"), Ordering::Equal);
        assert_eq!(compare_versions("10.1", "9.9.9"), Ordering::Greater);
    }

    #[test]
    fn outdated_product_hits() {
        let db = AdvisoryDb::default();
        let svc = ServiceMatch::new("http").with_product("nginx").with_version("1.14.0");
        let hit = db.check(&svc).unwrap();
        assert_eq!(hit.advisory.reference, "CVE-2021-23017");
        assert_eq!(hit.advisory.severity, Severity::High);
    }

    #[test]
    fn current_or_unknown_products_miss() {
        let db = AdvisoryDb::default();
        let current = ServiceMatch::new("http").with_product("nginx").with_version("1.25.3");
        assert!(db.check(&current).is_none());
        let unknown = ServiceMatch::new("http").with_product("caddy").with_version("1.0");
        assert!(db.check(&unknown).is_none());
        let versionless = ServiceMatch::new("http").with_product("nginx");
        assert!(db.check(&versionless).is_none());
    }

    #[test]
    fn loads_custom_table() {
        let dir = std::env::temp_dir().join(format!("kavach-adv-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("advisories.json");
        std::fs::write(
            &path,
            r#"[{"product":"caddy","fixed_in":"2.0","severity":"low","reference":"internal"}]"#,
        )
        .unwrap();
        let db = AdvisoryDb::load(&path).unwrap();
        assert_eq!(db.len(), 1);
        let svc = ServiceMatch::new("http").with_product("caddy").with_version("1.9");
        assert!(db.check(&svc).is_some());
        std::fs::remove_dir_all(&dir).ok();
    }
}
