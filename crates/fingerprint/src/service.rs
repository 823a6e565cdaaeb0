//! Service identification from port numbers and banners
//!
//! Banner rules are tried in order; the first match wins. Port mappings are
//! the fallback when no banner is available or nothing matches.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Identified service on an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMatch {
    pub service: String,
    pub product: Option<String>,
    pub version: Option<String>,
    pub confidence: f32,
}

impl ServiceMatch {
    #[inline]
    #[must_use]
    pub fn new<S: Into<String>>(service: S) -> Self {
        Self {
            service: service.into(),
            product: None,
            version: None,
            confidence: 1.0,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_product<S: Into<String>>(mut self, product: S) -> Self {
        self.product = Some(product.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_version<S: Into<String>>(mut self, version: S) -> Self {
        self.version = Some(version.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// `product/version` when both are known.
    #[must_use]
    pub fn signature(&self) -> Option<String> {
        match (&self.product, &self.version) {
            (Some(p), Some(v)) => Some(format!("{p}/{v}")),
            _ => None,
        }
    }
}

const PORT_SERVICES: &[(u16, &str)] = &[
    (21, "ftp"),
    (22, "ssh"),
    (23, "telnet"),
    (25, "smtp"),
    (53, "domain"),
    (80, "http"),
    (110, "pop3"),
    (111, "rpcbind"),
    (135, "msrpc"),
    (139, "netbios-ssn"),
    (143, "imap"),
    (389, "ldap"),
    (443, "https"),
    (445, "microsoft-ds"),
    (465, "smtps"),
    (587, "submission"),
    (636, "ldaps"),
    (993, "imaps"),
    (995, "pop3s"),
    (1433, "mssql"),
    (1521, "oracle"),
    (2375, "docker"),
    (2376, "docker-tls"),
    (3000, "http-alt"),
    (3306, "mysql"),
    (3389, "rdp"),
    (5000, "http-alt"),
    (5432, "postgresql"),
    (5672, "amqp"),
    (5900, "vnc"),
    (6379, "redis"),
    (6443, "kubernetes"),
    (8000, "http-alt"),
    (8080, "http-proxy"),
    (8443, "https-alt"),
    (8888, "http-alt"),
    (9000, "http-alt"),
    (9090, "prometheus"),
    (9200, "elasticsearch"),
    (10250, "kubelet"),
    (11211, "memcached"),
    (27017, "mongodb"),
];

/// Ports that normally speak HTTP.
pub const WEB_PORTS: &[u16] = &[80, 443, 3000, 5000, 8000, 8080, 8443, 8888, 9000];

/// Ports that normally speak TLS from the first byte.
pub const TLS_PORTS: &[u16] = &[443, 465, 636, 993, 995, 2376, 6443, 8443, 10250];

/// Port-only guess, low confidence.
#[must_use]
pub fn detect_service_from_port(port: u16) -> Option<ServiceMatch> {
    PORT_SERVICES
        .binary_search_by_key(&port, |(p, _)| *p)
        .ok()
        .map(|idx| ServiceMatch::new(PORT_SERVICES[idx].1).with_confidence(0.5))
}

struct BannerRule {
    service: &'static str,
    pattern: Regex,
}

fn rule(service: &'static str, pattern: &str) -> BannerRule {
    BannerRule {
        service,
        // patterns are compile-time constants
        pattern: Regex::new(pattern).expect("invalid banner rule"),
    }
}

static BANNER_RULES: Lazy<Vec<BannerRule>> = Lazy::new(|| {
    vec![
        rule("ssh", r"(?i)^ssh-[\d.]+-(?P<product>[a-z]+)(?:[_-](?P<version>[\w.]+))?"),
        rule(
            "http",
            r"(?ims)^http/\d(?:\.\d)?\s.*?^server:[ \t]*(?P<product>[^/\s]+)(?:/(?P<version>[\w.]+))?",
        ),
        rule("http", r"(?i)^http/\d"),
        rule(
            "ftp",
            r"(?i)^220[ -].*?\b(?P<product>proftpd|vsftpd|pure-ftpd|filezilla)\b(?:[^\d\r\n]*(?P<version>\d+(?:\.\d+)+[a-z]?))?",
        ),
        rule(
            "smtp",
            r"(?i)^220[ -].*?\b(?P<product>postfix|sendmail|exim)\b(?:[^\d\r\n]*(?P<version>\d+(?:\.\d+)+))?",
        ),
        rule("smtp", r"(?i)^220[ -].*\be?smtp\b"),
        rule("ftp", r"(?i)^220[ -].*\bftp\b"),
        rule("pop3", r"(?i)^\+ok"),
        rule("imap", r"(?i)^\* ok(?:.*?\b(?P<product>dovecot|cyrus)\b)?"),
        rule("redis", r"(?i)redis_version:(?P<version>[\d.]+)"),
        rule("redis", r"(?i)^-(?:noauth|err)\b|^\+pong"),
        rule("mysql", r"(?i)(?P<version>\d+\.\d+\.\d+)-(?P<product>mariadb)"),
        rule("mysql", r"(?i)\b(?P<product>mysql)\b"),
        rule("vnc", r"^RFB (?P<version>\d{3}\.\d{3})"),
        rule(
            "elasticsearch",
            r#"(?s)"number"\s*:\s*"(?P<version>[\d.]+)".*"lucene_version""#,
        ),
        rule("telnet", r"(?i)\blogin:\s*$"),
    ]
});

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:v|version)?\s*(\d+\.\d+(?:\.\d+)?(?:\.\d+)?)").expect("invalid version regex"));

/// First version-looking token in `text`.
#[must_use]
pub fn extract_version_number(text: &str) -> Option<String> {
    VERSION_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Identify a service from its banner.
#[must_use]
pub fn detect_service_from_banner(banner: &str, port: u16) -> Option<ServiceMatch> {
    let banner = banner.trim_start();
    for rule in BANNER_RULES.iter() {
        let Some(caps) = rule.pattern.captures(banner) else {
            continue;
        };
        let service = match rule.service {
            "http" if crate::service::TLS_PORTS.contains(&port) => "https",
            other => other,
        };
        let mut svc = ServiceMatch::new(service).with_confidence(0.9);
        if let Some(p) = caps.name("product") {
            svc = svc.with_product(p.as_str().to_ascii_lowercase());
        }
        if let Some(v) = caps.name("version") {
            svc = svc.with_version(v.as_str());
        } else if svc.product.is_some() && rule.service != "http" {
            if let Some(v) = extract_version_number(banner) {
                svc = svc.with_version(v);
            }
        }
        return Some(svc);
    }
    None
}

/// Banner first, port mapping as fallback.
#[must_use]
pub fn detect_service(port: u16, banner: Option<&str>) -> Option<ServiceMatch> {
    banner
        .and_then(|b| detect_service_from_banner(b, port))
        .or_else(|| detect_service_from_port(port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_table_is_sorted() {
        assert!(PORT_SERVICES.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_port_detection() {
        assert_eq!(detect_service_from_port(80).unwrap().service, "http");
        assert_eq!(detect_service_from_port(443).unwrap().service, "https");
        assert_eq!(detect_service_from_port(22).unwrap().service, "ssh");
        assert_eq!(detect_service_from_port(3306).unwrap().service, "mysql");
        assert!(detect_service_from_port(1).is_none());
    }

    #[test]
    fn ssh_banner() {
        let svc = detect_service_from_banner("SSH-2.0-OpenSSH_7.4p1 Debian-10", 22).unwrap();
        assert_eq!(svc.service, "ssh");
        assert_eq!(svc.product.as_deref(), Some("openssh"));
        assert_eq!(svc.version.as_deref(), Some("7.4p1"));
        assert_eq!(svc.signature().as_deref(), Some("openssh/7.4p1"));
    }

    #[test]
    fn http_banner_with_server_header() {
        let banner = "HTTP/1.1 200 OK\r\nDate: today\r\nServer: nginx/1.14.0\r\n\r\n";
        let svc = detect_service_from_banner(banner, 80).unwrap();
        assert_eq!(svc.service, "http");
        assert_eq!(svc.product.as_deref(), Some("nginx"));
        assert_eq!(svc.version.as_deref(), Some("1.14.0"));
    }

    #[test]
    fn http_banner_without_server_header() {
        let svc = detect_service_from_banner("HTTP/1.0 404 Not Found\r\n\r\n", 8080).unwrap();
        assert_eq!(svc.service, "http");
        assert!(svc.product.is_none());
    }

    #[test]
    fn ftp_and_smtp_banners() {
        let ftp = detect_service_from_banner("220 ProFTPD 1.3.5 Server ready", 21).unwrap();
        assert_eq!(ftp.service, "ftp");
        assert_eq!(ftp.product.as_deref(), Some("proftpd"));
        assert_eq!(ftp.version.as_deref(), Some("1.3.5"));

        let smtp = detect_service_from_banner("220 mx.example.com ESMTP Exim 4.92 ready", 25).unwrap();
        assert_eq!(smtp.service, "smtp");
        assert_eq!(smtp.product.as_deref(), Some("exim"));
        assert_eq!(smtp.version.as_deref(), Some("4.92"));
    }

    #[test]
    fn test_combined_detection() {
        let service = detect_service(8080, Some("HTTP/1.1 200 OK"));
        assert_eq!(service.unwrap().service, "http");

        let service = detect_service(80, None).unwrap();
        assert_eq!(service.service, "http");
        assert!(service.confidence < 0.9);
    }
}
