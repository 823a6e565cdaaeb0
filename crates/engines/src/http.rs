//! HTTP(S) security header audit

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::redirect::Policy;
use reqwest::Client;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, instrument};

use kavach_common::{
    Capability, Engine, EngineError, EngineOutput, FindingDraft, InvokeContext, Severity,
    SubTarget, SubTargetKind,
};
use kavach_fingerprint::{extract_version_number, TLS_PORTS, WEB_PORTS};

use crate::ct::classify;

/// Header names are lower-cased; repeated headers keep the last value.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpHead {
    pub status: u16,
    pub headers: HashMap<String, String>,
}

impl HttpHead {
    /// Headers that are not valid UTF-8 are dropped.
    #[must_use]
    pub fn from_headers(status: u16, headers: &HeaderMap) -> Self {
        let headers = headers
            .iter()
            .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.trim().to_string())))
            .collect();
        Self { status, headers }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Findings for one response head.
#[must_use]
pub fn audit(head: &HttpHead, url: &str) -> Vec<FindingDraft> {
    let mut findings = Vec::new();
    let csp = head.header("content-security-policy");

    let mut missing = |header: &str, severity: Severity| {
        findings.push(
            FindingDraft::new("missing_security_header", format!("{header} not set on {url}"))
                .with_signature(header)
                .with_severity(severity)
                .with_confidence(0.9)
                .with_evidence(json!({ "url": url, "status": head.status, "header": header })),
        );
    };

    if csp.is_none() {
        missing("content-security-policy", Severity::Low);
    }
    let frame_ancestors = csp.is_some_and(|v| v.contains("frame-ancestors"));
    if head.header("x-frame-options").is_none() && !frame_ancestors {
        missing("x-frame-options", Severity::Low);
    }
    if head.header("x-content-type-options").is_none() {
        missing("x-content-type-options", Severity::Low);
    }
    if url.starts_with("https://") && head.header("strict-transport-security").is_none() {
        missing("strict-transport-security", Severity::Medium);
    }

    if let Some(server) = head.header("server") {
        if extract_version_number(server).is_some() {
            findings.push(
                FindingDraft::new("server_version_disclosure", format!("{url} discloses {server}"))
                    .with_signature(server.to_ascii_lowercase())
                    .with_severity(Severity::Info)
                    .with_evidence(json!({ "url": url, "server": server })),
            );
        }
    }
    findings
}

/// Fetches the target URL, or `/` on a web endpoint, and reports missing
/// hardening headers. Redirects are not followed.
pub struct HttpHeaderAudit {
    client: Client,
}

impl HttpHeaderAudit {
    pub fn new() -> Result<Self, EngineError> {
        // scanned hosts routinely present self-signed certificates
        let client = Client::builder()
            .redirect(Policy::none())
            .danger_accept_invalid_certs(true)
            .user_agent(format!("kavach/{}", kavach_common::VERSION))
            .build()
            .map_err(|e| EngineError::Fatal(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    fn url(target: &SubTarget) -> Option<String> {
        match target.kind {
            SubTargetKind::Endpoint => {
                let port = target.port()?;
                if !WEB_PORTS.contains(&port) {
                    return None;
                }
                let scheme = if TLS_PORTS.contains(&port) { "https" } else { "http" };
                Some(format!("{scheme}://{}:{port}/", target.host()))
            }
            SubTargetKind::Url
                if target.value.starts_with("http://") || target.value.starts_with("https://") =>
            {
                Some(target.value.clone())
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Engine for HttpHeaderAudit {
    fn id(&self) -> &str {
        "http-headers"
    }

    fn capability(&self) -> Capability {
        Capability::Detect
    }

    fn accepts(&self, target: &SubTarget) -> bool {
        Self::url(target).is_some()
    }

    #[instrument(skip(self, ctx), fields(target = %target.value))]
    async fn invoke(
        &self,
        target: &SubTarget,
        ctx: &InvokeContext,
    ) -> Result<EngineOutput, EngineError> {
        let url = Self::url(target)
            .ok_or_else(|| EngineError::MalformedTarget(format!("{} is not a web target", target.value)))?;
        let response = self
            .client
            .get(&url)
            .timeout(ctx.timeout)
            .send()
            .await
            .map_err(|e| classify(&e, ctx.timeout, &url))?;

        let head = HttpHead::from_headers(response.status().as_u16(), response.headers());
        debug!(status = head.status, headers = head.headers.len(), "response head");
        Ok(EngineOutput::findings(audit(&head, &url)))
    }
}
