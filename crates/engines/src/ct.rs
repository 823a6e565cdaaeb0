//! Certificate-transparency discovery via crt.sh

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, instrument};

use kavach_common::{Capability, Engine, EngineError, EngineOutput, InvokeContext, SubTarget};

pub const CRT_SH: &str = "https://crt.sh";

#[derive(Debug, Deserialize)]
pub struct CtEntry {
    #[serde(default)]
    pub name_value: String,
    #[serde(default)]
    pub common_name: Option<String>,
}

/// Distinct names under `domain` listed on the certificates.
#[must_use]
pub fn names_from_entries(entries: &[CtEntry], domain: &str) -> Vec<String> {
    let suffix = format!(".{domain}");
    let names: BTreeSet<String> = entries
        .iter()
        .flat_map(|e| e.name_value.lines().chain(e.common_name.as_deref()))
        .map(|n| n.trim().trim_start_matches("*.").trim_end_matches('.').to_ascii_lowercase())
        .filter(|n| n == domain || n.ends_with(&suffix))
        .collect();
    names.into_iter().collect()
}

/// Map a client error onto the retry taxonomy; `source` names the peer.
pub(crate) fn classify(err: &reqwest::Error, timeout: Duration, source: &str) -> EngineError {
    if err.is_timeout() {
        EngineError::Timeout(timeout)
    } else if err.is_connect() || err.is_request() {
        EngineError::ConnectionReset(err.to_string())
    } else if err.is_decode() {
        EngineError::Fatal(format!("unreadable {source} response: {err}"))
    } else {
        EngineError::Unavailable(err.to_string())
    }
}

/// Queries certificate-transparency logs for names under the root domain.
pub struct CertTransparency {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl CertTransparency {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_endpoint(CRT_SH, Duration::from_secs(60))
    }

    pub fn with_endpoint(endpoint: &str, timeout: Duration) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("kavach/{}", kavach_common::VERSION))
            .build()
            .map_err(|e| EngineError::Fatal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl Engine for CertTransparency {
    fn id(&self) -> &str {
        "crtsh"
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
        let domain = target.host();
        let response = self
            .client
            .get(format!("{}/", self.endpoint))
            .query(&[("q", format!("%.{domain}")), ("output", "json".to_string())])
            .send()
            .await
            .map_err(|e| classify(&e, self.timeout, "crt.sh"))?;

        match response.status() {
            s if s.is_success() => {}
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(EngineError::Unavailable("crt.sh rate limited".into()))
            }
            s if s.is_server_error() => {
                return Err(EngineError::Unavailable(format!("crt.sh returned {s}")))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(EngineError::AuthRejected(format!("crt.sh returned {}", response.status())))
            }
            s => return Err(EngineError::Fatal(format!("crt.sh returned {s}"))),
        }

        let entries: Vec<CtEntry> = response.json().await.map_err(|e| classify(&e, self.timeout, "crt.sh"))?;
        let names = names_from_entries(&entries, domain);
        debug!(entries = entries.len(), names = names.len(), "crt.sh answered");
        Ok(EngineOutput::discovered(names))
    }
}
