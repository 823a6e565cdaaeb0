//! Banner-based outdated software detection

use async_trait::async_trait;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use kavach_common::{
    Capability, Engine, EngineError, EngineOutput, FindingDraft, InvokeContext, SubTarget,
    SubTargetKind,
};
use kavach_fingerprint::{detect_service_from_banner, AdvisoryDb};

use crate::banner::BannerGrabber;
use crate::tcp::{connect, resolve, PortState};

/// Re-grabs the banner of an endpoint and matches the advertised product
/// version against the advisory table.
pub struct BannerVersionDetector {
    advisories: Arc<AdvisoryDb>,
    banner_timeout: Duration,
}

impl BannerVersionDetector {
    pub fn new(advisories: Arc<AdvisoryDb>) -> Self {
        Self {
            advisories,
            banner_timeout: Duration::from_millis(800),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_banner_timeout(mut self, timeout: Duration) -> Self {
        self.banner_timeout = timeout;
        self
    }

    fn assess(&self, banner: &str, port: u16) -> Option<FindingDraft> {
        let service = detect_service_from_banner(banner, port)?;
        let hit = self.advisories.check(&service)?;
        let signature = service.signature()?;
        Some(
            FindingDraft::new(
                "outdated_software",
                format!("{} {} is older than {}", hit.product, hit.version, hit.advisory.fixed_in),
            )
            .with_signature(signature)
            .with_severity(hit.advisory.severity)
            .with_confidence(service.confidence)
            .with_evidence(json!({
                "service": service.service,
                "product": hit.product,
                "version": hit.version,
                "fixed_in": hit.advisory.fixed_in,
                "reference": hit.advisory.reference,
                "banner": banner,
            })),
        )
    }
}

impl Default for BannerVersionDetector {
    fn default() -> Self {
        Self::new(Arc::new(AdvisoryDb::default()))
    }
}

#[async_trait]
impl Engine for BannerVersionDetector {
    fn id(&self) -> &str {
        "banner-version"
    }

    fn capability(&self) -> Capability {
        Capability::Detect
    }

    fn accepts(&self, target: &SubTarget) -> bool {
        target.kind == SubTargetKind::Endpoint && target.port().is_some()
    }

    #[instrument(skip(self, ctx), fields(target = %target.value))]
    async fn invoke(
        &self,
        target: &SubTarget,
        ctx: &InvokeContext,
    ) -> Result<EngineOutput, EngineError> {
        let port = target
            .port()
            .ok_or_else(|| EngineError::MalformedTarget(format!("{} has no port", target.value)))?;
        let ip = resolve(target.host(), port).await?;

        let mut stream = match connect(SocketAddr::new(ip, port), ctx.timeout).await? {
            PortState::Open(stream) => stream,
            PortState::Closed => {
                debug!("endpoint closed since enumeration");
                return Ok(EngineOutput::default());
            }
            PortState::Filtered => return Err(EngineError::Timeout(ctx.timeout)),
        };

        let banner = BannerGrabber::new(self.banner_timeout)
            .grab(&mut stream, target.host(), port)
            .await;
        let findings = banner
            .and_then(|b| self.assess(&b, port))
            .into_iter()
            .collect();
        Ok(EngineOutput::findings(findings))
    }
}
