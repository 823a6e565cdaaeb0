//! Built-in engine adapters
//!
//! - `dns-bruteforce`, `crtsh`: discovery
//! - `tcp-probe`: live-host check and endpoint enumeration
//! - `banner-version`, `http-headers`: detection
//! - external tools of any capability

pub mod banner;
pub mod ct;
pub mod dns;
pub mod external;
pub mod http;
pub mod tcp;
pub mod version;

use std::sync::Arc;

use kavach_common::{Engine, EngineError};
use kavach_fingerprint::AdvisoryDb;

pub use banner::BannerGrabber;
pub use ct::CertTransparency;
pub use dns::DnsBruteforce;
pub use external::{ExternalTool, ExternalToolSpec, ToolOutput};
pub use http::HttpHeaderAudit;
pub use tcp::TcpProbe;
pub use version::BannerVersionDetector;

/// Engines that need nothing beyond the network: DNS wordlist discovery,
/// TCP probing, banner versions and header audit. `parallelism` bounds the
/// lookups or connects one unit keeps in flight.
pub fn default_engines(
    wordlist: Vec<String>,
    advisories: Arc<AdvisoryDb>,
    parallelism: usize,
) -> Result<Vec<Arc<dyn Engine>>, EngineError> {
    let engines: Vec<Arc<dyn Engine>> = vec![
        Arc::new(DnsBruteforce::new(wordlist).with_parallelism(parallelism)),
        Arc::new(TcpProbe::new().with_parallelism(parallelism)),
        Arc::new(BannerVersionDetector::new(advisories)),
        Arc::new(HttpHeaderAudit::new()?),
    ];
    Ok(engines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kavach_common::{Capability, Stage};

    #[tokio::test]
    async fn default_set_covers_every_engine_stage() {
        let engines = default_engines(Vec::new(), Arc::new(AdvisoryDb::default()), 8).unwrap();
        for stage in [
            Stage::Discovery,
            Stage::LiveHostCheck,
            Stage::EndpointEnumeration,
            Stage::VulnerabilityDetection,
        ] {
            assert!(engines.iter().any(|e| e.serves(stage)), "nothing serves {stage}");
        }
        let ids: Vec<_> = engines.iter().map(|e| e.id().to_string()).collect();
        assert_eq!(ids, vec!["dns-bruteforce", "tcp-probe", "banner-version", "http-headers"]);
        assert_eq!(engines[0].capability(), Capability::Discover);
    }
}
