//! Fingerprint Engine - service identification and version advisories
//!
//! - Port-based service identification
//! - Banner-based service and version detection
//! - Outdated-software advisory matching

mod advisory;
mod service;

pub use advisory::{compare_versions, Advisory, AdvisoryDb, AdvisoryHit};
pub use service::{
    detect_service, detect_service_from_banner, detect_service_from_port, extract_version_number,
    ServiceMatch, TLS_PORTS, WEB_PORTS,
};
