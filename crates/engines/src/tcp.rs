//! TCP connect probe
//!
//! Serves two stages:
//! - live-host check: a host is alive if any probe port answers, including
//!   with a refusal
//! - endpoint enumeration: open ports become `host:port` endpoints, each
//!   with an `open_port` finding carrying the identified service

use async_trait::async_trait;
use serde_json::json;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, instrument};

use kavach_common::{
    Capability, Engine, EngineError, EngineOutput, FindingDraft, InvokeContext, Severity, Stage,
    SubTarget, SubTargetKind,
};
use kavach_fingerprint::{detect_service, ServiceMatch};

use crate::banner::BannerGrabber;

/// Ports tried by the live-host check.
pub const LIVE_PORTS: &[u16] = &[80, 443, 22, 21, 25, 3389, 8080];

/// Default enumeration port list.
pub const TOP_PORTS: &[u16] = &[
    21, 22, 23, 25, 53, 80, 110, 111, 135, 139, 143, 389, 443, 445, 465, 587, 636, 993, 995,
    1433, 1521, 2375, 3000, 3306, 3389, 5000, 5432, 5672, 5900, 6379, 6443, 8000, 8080, 8443,
    8888, 9000, 9090, 9200, 10250, 11211, 27017,
];

/// Services that should not face the internet unauthenticated.
const RISKY_SERVICES: &[&str] = &[
    "telnet",
    "docker",
    "redis",
    "memcached",
    "mongodb",
    "elasticsearch",
    "kubelet",
    "vnc",
];

#[derive(Debug)]
pub(crate) enum PortState {
    Open(TcpStream),
    Closed,
    Filtered,
}

/// Connect once; refusals are reported as `Closed`, silence as `Filtered`.
pub(crate) async fn connect(addr: SocketAddr, limit: Duration) -> Result<PortState, EngineError> {
    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(PortState::Open(stream)),
        Ok(Err(e)) => match e.kind() {
            ErrorKind::ConnectionRefused => Ok(PortState::Closed),
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Ok(PortState::Filtered),
            _ => match EngineError::from_io(&e, limit) {
                // host unreachable and friends
                EngineError::Fatal(_) => Ok(PortState::Filtered),
                other => Err(other),
            },
        },
        Err(_) => Ok(PortState::Filtered),
    }
}

/// Resolve a host name or literal to one address.
pub(crate) async fn resolve(host: &str, port: u16) -> Result<IpAddr, EngineError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| EngineError::Unavailable(format!("resolve {host}: {e}")))?;
    addrs
        .next()
        .map(|a| a.ip())
        .ok_or_else(|| EngineError::MalformedTarget(format!("{host} has no addresses")))
}

#[derive(Debug, Clone)]
struct OpenPort {
    port: u16,
    banner: Option<String>,
    service: Option<ServiceMatch>,
}

/// TCP connect engine for liveness and port enumeration.
pub struct TcpProbe {
    live_ports: Vec<u16>,
    ports: Vec<u16>,
    connect_timeout: Duration,
    banner_timeout: Duration,
    parallelism: usize,
}

impl TcpProbe {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_live_ports(mut self, ports: Vec<u16>) -> Self {
        self.live_ports = ports;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_banner_timeout(mut self, timeout: Duration) -> Self {
        self.banner_timeout = timeout;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    #[instrument(skip(self))]
    async fn check_alive(&self, host: &str) -> Result<EngineOutput, EngineError> {
        let ip = match resolve(host, 0).await {
            Ok(ip) => ip,
            Err(e) => {
                debug!(host, error = %e, "host does not resolve");
                return Ok(EngineOutput::alive(false));
            }
        };

        let mut probes = JoinSet::new();
        for &port in &self.live_ports {
            let limit = self.connect_timeout;
            probes.spawn(async move { connect(SocketAddr::new(ip, port), limit).await });
        }

        let mut last_error = None;
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(Ok(PortState::Open(_) | PortState::Closed)) => {
                    probes.abort_all();
                    return Ok(EngineOutput::alive(true));
                }
                Ok(Ok(PortState::Filtered)) => {}
                Ok(Err(e)) => last_error = Some(e),
                Err(e) => last_error = Some(EngineError::Fatal(e.to_string())),
            }
        }

        match last_error {
            Some(e) if e.is_retryable() => Err(e),
            _ => Ok(EngineOutput::alive(false)),
        }
    }

    #[instrument(skip(self))]
    async fn enumerate(&self, host: &str) -> Result<EngineOutput, EngineError> {
        let ip = resolve(host, 0).await?;
        let gate = Arc::new(Semaphore::new(self.parallelism));
        let host: Arc<str> = Arc::from(host);

        let mut probes = JoinSet::new();
        for &port in &self.ports {
            let gate = gate.clone();
            let host = host.clone();
            let (limit, banner_timeout) = (self.connect_timeout, self.banner_timeout);
            probes.spawn(async move {
                let _permit = gate.acquire_owned().await.ok()?;
                let PortState::Open(mut stream) = connect(SocketAddr::new(ip, port), limit).await.ok()? else {
                    return None;
                };
                let banner = BannerGrabber::new(banner_timeout)
                    .grab(&mut stream, &host, port)
                    .await;
                let service = detect_service(port, banner.as_deref());
                Some(OpenPort { port, banner, service })
            });
        }

        let mut open = Vec::new();
        while let Some(joined) = probes.join_next().await {
            if let Ok(Some(found)) = joined {
                open.push(found);
            }
        }
        open.sort_by_key(|p| p.port);
        debug!(host = %host, open = open.len(), "enumeration finished");

        let discovered = open.iter().map(|p| format!("{host}:{}", p.port)).collect();
        let findings = open.iter().map(|p| open_port_finding(&host, p)).collect();
        Ok(EngineOutput::discovered(discovered).with_findings(findings))
    }
}

fn open_port_finding(host: &str, open: &OpenPort) -> FindingDraft {
    let service = open.service.as_ref().map_or("unknown", |s| s.service.as_str());
    let severity = if RISKY_SERVICES.contains(&service) {
        Severity::Medium
    } else {
        Severity::Info
    };
    FindingDraft::new("open_port", format!("{service} open on {host}:{}", open.port))
        .with_signature(format!("{}/tcp", open.port))
        .with_severity(severity)
        .with_confidence(open.service.as_ref().map_or(0.5, |s| s.confidence))
        .with_evidence(json!({
            "port": open.port,
            "service": service,
            "product": open.service.as_ref().and_then(|s| s.product.clone()),
            "version": open.service.as_ref().and_then(|s| s.version.clone()),
            "banner": open.banner,
        }))
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            live_ports: LIVE_PORTS.to_vec(),
            ports: TOP_PORTS.to_vec(),
            connect_timeout: Duration::from_millis(800),
            banner_timeout: Duration::from_millis(600),
            parallelism: 64,
        }
    }
}

#[async_trait]
impl Engine for TcpProbe {
    fn id(&self) -> &str {
        "tcp-probe"
    }

    fn capability(&self) -> Capability {
        Capability::Enumerate
    }

    fn accepts(&self, target: &SubTarget) -> bool {
        target.kind != SubTargetKind::Endpoint
    }

    async fn invoke(
        &self,
        target: &SubTarget,
        ctx: &InvokeContext,
    ) -> Result<EngineOutput, EngineError> {
        match ctx.stage {
            Stage::LiveHostCheck => self.check_alive(target.host()).await,
            Stage::EndpointEnumeration => self.enumerate(target.host()).await,
            other => Err(EngineError::Fatal(format!("tcp-probe does not serve {other}"))),
        }
    }
}
