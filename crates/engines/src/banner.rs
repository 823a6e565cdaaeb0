//! Banner grabbing

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, instrument};

use kavach_fingerprint::{TLS_PORTS, WEB_PORTS};

pub struct BannerGrabber {
    timeout: Duration,
    max_bytes: usize,
}

impl BannerGrabber {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_bytes: 1024,
        }
    }

    /// Read whatever the service announces; if it stays silent, send a
    /// port-appropriate probe and read the reply. TLS ports are not probed.
    #[instrument(skip(self, stream))]
    pub async fn grab<S>(&self, stream: &mut S, host: &str, port: u16) -> Option<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.max_bytes];
        let half = self.timeout / 2;

        if let Ok(Ok(n)) = timeout(half, stream.read(&mut buf)).await {
            if n > 0 {
                debug!(bytes = n, "passive banner");
                return Some(clean(&buf[..n]));
            }
        }

        if TLS_PORTS.contains(&port) {
            return None;
        }

        let probe = probe_for(host, port);
        if timeout(half, stream.write_all(probe.as_bytes())).await.map_or(true, |r| r.is_err()) {
            debug!("probe write failed");
            return None;
        }

        match timeout(half, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => {
                debug!(bytes = n, "active banner");
                Some(clean(&buf[..n]))
            }
            _ => None,
        }
    }
}

fn probe_for(host: &str, port: u16) -> String {
    if WEB_PORTS.contains(&port) {
        format!("HEAD / HTTP/1.0\r\nHost: {host}\r\nUser-Agent: kavach\r\n\r\n")
    } else {
        "\r\n".to_string()
    }
}

fn clean(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\r' | '\n' | '\t'))
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passive_banner() {
        let (mut client, mut server) = tokio::io::duplex(256);
        server.write_all(b"SSH-2.0-OpenSSH_7.4\r\n").await.unwrap();
        let grabber = BannerGrabber::new(Duration::from_millis(200));
        let banner = grabber.grab(&mut client, "host", 22).await;
        assert_eq!(banner.as_deref(), Some("SSH-2.0-OpenSSH_7.4"));
    }

    #[tokio::test]
    async fn active_http_probe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            server
                .write_all(b"HTTP/1.1 200 OK\r\nServer: nginx/1.14.0\r\n\r\n")
                .await
                .unwrap();
            request
        });
        let grabber = BannerGrabber::new(Duration::from_millis(200));
        let banner = grabber.grab(&mut client, "app.example.com", 80).await.unwrap();
        assert!(banner.contains("nginx/1.14.0"));
        let request = responder.await.unwrap();
        assert!(request.contains("Host: app.example.com"));
    }

    #[tokio::test]
    async fn silent_tls_port_yields_nothing() {
        let (mut client, _server) = tokio::io::duplex(64);
        let grabber = BannerGrabber::new(Duration::from_millis(50));
        assert!(grabber.grab(&mut client, "host", 443).await.is_none());
    }
}
