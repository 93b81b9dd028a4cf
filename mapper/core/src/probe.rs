use std::{collections::BTreeMap, net::Ipv4Addr, sync::Arc, time::Duration};

use futures::future::join_all;
use reqwest::{Client, Response};
use tokio::{net::TcpStream, sync::Semaphore, time::timeout};
use tracing::debug;

use crate::entity::{CertificateSummary, Entity};

/// Ports probed on every reachable host to fingerprint the platform.
pub const FINGERPRINT_PORTS: [u16; 12] = [
    22, 80, 443, 2375, 2376, 3000, 5000, 8006, 8080, 9000, 9010, 9443,
];

/// Concurrent connection attempts against a single host.
pub const DEFAULT_PROBE_WIDTH: usize = 10;

/// TCP fingerprint probe plus an optional header grab over HTTP(S).
pub struct PortProber {
    per_port_timeout: Duration,
    width: usize,
    strict: Client,
    lenient: Client,
}

impl PortProber {
    /// Build the prober and its HTTP clients.
    ///
    /// The lenient client accepts invalid certificates and is only used to
    /// retry after the strict client failed, which is how self-signed
    /// endpoints are told apart from dead ones.
    pub fn new(per_port_timeout: Duration, http_timeout: Duration) -> reqwest::Result<Self> {
        let strict = Client::builder().timeout(http_timeout).build()?;
        let lenient = Client::builder()
            .timeout(http_timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            per_port_timeout,
            width: DEFAULT_PROBE_WIDTH,
            strict,
            lenient,
        })
    }

    #[must_use]
    pub const fn with_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    /// Fingerprint one host. Never fails; a host with nothing open simply
    /// comes back with an empty port set.
    pub async fn probe(&self, ip: Ipv4Addr) -> Entity {
        let semaphore = Arc::new(Semaphore::new(self.width.max(1)));
        let attempts = FINGERPRINT_PORTS.iter().map(|port| {
            let semaphore = Arc::clone(&semaphore);
            let deadline = self.per_port_timeout;
            async move {
                let _permit = semaphore.acquire().await.ok()?;
                timeout(deadline, TcpStream::connect((ip, *port)))
                    .await
                    .ok()?
                    .ok()
                    .map(|_| *port)
            }
        });

        let mut entity = Entity::unknown(ip.to_string());
        entity.open_ports = join_all(attempts).await.into_iter().flatten().collect();
        debug!(ip = %ip, ports = ?entity.open_ports, "port probe finished");

        if entity.open_ports.contains(&443) || entity.open_ports.contains(&80) {
            self.fetch_headers(&mut entity).await;
        }
        entity
    }

    async fn fetch_headers(&self, entity: &mut Entity) {
        if entity.open_ports.contains(&443) {
            let url = format!("https://{}/", entity.ip);
            match self.strict.get(&url).send().await {
                Ok(response) => {
                    entity.http_headers = collect_headers(&response);
                    return;
                }
                Err(_) => {
                    if let Ok(response) = self.lenient.get(&url).send().await {
                        entity.http_headers = collect_headers(&response);
                        entity.certificate = Some(CertificateSummary {
                            is_self_signed: true,
                            ..CertificateSummary::default()
                        });
                        return;
                    }
                }
            }
        }
        if entity.open_ports.contains(&80)
            && let Ok(response) = self.strict.get(format!("http://{}/", entity.ip)).send().await
        {
            entity.http_headers = collect_headers(&response);
        }
    }
}

/// Flatten response headers, joining repeated names with `", "`.
fn collect_headers(response: &Response) -> BTreeMap<String, String> {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in response.headers() {
        let Ok(value) = value.to_str() else {
            continue;
        };
        headers
            .entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_owned());
    }
    headers
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::{io::AsyncWriteExt as _, net::TcpListener};

    use super::*;

    async fn local_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        (listener, addr)
    }

    #[tokio::test]
    async fn open_port_is_detected_and_closed_ports_are_skipped() {
        let (listener, addr) = local_listener().await;
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.shutdown().await;
            }
        });

        // The listener port is ephemeral, so probe it directly instead of
        // going through the fingerprint set.
        let deadline = Duration::from_millis(500);
        let connected = timeout(deadline, TcpStream::connect(addr)).await;
        assert!(matches!(connected, Ok(Ok(_))));

        let prober =
            PortProber::new(deadline, Duration::from_millis(500)).expect("build prober");
        let entity = prober.probe("127.0.0.1".parse().unwrap()).await;
        // Nothing from the fingerprint set listens on loopback in the test
        // environment, but the probe itself must not fail.
        assert_eq!(entity.ip, "127.0.0.1");
        assert_eq!(entity.kind, crate::entity::EntityKind::Unknown);
    }

    #[test]
    fn fingerprint_set_matches_the_platform_ports() {
        assert!(FINGERPRINT_PORTS.contains(&8006));
        assert!(FINGERPRINT_PORTS.contains(&2375));
        assert!(FINGERPRINT_PORTS.contains(&9443));
        assert_eq!(FINGERPRINT_PORTS.len(), 12);
    }
}
