use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::future::join_all;
use ipnet::Ipv4Net;
use tokio::{net::TcpStream, sync::Semaphore, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Hosts enumerated per subnet before the expansion is cut off.
pub const DEFAULT_SUBNET_CAP: usize = 254;

/// Concurrent reachability probes across all subnets.
pub const DEFAULT_SWEEP_WIDTH: usize = 50;

const CANARY_PORTS: &[u16] = &[80, 443, 22];

#[derive(Debug, thiserror::Error)]
/// Subnet expansion failures. These abort the run before any probe is sent.
pub enum SweepError {
    #[error("invalid CIDR {cidr:?}: {source}")]
    InvalidCidr {
        cidr: String,
        #[source]
        source: ipnet::AddrParseError,
    },
}

/// Reachability probe for a single host.
///
/// The default implementation answers without raw sockets; deployments with
/// `CAP_NET_RAW` can plug a true ICMP pinger instead.
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn is_reachable(&self, ip: Ipv4Addr, deadline: Duration) -> bool;
}

/// TCP-connect reachability probe.
///
/// A completed handshake or an active refusal both prove a live host; only
/// silence until the deadline counts as unreachable.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpPinger;

#[async_trait]
impl Pinger for TcpPinger {
    async fn is_reachable(&self, ip: Ipv4Addr, deadline: Duration) -> bool {
        let attempts = CANARY_PORTS
            .iter()
            .map(|port| probe_canary(ip, *port, deadline));
        join_all(attempts).await.into_iter().any(|alive| alive)
    }
}

async fn probe_canary(ip: Ipv4Addr, port: u16, deadline: Duration) -> bool {
    match timeout(deadline, TcpStream::connect((ip, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(err)) => err.kind() == std::io::ErrorKind::ConnectionRefused,
        Err(_) => false,
    }
}

/// Expand a CIDR into its host addresses, excluding network and broadcast.
///
/// A `/32` yields the single base address. Expansion stops at `cap` hosts so
/// a wide prefix cannot blow up the sweep.
pub fn expand_cidr(cidr: &str, cap: usize) -> Result<Vec<Ipv4Addr>, SweepError> {
    let net: Ipv4Net = cidr.trim().parse().map_err(|source| SweepError::InvalidCidr {
        cidr: cidr.to_owned(),
        source,
    })?;
    Ok(net.hosts().take(cap).collect())
}

/// Concurrent reachability sweep over a list of subnets.
pub struct HostSweeper {
    pinger: Arc<dyn Pinger>,
    width: usize,
    subnet_cap: usize,
    ping_timeout: Duration,
}

impl HostSweeper {
    #[must_use]
    pub fn new(pinger: Arc<dyn Pinger>, ping_timeout: Duration) -> Self {
        Self {
            pinger,
            width: DEFAULT_SWEEP_WIDTH,
            subnet_cap: DEFAULT_SUBNET_CAP,
            ping_timeout,
        }
    }

    #[must_use]
    pub const fn with_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    #[must_use]
    pub const fn with_subnet_cap(mut self, cap: usize) -> Self {
        self.subnet_cap = cap;
        self
    }

    /// Sweep every subnet and return the reachable addresses.
    ///
    /// Unreachable hosts are silently dropped. CIDR parse failures abort
    /// before any probe runs. Cancellation stops issuing new probes; hosts
    /// already answered stay in the result.
    pub async fn sweep(
        &self,
        subnets: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Ipv4Addr>, SweepError> {
        let mut candidates = Vec::new();
        for cidr in subnets {
            let hosts = expand_cidr(cidr, self.subnet_cap)?;
            info!(subnet = %cidr, hosts = hosts.len(), "expanded subnet");
            candidates.extend(hosts);
        }

        let semaphore = Arc::new(Semaphore::new(self.width.max(1)));
        let probes = candidates.into_iter().map(|ip| {
            let semaphore = Arc::clone(&semaphore);
            let pinger = Arc::clone(&self.pinger);
            let deadline = self.ping_timeout;
            async move {
                if cancel.is_cancelled() {
                    return None;
                }
                let _permit = semaphore.acquire().await.ok()?;
                pinger.is_reachable(ip, deadline).await.then_some(ip)
            }
        });

        let mut reachable: Vec<Ipv4Addr> = join_all(probes).await.into_iter().flatten().collect();
        reachable.sort_unstable();
        reachable.dedup();
        debug!(count = reachable.len(), "sweep finished");
        Ok(reachable)
    }
}
