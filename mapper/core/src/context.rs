use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Mutex, RwLock},
    time::Duration,
};

use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::entity::Entity;

/// Opaque keyed secret store, `(service, key) -> value`.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    entries: HashMap<(String, String), String>,
}

impl Credentials {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: &str, key: &str, value: impl Into<String>) {
        self.entries
            .insert((service.to_owned(), key.to_owned()), value.into());
    }

    #[must_use]
    pub fn get(&self, service: &str, key: &str) -> Option<&str> {
        self.entries
            .get(&(service.to_owned(), key.to_owned()))
            .map(String::as_str)
    }
}

/// Deadlines for every class of outbound operation.
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    pub ping: Duration,
    pub probe_per_port: Duration,
    pub http: Duration,
    pub adapter: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ping: Duration::from_millis(500),
            probe_per_port: Duration::from_millis(1000),
            http: Duration::from_millis(3000),
            adapter: Duration::from_secs(5),
        }
    }
}

/// Shared state handed to every adapter invocation.
///
/// The entity universe lives here behind a lock; only the orchestrator
/// writes it, adapters read snapshots. The lock is never held across an
/// await point.
pub struct ScanContext {
    pub credentials: Credentials,
    pub timeouts: Timeouts,
    pub cancel: CancellationToken,
    http: Client,
    insecure_http: Client,
    swept: BTreeSet<String>,
    extra_routable: BTreeSet<String>,
    universe: RwLock<Vec<Entity>>,
    scanned_clusters: Mutex<HashSet<String>>,
}

impl ScanContext {
    /// Build the context and its shared HTTP clients.
    pub fn new(
        credentials: Credentials,
        timeouts: Timeouts,
        cancel: CancellationToken,
    ) -> reqwest::Result<Self> {
        let http = Client::builder().timeout(timeouts.http).build()?;
        let insecure_http = Client::builder()
            .timeout(timeouts.http)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            credentials,
            timeouts,
            cancel,
            http,
            insecure_http,
            swept: BTreeSet::new(),
            extra_routable: BTreeSet::new(),
            universe: RwLock::new(Vec::new()),
            scanned_clusters: Mutex::new(HashSet::new()),
        })
    }

    /// Strict-TLS client for API calls.
    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Client that tolerates the self-signed certificates most homelab
    /// platforms ship with.
    #[must_use]
    pub fn insecure_http(&self) -> &Client {
        &self.insecure_http
    }

    /// Record the sweep result. Called once, between sweep and orchestration.
    pub fn set_swept(&mut self, ips: impl IntoIterator<Item = String>) {
        self.swept = ips.into_iter().collect();
    }

    /// Was this address seen answering during the sweep?
    #[must_use]
    pub fn is_swept(&self, ip: &str) -> bool {
        self.swept.contains(ip)
    }

    #[must_use]
    pub fn swept(&self) -> &BTreeSet<String> {
        &self.swept
    }

    /// Allow an address the sweep never saw (operator hints) into the
    /// orchestration queue.
    pub fn mark_routable(&mut self, ip: impl Into<String>) {
        self.extra_routable.insert(ip.into());
    }

    /// Addresses the orchestrator may expand. Anything else (container
    /// bridge networks and the like) is skipped.
    #[must_use]
    pub fn is_routable(&self, ip: &str) -> bool {
        self.swept.contains(ip) || self.extra_routable.contains(ip)
    }

    /// Snapshot of the current universe for adapter-side correlation.
    #[must_use]
    pub fn universe_snapshot(&self) -> Vec<Entity> {
        self.universe.read().expect("universe lock poisoned").clone()
    }

    /// Stage entities into the universe outside the orchestrator loop.
    pub fn extend_universe(&self, entities: impl IntoIterator<Item = Entity>) {
        self.with_universe(|universe| universe.extend(entities));
    }

    pub(crate) fn with_universe<R>(&self, f: impl FnOnce(&mut Vec<Entity>) -> R) -> R {
        let mut universe = self.universe.write().expect("universe lock poisoned");
        f(&mut universe)
    }

    /// Claim a cluster id for this run. Returns `false` when another entry
    /// point already processed the same cluster.
    #[must_use]
    pub fn mark_cluster_scanned(&self, cluster_id: &str) -> bool {
        self.scanned_clusters
            .lock()
            .expect("cluster registry lock poisoned")
            .insert(cluster_id.to_owned())
    }
}
