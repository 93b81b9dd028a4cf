use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use labmap_core::{
    ActivationCriteria, Adapter, Entity, EntityKind, EntityPatch, EntityStatus, MetaValue,
    ScanContext, ScanOutcome, keys,
};
use reqwest::Client;
use serde::Deserialize;

use crate::error::BackendError;

/// One DHCP lease as published by the gateway.
#[derive(Clone, Debug, Deserialize)]
pub struct DhcpLease {
    pub ip: String,
    pub mac: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub is_access_point: bool,
    #[serde(default)]
    pub role: Option<String>,
}

/// Source of the gateway's DHCP lease table. The router UI scraping that
/// usually feeds this lives outside the engine; anything that can produce
/// lease tuples plugs in here.
#[async_trait]
pub trait LeaseSource: Send + Sync {
    async fn leases(&self) -> Result<Vec<DhcpLease>, BackendError>;
}

/// Identifies the LAN gateway and spreads its lease table over the
/// universe: MAC addresses, lease hostnames for unnamed entities, and
/// access points.
pub struct RouterAdapter {
    gateway_ip: String,
    source: Arc<dyn LeaseSource>,
}

impl RouterAdapter {
    #[must_use]
    pub fn new(gateway_ip: impl Into<String>, source: Arc<dyn LeaseSource>) -> Self {
        Self {
            gateway_ip: gateway_ip.into(),
            source,
        }
    }
}

#[async_trait]
impl Adapter for RouterAdapter {
    fn name(&self) -> &'static str {
        "Router"
    }

    fn priority(&self) -> u32 {
        5
    }

    fn activation(&self) -> ActivationCriteria {
        let gateway_ip = self.gateway_ip.clone();
        ActivationCriteria::predicate(Arc::new(move |entity: &Entity| entity.ip == gateway_ip))
    }

    async fn scan(&self, entity: &Entity, ctx: &ScanContext) -> ScanOutcome {
        let leases = match self.source.leases().await {
            Ok(leases) => leases,
            Err(err) => return ScanOutcome::failure(err.summary(), err.details()),
        };

        let mut lease_table: BTreeMap<String, String> = BTreeMap::new();
        for lease in &leases {
            let mut value = format!("{} {}", lease.mac, lease.hostname);
            if let Some(role) = &lease.role {
                value.push(' ');
                value.push_str(role);
            }
            lease_table.insert(lease.ip.clone(), value);
        }

        let own_name = leases
            .iter()
            .find(|lease| lease.ip == entity.ip)
            .map_or_else(|| "router".to_owned(), |lease| lease.hostname.clone());
        let patch = EntityPatch::promote(EntityKind::Router)
            .with_name(own_name)
            .with_status(EntityStatus::Reachable)
            .with_meta("dhcp_leases", MetaValue::Map(lease_table));

        let known = ctx.universe_snapshot();
        let mut updates = Vec::new();
        let mut discovered = Vec::new();

        for lease in &leases {
            if lease.ip == entity.ip {
                continue;
            }
            let existing = known.iter().find(|candidate| candidate.ip == lease.ip);

            match existing {
                Some(existing) => {
                    let mut update =
                        EntityPatch::default().with_meta(keys::MAC_ADDRESS, lease.mac.as_str());
                    if existing.has_generic_name() && !lease.hostname.is_empty() {
                        update = update.with_name(lease.hostname.clone());
                    }
                    if lease.is_access_point && existing.kind == EntityKind::Unknown {
                        update = update
                            .with_status(EntityStatus::Reachable)
                            .with_parent(entity.id.clone());
                        update.kind = Some(EntityKind::AccessPoint);
                    }
                    updates.push((existing.id.clone(), update));
                }
                None if lease.is_access_point => {
                    let mut child = Entity::child(
                        format!("ap-{}", lease.ip),
                        EntityKind::AccessPoint,
                        lease.hostname.clone(),
                    );
                    child.ip.clone_from(&lease.ip);
                    child.set_meta(keys::MAC_ADDRESS, lease.mac.as_str());
                    child.status = if ctx.is_swept(&lease.ip) {
                        EntityStatus::Reachable
                    } else {
                        EntityStatus::Unverified
                    };
                    discovered.push(child);
                }
                None => {}
            }
        }

        ScanOutcome::Success {
            patch,
            discovered,
            updates,
            child_hints: Vec::new(),
        }
    }
}

/// Lease source that fetches a JSON lease array from a fixed URL, for
/// gateways fronted by an export endpoint or an external scraper.
pub struct JsonLeaseSource {
    url: String,
    client: Client,
}

impl JsonLeaseSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl LeaseSource for JsonLeaseSource {
    async fn leases(&self) -> Result<Vec<DhcpLease>, BackendError> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(BackendError::Status {
                service: "router",
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use labmap_core::{Credentials, Timeouts};
    use tokio_util::sync::CancellationToken;

    use super::*;

    struct FixtureLeases {
        leases: Vec<DhcpLease>,
    }

    #[async_trait]
    impl LeaseSource for FixtureLeases {
        async fn leases(&self) -> Result<Vec<DhcpLease>, BackendError> {
            Ok(self.leases.clone())
        }
    }

    fn lease(ip: &str, mac: &str, hostname: &str) -> DhcpLease {
        DhcpLease {
            ip: ip.to_owned(),
            mac: mac.to_owned(),
            hostname: hostname.to_owned(),
            is_access_point: false,
            role: None,
        }
    }

    fn context(swept: &[&str]) -> ScanContext {
        let mut ctx = ScanContext::new(
            Credentials::new(),
            Timeouts::default(),
            CancellationToken::new(),
        )
        .expect("context");
        ctx.set_swept(swept.iter().map(|ip| (*ip).to_owned()));
        ctx
    }

    #[tokio::test]
    async fn gateway_predicate_only_matches_the_configured_address() {
        let adapter = RouterAdapter::new(
            "192.168.1.1",
            Arc::new(FixtureLeases { leases: Vec::new() }),
        );
        let criteria = adapter.activation();
        let predicate = criteria.predicate.expect("predicate");

        assert!(predicate(&Entity::unknown("192.168.1.1")));
        assert!(!predicate(&Entity::unknown("192.168.1.2")));
    }

    #[tokio::test]
    async fn leases_attach_macs_and_name_unnamed_entities() {
        let adapter = RouterAdapter::new(
            "192.168.1.1",
            Arc::new(FixtureLeases {
                leases: vec![
                    lease("192.168.1.1", "aa:aa:aa:aa:aa:aa", "gateway"),
                    lease("192.168.1.80", "bb:bb:bb:bb:bb:bb", "docker-vm"),
                ],
            }),
        );
        let ctx = context(&["192.168.1.1", "192.168.1.80"]);
        ctx.extend_universe([Entity::unknown("192.168.1.80")]);

        let ScanOutcome::Success { patch, updates, .. } =
            adapter.scan(&Entity::unknown("192.168.1.1"), &ctx).await
        else {
            panic!("expected success");
        };

        assert_eq!(patch.kind, Some(EntityKind::Router));
        assert_eq!(patch.name.as_deref(), Some("gateway"));
        assert_eq!(updates.len(), 1);
        let (target, update) = &updates[0];
        assert_eq!(target, "192.168.1.80");
        assert_eq!(
            update.metadata.get(keys::MAC_ADDRESS),
            Some(&MetaValue::Str("bb:bb:bb:bb:bb:bb".to_owned()))
        );
        assert_eq!(update.name.as_deref(), Some("docker-vm"));
    }

    #[tokio::test]
    async fn access_point_leases_emit_or_promote() {
        let mut ap_lease = lease("192.168.1.3", "cc:cc:cc:cc:cc:cc", "attic-ap");
        ap_lease.is_access_point = true;
        let mut unswept_ap = lease("192.168.1.4", "dd:dd:dd:dd:dd:dd", "garage-ap");
        unswept_ap.is_access_point = true;

        let adapter = RouterAdapter::new(
            "192.168.1.1",
            Arc::new(FixtureLeases {
                leases: vec![ap_lease, unswept_ap],
            }),
        );
        let ctx = context(&["192.168.1.1", "192.168.1.3"]);
        ctx.extend_universe([Entity::unknown("192.168.1.3")]);

        let ScanOutcome::Success { updates, discovered, .. } =
            adapter.scan(&Entity::unknown("192.168.1.1"), &ctx).await
        else {
            panic!("expected success");
        };

        // The swept entity is promoted in place.
        let (_, update) = updates
            .iter()
            .find(|(target, _)| target == "192.168.1.3")
            .expect("update");
        assert_eq!(update.kind, Some(EntityKind::AccessPoint));
        assert_eq!(update.parent_id.as_deref(), Some("192.168.1.1"));

        // The unswept one is emitted fresh under the router.
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].id, "ap-192.168.1.4");
        assert_eq!(discovered[0].status, EntityStatus::Unverified);
    }
}
