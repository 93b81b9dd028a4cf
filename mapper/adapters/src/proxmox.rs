use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use labmap_core::{
    ActivationCriteria, Adapter, Credentials, Entity, EntityKind, EntityPatch, EntityStatus,
    ScanContext, ScanOutcome, keys,
};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::BackendError;

/// Cluster topology as reported by the node that answered.
#[derive(Clone, Debug, Default)]
pub struct ClusterView {
    /// Set when the node is part of a named cluster.
    pub cluster_name: Option<String>,
    pub nodes: Vec<NodeView>,
}

#[derive(Clone, Debug)]
pub struct NodeView {
    pub name: String,
    pub ip: String,
    pub online: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestKind {
    Vm,
    Lxc,
}

#[derive(Clone, Debug)]
pub struct GuestView {
    pub vmid: u32,
    pub name: String,
    pub kind: GuestKind,
    pub running: bool,
}

/// Access to the Proxmox VE API. The wire format stays behind this trait;
/// tests drive the adapter with canned views.
#[async_trait]
pub trait ProxmoxApi: Send + Sync {
    async fn cluster_view(
        &self,
        host: &str,
        creds: &Credentials,
    ) -> Result<ClusterView, BackendError>;

    async fn guests(
        &self,
        host: &str,
        node: &str,
        creds: &Credentials,
    ) -> Result<Vec<GuestView>, BackendError>;

    /// Live guest address via the QEMU agent, best effort.
    async fn guest_agent_ip(
        &self,
        host: &str,
        node: &str,
        vmid: u32,
        kind: GuestKind,
        creds: &Credentials,
    ) -> Result<Option<String>, BackendError>;

    /// Address declared statically in the guest config (`ipconfigN`).
    async fn guest_config_ip(
        &self,
        host: &str,
        node: &str,
        vmid: u32,
        kind: GuestKind,
        creds: &Credentials,
    ) -> Result<Option<String>, BackendError>;
}

/// Expands a Proxmox node or cluster into nodes, VMs and LXC containers.
pub struct ProxmoxAdapter {
    api: Arc<dyn ProxmoxApi>,
}

impl ProxmoxAdapter {
    #[must_use]
    pub fn new(api: Arc<dyn ProxmoxApi>) -> Self {
        Self { api }
    }

    async fn guest_children(
        &self,
        api_host: &str,
        node_name: &str,
        parent_id: Option<&str>,
        ctx: &ScanContext,
    ) -> Result<Vec<Entity>, BackendError> {
        let mut children = Vec::new();
        for guest in self.api.guests(api_host, node_name, &ctx.credentials).await? {
            let id = match guest.kind {
                GuestKind::Vm => format!("proxmox-vm-{node_name}-{}", guest.vmid),
                GuestKind::Lxc => format!("proxmox-lxc-{node_name}-{}", guest.vmid),
            };
            let kind = match guest.kind {
                GuestKind::Vm => EntityKind::Vm,
                GuestKind::Lxc => EntityKind::Lxc,
            };
            let mut child = Entity::child(id, kind, guest.name.clone());
            child.parent_id = parent_id.map(str::to_owned);
            child.set_meta(keys::PROXMOX_VMID, i64::from(guest.vmid));
            child.set_meta(keys::PROXMOX_NODE, node_name);

            let agent_ip = self
                .api
                .guest_agent_ip(api_host, node_name, guest.vmid, guest.kind, &ctx.credentials)
                .await
                .unwrap_or_default();
            let config_ip = self
                .api
                .guest_config_ip(api_host, node_name, guest.vmid, guest.kind, &ctx.credentials)
                .await
                .unwrap_or_default();

            match (agent_ip, config_ip) {
                (Some(live), declared) => {
                    child.ip.clone_from(&live);
                    if let Some(declared) = declared
                        && declared != live
                    {
                        child.set_meta(keys::API_REPORTED_IP, declared);
                    }
                }
                (None, Some(declared)) => {
                    // Only the config knows the address; let correlation
                    // adopt it once the swept set has been consulted.
                    child.set_meta(keys::API_REPORTED_IP, declared);
                }
                (None, None) => {}
            }

            child.status = if !guest.running {
                EntityStatus::Unreachable
            } else if !child.ip.is_empty() && ctx.is_swept(&child.ip) {
                EntityStatus::Reachable
            } else {
                EntityStatus::Unverified
            };
            children.push(child);
        }
        Ok(children)
    }
}

#[async_trait]
impl Adapter for ProxmoxAdapter {
    fn name(&self) -> &'static str {
        "Proxmox"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn activation(&self) -> ActivationCriteria {
        ActivationCriteria::ports(&[8006])
    }

    async fn scan(&self, entity: &Entity, ctx: &ScanContext) -> ScanOutcome {
        let view = match self.api.cluster_view(&entity.ip, &ctx.credentials).await {
            Ok(view) => view,
            Err(err) => return ScanOutcome::failure(err.summary(), err.details()),
        };

        let Some(cluster_name) = view.cluster_name else {
            // Standalone node: promote in place and hang the guests off it.
            let node_name = view
                .nodes
                .first()
                .map_or_else(|| entity.ip.clone(), |node| node.name.clone());
            let patch = EntityPatch::promote(EntityKind::ProxmoxNode)
                .with_name(node_name.clone())
                .with_status(EntityStatus::Reachable);
            let discovered = match self.guest_children(&entity.ip, &node_name, None, ctx).await {
                Ok(children) => children,
                Err(err) => return ScanOutcome::failure(err.summary(), err.details()),
            };
            return ScanOutcome::Success {
                patch,
                discovered,
                updates: Vec::new(),
                child_hints: vec!["Docker".to_owned()],
            };
        };

        let cluster_id = format!("proxmox-cluster-{cluster_name}");
        if !ctx.mark_cluster_scanned(&cluster_id) {
            debug!(cluster = %cluster_id, entry = %entity.ip, "cluster already processed via another entry point");
            // A second entry point is still Proxmox; a node child re-entering
            // here keeps its identity.
            let patch = if entity.kind == EntityKind::Unknown {
                EntityPatch::promote(EntityKind::Proxmox)
            } else {
                EntityPatch::default()
            };
            return ScanOutcome::success(patch);
        }

        // The answering host becomes the cluster itself: a logical entity
        // with a rewritten id and no address of its own.
        let patch = EntityPatch::promote(EntityKind::ProxmoxCluster)
            .with_id(cluster_id.clone())
            .with_ip("")
            .with_name(cluster_name)
            .with_parent("")
            .with_status(EntityStatus::Reachable);

        let mut discovered = Vec::new();
        for node in &view.nodes {
            let node_id = format!("proxmox-node-{}", node.name);
            let mut child = Entity::child(node_id.clone(), EntityKind::ProxmoxNode, node.name.clone());
            child.ip.clone_from(&node.ip);
            child.parent_id = Some(cluster_id.clone());
            child.status = if node.online {
                EntityStatus::Reachable
            } else {
                EntityStatus::Unreachable
            };
            child.set_meta(keys::PROXMOX_NODE, node.name.as_str());
            discovered.push(child);

            if node.online {
                match self
                    .guest_children(&entity.ip, &node.name, Some(&node_id), ctx)
                    .await
                {
                    Ok(children) => discovered.extend(children),
                    Err(err) => {
                        debug!(node = %node.name, error = %err, "guest enumeration failed");
                    }
                }
            }
        }

        ScanOutcome::Success {
            patch,
            discovered,
            updates: Vec::new(),
            child_hints: vec!["Docker".to_owned()],
        }
    }
}

// Proxmox VE REST backend. Token auth only; queries go through the node
// that answered the probe.

#[derive(Deserialize)]
struct PveList<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct PveValue<T> {
    data: T,
}

#[derive(Deserialize)]
struct PveClusterStatusEntry {
    #[serde(rename = "type")]
    entry_type: String,
    name: Option<String>,
    ip: Option<String>,
    online: Option<u8>,
}

#[derive(Deserialize)]
struct PveGuestEntry {
    vmid: u32,
    name: Option<String>,
    status: Option<String>,
}

#[derive(Deserialize)]
struct PveAgentInterfaces {
    result: Option<Vec<PveAgentInterface>>,
}

#[derive(Deserialize)]
struct PveAgentInterface {
    #[serde(rename = "ip-addresses", default)]
    ip_addresses: Vec<PveAgentAddress>,
}

#[derive(Deserialize)]
struct PveAgentAddress {
    #[serde(rename = "ip-address")]
    ip_address: String,
    #[serde(rename = "ip-address-type")]
    ip_address_type: String,
}

#[derive(Deserialize)]
struct PveGuestConfig {
    ipconfig0: Option<String>,
    net0: Option<String>,
}

/// HTTPS client for the Proxmox VE API on port 8006.
pub struct ProxmoxHttpApi {
    client: Client,
}

impl ProxmoxHttpApi {
    const SERVICE: &'static str = "proxmox";

    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client })
    }

    fn token(creds: &Credentials) -> Result<String, BackendError> {
        creds
            .get(Self::SERVICE, "api_token")
            .map(|token| format!("PVEAPIToken={token}"))
            .ok_or(BackendError::MissingCredentials {
                service: "proxmox",
                key: "api_token",
            })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        host: &str,
        path: &str,
        creds: &Credentials,
    ) -> Result<T, BackendError> {
        let response = self
            .client
            .get(format!("https://{host}:8006/api2/json{path}"))
            .header("Authorization", Self::token(creds)?)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status {
                service: "proxmox",
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    fn guest_segment(kind: GuestKind) -> &'static str {
        match kind {
            GuestKind::Vm => "qemu",
            GuestKind::Lxc => "lxc",
        }
    }
}

/// First address in `ip=192.168.1.80/24,gw=...` or a `net0`-style string.
fn parse_declared_ip(raw: &str) -> Option<String> {
    raw.split(',')
        .find_map(|part| part.trim().strip_prefix("ip="))
        .filter(|value| !value.starts_with("dhcp"))
        .map(|value| value.split('/').next().unwrap_or(value).to_owned())
}

#[async_trait]
impl ProxmoxApi for ProxmoxHttpApi {
    async fn cluster_view(
        &self,
        host: &str,
        creds: &Credentials,
    ) -> Result<ClusterView, BackendError> {
        let status: PveList<PveClusterStatusEntry> =
            self.get_json(host, "/cluster/status", creds).await?;

        let mut view = ClusterView::default();
        for entry in status.data {
            match entry.entry_type.as_str() {
                "cluster" => view.cluster_name = entry.name,
                "node" => view.nodes.push(NodeView {
                    name: entry.name.unwrap_or_default(),
                    ip: entry.ip.unwrap_or_default(),
                    online: entry.online == Some(1),
                }),
                _ => {}
            }
        }
        Ok(view)
    }

    async fn guests(
        &self,
        host: &str,
        node: &str,
        creds: &Credentials,
    ) -> Result<Vec<GuestView>, BackendError> {
        let mut guests = Vec::new();
        for (segment, kind) in [("qemu", GuestKind::Vm), ("lxc", GuestKind::Lxc)] {
            let listed: PveList<PveGuestEntry> = self
                .get_json(host, &format!("/nodes/{node}/{segment}"), creds)
                .await?;
            guests.extend(listed.data.into_iter().map(|entry| GuestView {
                vmid: entry.vmid,
                name: entry.name.unwrap_or_default(),
                kind,
                running: entry.status.as_deref() == Some("running"),
            }));
        }
        Ok(guests)
    }

    async fn guest_agent_ip(
        &self,
        host: &str,
        node: &str,
        vmid: u32,
        kind: GuestKind,
        creds: &Credentials,
    ) -> Result<Option<String>, BackendError> {
        if kind != GuestKind::Vm {
            return Ok(None);
        }
        let interfaces: PveValue<PveAgentInterfaces> = self
            .get_json(
                host,
                &format!("/nodes/{node}/qemu/{vmid}/agent/network-get-interfaces"),
                creds,
            )
            .await?;
        let address = interfaces
            .data
            .result
            .unwrap_or_default()
            .into_iter()
            .flat_map(|interface| interface.ip_addresses)
            .find(|address| {
                address.ip_address_type == "ipv4"
                    && !address.ip_address.starts_with("127.")
            })
            .map(|address| address.ip_address);
        Ok(address)
    }

    async fn guest_config_ip(
        &self,
        host: &str,
        node: &str,
        vmid: u32,
        kind: GuestKind,
        creds: &Credentials,
    ) -> Result<Option<String>, BackendError> {
        let segment = Self::guest_segment(kind);
        let config: PveValue<PveGuestConfig> = self
            .get_json(host, &format!("/nodes/{node}/{segment}/{vmid}/config"), creds)
            .await?;
        let declared = config
            .data
            .ipconfig0
            .as_deref()
            .and_then(parse_declared_ip)
            .or_else(|| config.data.net0.as_deref().and_then(parse_declared_ip));
        Ok(declared)
    }
}
