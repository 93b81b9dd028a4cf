use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata keys the engine itself reads or writes. Adapters are free to
/// record anything else; the core treats unknown keys as opaque.
pub mod keys {
    pub const DOCKER_ID: &str = "docker_id";
    pub const CONTAINER_ID: &str = "container_id";
    pub const CONTAINER_IMAGE: &str = "container_image";
    pub const EXPOSED_PORTS: &str = "exposed_ports";
    pub const PROXMOX_VMID: &str = "proxmox_vmid";
    pub const PROXMOX_NODE: &str = "proxmox_node";
    pub const PORTAINER_STACK_ID: &str = "portainer_stack_id";
    pub const API_REPORTED_IP: &str = "api_reported_ip";
    pub const MAC_ADDRESS: &str = "mac_address";
    pub const SCAN_ERROR: &str = "scan_error";
    pub const SCAN_ERROR_REASON: &str = "scan_error_reason";
    pub const SCAN_EXCEPTION: &str = "scan_exception";
    pub const CONTAINER_IDS: &str = "container_ids";
    pub const HINT_TOKEN_ENV: &str = "hint_token_env";
    pub const REASON: &str = "reason";
}

/// Classification of a discovered entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Unknown,
    Proxmox,
    ProxmoxCluster,
    ProxmoxNode,
    Pc,
    Vm,
    Lxc,
    DockerHost,
    Container,
    PortainerService,
    PortainerStack,
    Unraid,
    Nas,
    Service,
    Router,
    AccessPoint,
}

impl EntityKind {
    /// Logical kinds group other entities and never answer on the wire
    /// themselves, so they are exempt from endpoint collision rules.
    #[must_use]
    pub const fn is_logical(self) -> bool {
        matches!(self, Self::ProxmoxCluster | Self::PortainerStack)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Reachability state of an entity at the end of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityStatus {
    Reachable,
    Unreachable,
    Unverified,
    Conflicting,
    Stale,
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Tagged metadata value so equality and serialization stay total across
/// everything adapters record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<String>),
    Map(BTreeMap<String, String>),
}

impl MetaValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(values) => Some(values),
            _ => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<String>> for MetaValue {
    fn from(values: Vec<String>) -> Self {
        Self::List(values)
    }
}

/// TLS certificate details captured when an endpoint was contacted over TLS.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSummary {
    pub is_self_signed: bool,
    pub issuer: String,
    pub expiry: Option<DateTime<Utc>>,
    pub fingerprint: String,
}

/// A node in the topology graph.
///
/// `parent_id` distinguishes "unset" (`None`, the orchestrator may assign a
/// parent) from the root sentinel (`Some("")`, never re-parented).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub ip: String,
    pub kind: EntityKind,
    pub name: String,
    pub parent_id: Option<String>,
    pub status: EntityStatus,
    pub open_ports: BTreeSet<u16>,
    pub http_headers: BTreeMap<String, String>,
    pub certificate: Option<CertificateSummary>,
    pub metadata: BTreeMap<String, MetaValue>,
}

impl Entity {
    /// Fresh unclassified entity for a reachable address.
    #[must_use]
    pub fn unknown(ip: impl Into<String>) -> Self {
        let ip = ip.into();
        Self {
            id: ip.clone(),
            ip,
            kind: EntityKind::Unknown,
            name: String::new(),
            parent_id: None,
            status: EntityStatus::Reachable,
            open_ports: BTreeSet::new(),
            http_headers: BTreeMap::new(),
            certificate: None,
            metadata: BTreeMap::new(),
        }
    }

    /// New child entity carrying an adapter-assigned id.
    #[must_use]
    pub fn child(id: impl Into<String>, kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ip: String::new(),
            kind,
            name: name.into(),
            parent_id: None,
            status: EntityStatus::Unverified,
            open_ports: BTreeSet::new(),
            http_headers: BTreeMap::new(),
            certificate: None,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        matches!(self.parent_id.as_deref(), Some(""))
    }

    /// Endpoint entities are addressable on the network; logical groupings
    /// are not.
    #[must_use]
    pub const fn is_endpoint(&self) -> bool {
        !self.kind.is_logical()
    }

    #[must_use]
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(MetaValue::as_str)
    }

    #[must_use]
    pub fn meta_list(&self, key: &str) -> Option<&[String]> {
        self.metadata.get(key).and_then(MetaValue::as_list)
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<MetaValue>) {
        self.metadata.insert(key.to_owned(), value.into());
    }

    /// True when the name carries no information a lease hostname would not.
    #[must_use]
    pub fn has_generic_name(&self) -> bool {
        self.name.is_empty() || self.name == self.ip || self.name.eq_ignore_ascii_case("unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_sentinel_is_distinct_from_unset_parent() {
        let mut entity = Entity::unknown("192.168.1.10");
        assert!(!entity.is_root());
        assert!(entity.parent_id.is_none());

        entity.parent_id = Some(String::new());
        assert!(entity.is_root());
    }

    #[test]
    fn logical_kinds_are_not_endpoints() {
        let mut entity = Entity::unknown("192.168.1.10");
        assert!(entity.is_endpoint());

        entity.kind = EntityKind::PortainerStack;
        assert!(!entity.is_endpoint());
        entity.kind = EntityKind::ProxmoxCluster;
        assert!(!entity.is_endpoint());
    }

    #[test]
    fn meta_value_round_trips_through_json() {
        let mut entity = Entity::unknown("192.168.1.10");
        entity.set_meta(keys::DOCKER_ID, "abc123");
        entity.set_meta(keys::PROXMOX_VMID, 101_i64);
        entity.set_meta(keys::EXPOSED_PORTS, vec!["80/tcp".to_owned()]);

        let raw = serde_json::to_string(&entity).expect("serialize entity");
        let back: Entity = serde_json::from_str(&raw).expect("deserialize entity");
        assert_eq!(entity, back);
    }
}
