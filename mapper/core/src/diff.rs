use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    entity::{Entity, keys},
    report::TopologyReport,
};

/// Stable cross-run key for an entity.
///
/// Platform-native ids win over names, names over addresses, so renames and
/// address churn do not read as a remove plus an add.
#[must_use]
pub fn fingerprint(entity: &Entity) -> String {
    if let Some(docker_id) = entity.meta_str(keys::DOCKER_ID) {
        return format!("docker:{docker_id}");
    }
    if let Some(vmid) = entity.metadata.get(keys::PROXMOX_VMID) {
        let vmid = match vmid {
            crate::entity::MetaValue::Int(vmid) => vmid.to_string(),
            other => other.as_str().unwrap_or_default().to_owned(),
        };
        if !vmid.is_empty() {
            return format!("proxmox:{vmid}");
        }
    }
    if let Some(stack_id) = entity.meta_str(keys::PORTAINER_STACK_ID) {
        return format!("portainer-stack:{stack_id}");
    }
    if !entity.name.is_empty() {
        return format!("{}:{}", entity.kind, entity.name);
    }
    format!("ip:{}", entity.ip)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Removed,
    ModifiedIp,
    ModifiedStatus,
    ModifiedParent,
    ModifiedName,
    ModifiedPorts,
}

/// One entity-level difference between two snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopologyChange {
    pub fingerprint: String,
    pub kind: ChangeKind,
    pub entity_id: String,
    pub details: String,
}

/// Differences between two runs, oldest first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiffReport {
    pub base_scan_id: String,
    pub current_scan_id: String,
    pub changes: Vec<TopologyChange>,
}

impl DiffReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Compare two frozen reports entity-by-entity.
#[must_use]
pub fn diff(base: &TopologyReport, current: &TopologyReport) -> DiffReport {
    let older: BTreeMap<String, &Entity> = base
        .entities
        .iter()
        .map(|entity| (fingerprint(entity), entity))
        .collect();
    let newer: BTreeMap<String, &Entity> = current
        .entities
        .iter()
        .map(|entity| (fingerprint(entity), entity))
        .collect();

    let mut changes = Vec::new();
    for (print, entity) in &newer {
        match older.get(print) {
            None => changes.push(TopologyChange {
                fingerprint: print.clone(),
                kind: ChangeKind::Added,
                entity_id: entity.id.clone(),
                details: format!("{} ({}) appeared", entity_label(entity), entity.kind),
            }),
            Some(previous) => {
                if let Some(change) = compare(print, previous, entity) {
                    changes.push(change);
                }
            }
        }
    }
    for (print, entity) in &older {
        if !newer.contains_key(print) {
            changes.push(TopologyChange {
                fingerprint: print.clone(),
                kind: ChangeKind::Removed,
                entity_id: entity.id.clone(),
                details: format!("{} ({}) disappeared", entity_label(entity), entity.kind),
            });
        }
    }

    DiffReport {
        base_scan_id: base.scan_id.clone(),
        current_scan_id: current.scan_id.clone(),
        changes,
    }
}

fn entity_label(entity: &Entity) -> &str {
    if entity.name.is_empty() {
        &entity.id
    } else {
        &entity.name
    }
}

fn exposed_ports(entity: &Entity) -> BTreeSet<String> {
    entity
        .meta_list(keys::EXPOSED_PORTS)
        .map(|ports| ports.iter().cloned().collect())
        .unwrap_or_default()
}

/// Field-by-field comparison. The change kind is the first differing field
/// in the fixed order ip, status, parent, name, exposed ports; every
/// difference still lands in the details.
fn compare(print: &str, older: &Entity, newer: &Entity) -> Option<TopologyChange> {
    let mut kind = None;
    let mut details = Vec::new();

    if older.ip != newer.ip {
        kind.get_or_insert(ChangeKind::ModifiedIp);
        details.push(format!("IP changed: {} → {}", older.ip, newer.ip));
    }
    if older.status != newer.status {
        kind.get_or_insert(ChangeKind::ModifiedStatus);
        details.push(format!("status changed: {} → {}", older.status, newer.status));
    }
    if older.parent_id != newer.parent_id {
        kind.get_or_insert(ChangeKind::ModifiedParent);
        details.push(format!(
            "parent changed: {} → {}",
            older.parent_id.as_deref().unwrap_or("<none>"),
            newer.parent_id.as_deref().unwrap_or("<none>"),
        ));
    }
    if older.name != newer.name {
        kind.get_or_insert(ChangeKind::ModifiedName);
        details.push(format!("name changed: {} → {}", older.name, newer.name));
    }
    if exposed_ports(older) != exposed_ports(newer) {
        kind.get_or_insert(ChangeKind::ModifiedPorts);
        details.push("exposed ports changed".to_owned());
    }

    kind.map(|kind| TopologyChange {
        fingerprint: print.to_owned(),
        kind,
        entity_id: newer.id.clone(),
        details: details.join("; "),
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::entity::{EntityKind, MetaValue};

    fn report(scan_id: &str, entities: Vec<Entity>) -> TopologyReport {
        TopologyReport::assemble(
            scan_id.to_owned(),
            Utc::now(),
            vec!["192.168.1.0/24".to_owned()],
            entities,
            Vec::new(),
        )
    }

    fn docker_entity(name: &str, docker_id: &str, ip: &str) -> Entity {
        let mut entity = Entity::child(name, EntityKind::Container, name);
        entity.ip = ip.to_owned();
        entity.set_meta(keys::DOCKER_ID, docker_id);
        entity
    }

    #[test]
    fn docker_id_dominates_the_fingerprint() {
        let named = docker_entity("media-server", "abc123", "192.168.1.80");
        let renamed = docker_entity("media-server-v2", "abc123", "192.168.1.80");
        assert_eq!(fingerprint(&named), "docker:abc123");
        assert_eq!(fingerprint(&named), fingerprint(&renamed));
    }

    #[test]
    fn fingerprint_falls_back_through_the_priority_chain() {
        let mut vm = Entity::child("proxmox-vm-pve-100", EntityKind::Vm, "guest");
        vm.set_meta(keys::PROXMOX_VMID, MetaValue::Int(100));
        assert_eq!(fingerprint(&vm), "proxmox:100");

        let named = Entity::child("svc", EntityKind::Service, "grafana");
        assert_eq!(fingerprint(&named), "Service:grafana");

        let anonymous = Entity::unknown("192.168.1.7");
        assert_eq!(fingerprint(&anonymous), "ip:192.168.1.7");
    }

    #[test]
    fn ip_change_is_a_single_modification() {
        let base = report(
            "scan-20260101-000000",
            vec![docker_entity("app", "abc123", "192.168.1.80")],
        );
        let current = report(
            "scan-20260102-000000",
            vec![docker_entity("app", "abc123", "192.168.1.81")],
        );

        let delta = diff(&base, &current);
        assert_eq!(delta.changes.len(), 1);
        let change = &delta.changes[0];
        assert_eq!(change.kind, ChangeKind::ModifiedIp);
        assert_eq!(change.details, "IP changed: 192.168.1.80 → 192.168.1.81");
    }

    #[test]
    fn rename_does_not_produce_an_add_remove_pair() {
        let base = report(
            "scan-20260101-000000",
            vec![docker_entity("app", "abc123", "192.168.1.80")],
        );
        let current = report(
            "scan-20260102-000000",
            vec![docker_entity("app-renamed", "abc123", "192.168.1.80")],
        );

        let delta = diff(&base, &current);
        assert_eq!(delta.changes.len(), 1);
        assert_eq!(delta.changes[0].kind, ChangeKind::ModifiedName);
    }

    #[test]
    fn added_and_removed_entities_are_reported() {
        let base = report(
            "scan-20260101-000000",
            vec![docker_entity("old", "aaa111", "192.168.1.80")],
        );
        let current = report(
            "scan-20260102-000000",
            vec![docker_entity("new", "bbb222", "192.168.1.81")],
        );

        let delta = diff(&base, &current);
        let kinds: Vec<_> = delta.changes.iter().map(|change| change.kind).collect();
        assert!(kinds.contains(&ChangeKind::Added));
        assert!(kinds.contains(&ChangeKind::Removed));
        assert_eq!(delta.changes.len(), 2);
    }

    #[test]
    fn first_differing_field_wins_the_change_kind() {
        let mut older = docker_entity("app", "abc123", "192.168.1.80");
        older.status = crate::entity::EntityStatus::Reachable;
        let mut newer = docker_entity("app-renamed", "abc123", "192.168.1.81");
        newer.status = crate::entity::EntityStatus::Unreachable;

        let change = compare("docker:abc123", &older, &newer).expect("change");
        assert_eq!(change.kind, ChangeKind::ModifiedIp);
        assert!(change.details.contains("status changed"));
        assert!(change.details.contains("name changed"));
    }
}
