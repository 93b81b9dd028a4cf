use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entity::{Entity, EntityKind, EntityStatus, keys};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    TypeMismatch,
    UnverifiedEntity,
    IpMismatch,
}

/// An invariant violation found in the final graph. Never fatal; the
/// operator triages the list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub ip: String,
    pub kind: ConflictKind,
    pub involved: Vec<String>,
    pub description: String,
}

/// Scan the correlated universe for invariant violations.
///
/// A lone `Unknown` colliding with identified entities of a single kind is
/// not a conflict: the sweep and the platform API saw the same box, so the
/// anonymous record is folded into the identified one.
pub fn detect_conflicts(universe: &mut Vec<Entity>) -> Vec<Conflict> {
    let mut conflicts = detect_type_mismatches(universe);

    for entity in universe.iter() {
        if entity.status == EntityStatus::Unverified {
            conflicts.push(Conflict {
                ip: entity.ip.clone(),
                kind: ConflictKind::UnverifiedEntity,
                involved: vec![entity.id.clone()],
                description: format!(
                    "{} ({}) could not be verified{}",
                    display_name(entity),
                    entity.kind,
                    entity
                        .meta_str(keys::SCAN_ERROR)
                        .or_else(|| entity.meta_str(keys::SCAN_EXCEPTION))
                        .map(|error| format!(": {error}"))
                        .unwrap_or_default(),
                ),
            });
        }

        if let Some(reported) = entity.meta_str(keys::API_REPORTED_IP)
            && !reported.is_empty()
            && !entity.ip.is_empty()
            && reported != entity.ip
        {
            conflicts.push(Conflict {
                ip: entity.ip.clone(),
                kind: ConflictKind::IpMismatch,
                involved: vec![entity.id.clone()],
                description: format!(
                    "{} scanned at {} but the platform API reports {reported}",
                    display_name(entity),
                    entity.ip,
                ),
            });
        }
    }

    conflicts
}

fn display_name(entity: &Entity) -> &str {
    if entity.name.is_empty() {
        &entity.id
    } else {
        &entity.name
    }
}

/// Is `ancestor_id` on `entity`'s parent chain? Layered identities on one
/// box (a VM hosting the engine that answered on the same address) are
/// expressed through parentage and are not collisions.
fn is_ancestor(universe: &[Entity], entity: &Entity, ancestor_id: &str) -> bool {
    let mut hops = 0;
    let mut current = entity.parent_id.as_deref();
    while let Some(parent) = current {
        if parent == ancestor_id {
            return true;
        }
        if parent.is_empty() || hops > universe.len() {
            return false;
        }
        hops += 1;
        current = universe
            .iter()
            .find(|candidate| candidate.id == parent)
            .and_then(|candidate| candidate.parent_id.as_deref());
    }
    false
}

/// Do two co-addressed entities claim the same endpoint? A portless entity
/// claims the whole address; ported entities collide only on a shared port.
fn ports_collide(left: &Entity, right: &Entity) -> bool {
    left.open_ports.is_empty()
        || right.open_ports.is_empty()
        || left.open_ports.intersection(&right.open_ports).next().is_some()
}

/// Same address under the same real parent is one box observed through two
/// adapters (a suppressed duplicate cluster entry next to its node record).
fn are_siblings(left: &Entity, right: &Entity) -> bool {
    match (left.parent_id.as_deref(), right.parent_id.as_deref()) {
        (Some(left_parent), Some(right_parent)) => {
            !left_parent.is_empty() && left_parent == right_parent
        }
        _ => false,
    }
}

fn detect_type_mismatches(universe: &mut Vec<Entity>) -> Vec<Conflict> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entity in universe.iter() {
        if !entity.is_endpoint() || entity.ip.is_empty() {
            continue;
        }
        groups
            .entry(entity.ip.clone())
            .or_default()
            .push(entity.id.clone());
    }

    let mut conflicts = Vec::new();
    // target id -> unknown id folded into it
    let mut merges: Vec<(String, String)> = Vec::new();
    let mut absorbed: BTreeSet<String> = BTreeSet::new();

    for (ip, ids) in &groups {
        let members: Vec<&Entity> = ids
            .iter()
            .filter_map(|id| universe.iter().find(|entity| &entity.id == id))
            .collect();
        let kinds: BTreeSet<EntityKind> = members.iter().map(|entity| entity.kind).collect();
        if kinds.len() < 2 {
            continue;
        }

        let unknowns: Vec<&&Entity> = members
            .iter()
            .filter(|entity| entity.kind == EntityKind::Unknown)
            .collect();
        let identified: Vec<&&Entity> = members
            .iter()
            .filter(|entity| entity.kind != EntityKind::Unknown)
            .collect();
        let identified_kinds: BTreeSet<EntityKind> =
            identified.iter().map(|entity| entity.kind).collect();

        // The sweep and a platform API saw the same box: fold the anonymous
        // record into the identified one instead of reporting a clash.
        if unknowns.len() == 1 && !identified.is_empty() && identified_kinds.len() == 1 {
            let unknown_id = unknowns[0].id.clone();
            if absorbed.insert(unknown_id.clone()) {
                merges.push((identified[0].id.clone(), unknown_id));
            }
            continue;
        }

        let mut involved: BTreeSet<String> = BTreeSet::new();
        for (left_index, left) in members.iter().enumerate() {
            for right in &members[left_index + 1..] {
                if left.kind == right.kind
                    || !ports_collide(left, right)
                    || are_siblings(left, right)
                    || is_ancestor(universe, left, &right.id)
                    || is_ancestor(universe, right, &left.id)
                {
                    continue;
                }
                involved.insert(left.id.clone());
                involved.insert(right.id.clone());
            }
        }
        if involved.is_empty() {
            continue;
        }

        let kinds_label = members
            .iter()
            .filter(|entity| involved.contains(&entity.id))
            .map(|entity| entity.kind.to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>()
            .join(", ");
        conflicts.push(Conflict {
            ip: ip.clone(),
            kind: ConflictKind::TypeMismatch,
            involved: involved.into_iter().collect(),
            description: format!("{ip} claimed by entities of kinds {kinds_label}"),
        });
    }

    for conflict in &conflicts {
        for id in &conflict.involved {
            if let Some(entity) = universe.iter_mut().find(|entity| &entity.id == id) {
                entity.status = EntityStatus::Conflicting;
            }
        }
    }

    for (target_id, unknown_id) in merges {
        let Some(unknown_index) = universe.iter().position(|entity| entity.id == unknown_id)
        else {
            continue;
        };
        let unknown = universe.remove(unknown_index);
        if let Some(target) = universe.iter_mut().find(|entity| entity.id == target_id) {
            debug!(unknown = %unknown.id, target = %target.id, "folding sweep entity into identified entity");
            target.open_ports.extend(unknown.open_ports.iter().copied());
            for (key, value) in unknown.metadata {
                target.metadata.entry(key).or_insert(value);
            }
            if target.http_headers.is_empty() {
                target.http_headers = unknown.http_headers;
            }
        }
    }

    conflicts
}
