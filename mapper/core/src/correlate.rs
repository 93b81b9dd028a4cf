use std::collections::BTreeSet;

use tracing::debug;

use crate::entity::{Entity, EntityKind, EntityStatus, keys};

/// Post-orchestration passes that merge per-adapter observations into one
/// consistent graph. Every pass is idempotent: applying it to an already
/// correlated universe changes nothing.
pub fn correlate(universe: &mut Vec<Entity>, swept: &BTreeSet<String>) {
    reparent_stack_containers(universe);
    promote_vm_ips(universe, swept);
    identify_portainer_containers(universe);
    suppress_duplicate_cluster_nodes(universe);
    reparent_unraid_containers(universe);
}

/// Do two engine ids refer to the same container? Either side may be the
/// 12-character short form.
#[must_use]
pub fn docker_ids_match(left: &str, right: &str) -> bool {
    if left.is_empty() || right.is_empty() {
        return false;
    }
    left == right || left.starts_with(right) || right.starts_with(left)
}

fn entity_docker_id(entity: &Entity) -> Option<&str> {
    entity
        .meta_str(keys::CONTAINER_ID)
        .or_else(|| entity.meta_str(keys::DOCKER_ID))
}

/// Pass 1: containers listed by a stack become children of that stack.
pub fn reparent_stack_containers(universe: &mut [Entity]) {
    let stacks: Vec<(String, Vec<String>)> = universe
        .iter()
        .filter(|entity| entity.kind == EntityKind::PortainerStack)
        .filter_map(|entity| {
            entity
                .meta_list(keys::CONTAINER_IDS)
                .map(|ids| (entity.id.clone(), ids.to_vec()))
        })
        .collect();

    for (stack_id, container_ids) in stacks {
        for entity in universe.iter_mut() {
            if entity.kind != EntityKind::Container {
                continue;
            }
            let matched = entity_docker_id(entity)
                .is_some_and(|id| container_ids.iter().any(|listed| docker_ids_match(id, listed)));
            if matched && entity.parent_id.as_deref() != Some(&stack_id) {
                debug!(container = %entity.id, stack = %stack_id, "reparenting container under stack");
                entity.parent_id = Some(stack_id.clone());
            }
        }
    }
}

/// Pass 2: guests with only an API-reported address adopt it, absorb the
/// anonymous sweep entity at that address, and become the parent of any
/// container host found there.
pub fn promote_vm_ips(universe: &mut Vec<Entity>, swept: &BTreeSet<String>) {
    let promotable: Vec<String> = universe
        .iter()
        .filter(|entity| {
            matches!(entity.kind, EntityKind::Vm | EntityKind::Lxc)
                && entity.ip.is_empty()
                && entity.meta_str(keys::API_REPORTED_IP).is_some()
        })
        .map(|entity| entity.id.clone())
        .collect();

    for guest_id in promotable {
        let Some(guest) = universe.iter_mut().find(|entity| entity.id == guest_id) else {
            continue;
        };
        let Some(reported) = guest.meta_str(keys::API_REPORTED_IP).map(str::to_owned) else {
            continue;
        };
        guest.ip.clone_from(&reported);
        guest.status = if swept.contains(&reported) {
            EntityStatus::Reachable
        } else {
            EntityStatus::Unverified
        };

        // Absorb sweep-only entities at the adopted address.
        let mut absorbed_ports = BTreeSet::new();
        universe.retain(|other| {
            let duplicate = other.kind == EntityKind::Unknown && other.ip == reported;
            if duplicate {
                absorbed_ports.extend(other.open_ports.iter().copied());
            }
            !duplicate
        });
        if let Some(guest) = universe.iter_mut().find(|entity| entity.id == guest_id)
            && guest.open_ports.is_empty()
        {
            guest.open_ports = absorbed_ports;
        }

        // The engine answering on this address runs inside the guest.
        for other in universe.iter_mut() {
            let is_engine = matches!(
                other.kind,
                EntityKind::DockerHost | EntityKind::PortainerService
            );
            if is_engine && other.ip == reported && other.id != guest_id {
                other.parent_id = Some(guest_id.clone());
            }
        }
    }
}

/// Pass 3: mark the container actually running the Portainer UI.
pub fn identify_portainer_containers(universe: &mut [Entity]) {
    let services: Vec<(String, String)> = universe
        .iter()
        .filter(|entity| entity.kind == EntityKind::PortainerService)
        .map(|entity| (entity.id.clone(), entity.ip.clone()))
        .collect();

    for (service_id, service_ip) in services {
        for entity in universe.iter_mut() {
            if entity.kind != EntityKind::Container || entity.id == service_id {
                continue;
            }
            let by_ip = !service_ip.is_empty() && entity.ip == service_ip;
            let by_name = entity.name.to_ascii_lowercase().contains("portainer");
            if by_ip || by_name {
                entity.kind = EntityKind::PortainerService;
                entity.set_meta(keys::REASON, "Runs the Portainer UI");
            }
        }
    }
}

/// Pass 4: a cluster member reached through a second entry point shows up as
/// an orphan node-level entity; fold it under the cluster.
pub fn suppress_duplicate_cluster_nodes(universe: &mut [Entity]) {
    let clusters: Vec<(String, Vec<String>)> = universe
        .iter()
        .filter(|entity| entity.kind == EntityKind::ProxmoxCluster)
        .map(|cluster| {
            let node_ips = universe
                .iter()
                .filter(|node| {
                    node.kind == EntityKind::ProxmoxNode
                        && node.parent_id.as_deref() == Some(&cluster.id)
                        && !node.ip.is_empty()
                })
                .map(|node| node.ip.clone())
                .collect();
            (cluster.id.clone(), node_ips)
        })
        .collect();

    for (cluster_id, node_ips) in clusters {
        for entity in universe.iter_mut() {
            let node_level = matches!(entity.kind, EntityKind::Proxmox | EntityKind::Service);
            if node_level && entity.parent_id.is_none() && node_ips.contains(&entity.ip) {
                entity.parent_id = Some(cluster_id.clone());
                entity.status = EntityStatus::Unreachable;
                entity.set_meta(keys::REASON, "Duplicate cluster node");
            }
        }
    }
}

/// Pass 5: containers co-located with an Unraid host belong under it, except
/// through their stack when they have one; the stack moves instead.
pub fn reparent_unraid_containers(universe: &mut [Entity]) {
    let hosts: Vec<(String, String)> = universe
        .iter()
        .filter(|entity| entity.kind == EntityKind::Unraid && !entity.ip.is_empty())
        .map(|entity| (entity.id.clone(), entity.ip.clone()))
        .collect();

    for (unraid_id, unraid_ip) in hosts {
        let mut stacks_to_move: Vec<String> = Vec::new();
        for entity in universe.iter() {
            if entity.kind != EntityKind::Container || entity.ip != unraid_ip {
                continue;
            }
            if let Some(parent) = entity.parent_id.as_deref()
                && let Some(stack) = universe.iter().find(|e| e.id == parent)
                && stack.kind == EntityKind::PortainerStack
            {
                stacks_to_move.push(stack.id.clone());
            }
        }

        for entity in universe.iter_mut() {
            let move_stack =
                entity.kind == EntityKind::PortainerStack && stacks_to_move.contains(&entity.id);
            let move_container = entity.kind == EntityKind::Container
                && entity.ip == unraid_ip
                && entity
                    .parent_id
                    .as_deref()
                    .is_none_or(|parent| !stacks_to_move.iter().any(|stack| stack == parent));
            if (move_stack || move_container) && entity.id != unraid_id {
                entity.parent_id = Some(unraid_id.clone());
            }
        }
    }
}
