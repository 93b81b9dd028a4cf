use std::{collections::HashSet, sync::Arc};

use tracing::{debug, warn};

use crate::{
    adapter::{ActivationCriteria, Adapter},
    context::ScanContext,
    entity::{Entity, EntityKind},
};

/// Adapter that owns a kind outright: once an entity carries the kind, the
/// adapter runs without re-checking activation criteria.
fn kind_owner(kind: EntityKind) -> Option<&'static str> {
    match kind {
        EntityKind::Proxmox | EntityKind::ProxmoxCluster | EntityKind::ProxmoxNode => {
            Some("Proxmox")
        }
        EntityKind::DockerHost => Some("Docker"),
        EntityKind::PortainerService => Some("Portainer"),
        EntityKind::Unraid => Some("Unraid"),
        EntityKind::Router => Some("Router"),
        _ => None,
    }
}

/// Holds the registered platform adapters and computes, per entity, the
/// ordered list of adapters to run.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index an adapter by name. Registering the same name twice replaces
    /// the earlier entry.
    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.retain(|known| known.name() != adapter.name());
        self.adapters.push(adapter);
        self.adapters.sort_by_key(|adapter| adapter.priority());
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|adapter| adapter.name()).collect()
    }

    /// Applicable adapters for `entity`, in dependency-satisfied order.
    pub async fn find_applicable(
        &self,
        entity: &Entity,
        ctx: &ScanContext,
    ) -> Vec<Arc<dyn Adapter>> {
        let mut selected = Vec::new();
        for adapter in &self.adapters {
            if kind_owner(entity.kind) == Some(adapter.name()) {
                selected.push(Arc::clone(adapter));
                continue;
            }
            if criteria_pass(&adapter.activation(), entity, ctx).await {
                selected.push(Arc::clone(adapter));
            }
        }
        debug!(
            entity = %entity.id,
            adapters = ?selected.iter().map(|a| a.name()).collect::<Vec<_>>(),
            "selected adapters"
        );
        order_by_dependencies(selected)
    }
}

async fn criteria_pass(criteria: &ActivationCriteria, entity: &Entity, ctx: &ScanContext) -> bool {
    if !criteria.required_open_ports.is_empty()
        && !criteria
            .required_open_ports
            .iter()
            .any(|port| entity.open_ports.contains(port))
    {
        return false;
    }

    for (header, needle) in &criteria.required_http_headers {
        let matched = entity.http_headers.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case(header)
                && value.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
        });
        if !matched {
            return false;
        }
    }

    if !criteria.required_url_patterns.is_empty()
        && !probe_url_patterns(&criteria.required_url_patterns, entity, ctx).await
    {
        return false;
    }

    if let Some(predicate) = &criteria.predicate
        && !predicate(entity)
    {
        return false;
    }

    true
}

/// True when at least one pattern answers 2xx, HTTPS first then HTTP.
async fn probe_url_patterns(patterns: &[String], entity: &Entity, ctx: &ScanContext) -> bool {
    if entity.ip.is_empty() {
        return false;
    }
    for pattern in patterns {
        for scheme in ["https", "http"] {
            let url = format!("{scheme}://{}{pattern}", entity.ip);
            match ctx.insecure_http().get(&url).send().await {
                Ok(response) if response.status().is_success() => return true,
                Ok(_) | Err(_) => {}
            }
        }
    }
    false
}

/// Order adapters so hard dependencies come first, keeping priority order
/// among unconstrained peers. An unsatisfiable remainder (dependency cycle)
/// degrades to priority order with a warning instead of failing the scan.
fn order_by_dependencies(selected: Vec<Arc<dyn Adapter>>) -> Vec<Arc<dyn Adapter>> {
    let present: HashSet<&'static str> = selected.iter().map(|adapter| adapter.name()).collect();
    let mut remaining = selected;
    let mut ordered: Vec<Arc<dyn Adapter>> = Vec::with_capacity(remaining.len());
    let mut emitted: HashSet<&'static str> = HashSet::new();

    while !remaining.is_empty() {
        let ready = remaining.iter().position(|adapter| {
            let hard_ok = adapter
                .depends_on()
                .iter()
                .all(|dep| !present.contains(dep) || emitted.contains(dep));
            let soft_ok = adapter
                .optional_depends_on()
                .iter()
                .all(|dep| !present.contains(dep) || emitted.contains(dep));
            hard_ok && soft_ok
        });

        // Soft edges alone must never deadlock the plan, so relax them
        // before declaring a cycle.
        let ready = ready.or_else(|| {
            remaining.iter().position(|adapter| {
                adapter
                    .depends_on()
                    .iter()
                    .all(|dep| !present.contains(dep) || emitted.contains(dep))
            })
        });

        match ready {
            Some(index) => {
                let adapter = remaining.remove(index);
                emitted.insert(adapter.name());
                ordered.push(adapter);
            }
            None => {
                warn!(
                    stuck = ?remaining.iter().map(|a| a.name()).collect::<Vec<_>>(),
                    "adapter dependency cycle, emitting remainder in priority order"
                );
                ordered.extend(remaining.drain(..));
            }
        }
    }
    ordered
}
