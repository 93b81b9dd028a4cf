use std::{
    any::Any,
    collections::{HashSet, VecDeque},
};

use futures::FutureExt as _;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    adapter::{Adapter, EntityPatch, ScanOutcome},
    context::ScanContext,
    entity::{Entity, EntityStatus, keys},
    registry::AdapterRegistry,
};

/// Drives the work queue: dequeue an entity, run its adapters, queue the
/// children, until the universe stops growing.
///
/// Adapter failures and panics never leave this module; they degrade the
/// affected entity to `Unverified` and the run continues.
pub struct Orchestrator {
    registry: AdapterRegistry,
}

impl Orchestrator {
    #[must_use]
    pub const fn new(registry: AdapterRegistry) -> Self {
        Self { registry }
    }

    /// Expand `initial` to the raw entity universe.
    ///
    /// Each entity is scanned at most once; entities whose address was never
    /// seen by the sweep (container bridge networks and the like) are
    /// skipped. Cancellation stops the queue and leaves the entity being
    /// scanned as `Unverified`.
    pub async fn run(&self, initial: Vec<Entity>, ctx: &ScanContext) -> Vec<Entity> {
        let mut queue: VecDeque<String> = VecDeque::new();
        for entity in &initial {
            queue.push_back(entity.id.clone());
        }
        ctx.with_universe(|universe| *universe = initial);

        let mut scanned: HashSet<String> = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if ctx.cancel.is_cancelled() {
                info!(pending = queue.len(), "scan cancelled, skipping remaining queue");
                break;
            }
            if scanned.contains(&id) {
                continue;
            }
            let Some(entity) = ctx.with_universe(|universe| find(universe, &id).cloned()) else {
                continue;
            };
            if !entity.ip.is_empty() && !ctx.is_routable(&entity.ip) {
                debug!(entity = %id, ip = %entity.ip, "address not routable, skipping");
                scanned.insert(id);
                continue;
            }

            let current_id = self.scan_entity(entity, ctx, &mut queue).await;
            scanned.insert(id);
            scanned.insert(current_id);
        }

        ctx.universe_snapshot()
    }

    /// Run every applicable adapter serially against one entity, applying
    /// each outcome before the next adapter observes the entity. Returns the
    /// entity's id after any rewrites.
    async fn scan_entity(
        &self,
        entity: Entity,
        ctx: &ScanContext,
        queue: &mut VecDeque<String>,
    ) -> String {
        let mut current_id = entity.id.clone();
        let plan = self.registry.find_applicable(&entity, ctx).await;

        for adapter in plan {
            let Some(entity) =
                ctx.with_universe(|universe| find(universe, &current_id).cloned())
            else {
                break;
            };

            let scan = std::panic::AssertUnwindSafe(adapter.scan(&entity, ctx)).catch_unwind();
            let outcome = tokio::select! {
                () = ctx.cancel.cancelled() => {
                    ctx.with_universe(|universe| {
                        if let Some(entry) = find_mut(universe, &current_id) {
                            entry.status = EntityStatus::Unverified;
                            entry.set_meta(keys::REASON, "Scan cancelled");
                        }
                    });
                    return current_id;
                }
                result = timeout(ctx.timeouts.adapter, scan) => match result {
                    Err(_) => ScanOutcome::failure(
                        format!("{} adapter timed out", adapter.name()),
                        format!("no answer within {:?}", ctx.timeouts.adapter),
                    ),
                    Ok(Err(panic)) => {
                        warn!(adapter = adapter.name(), entity = %current_id, "adapter panicked");
                        ctx.with_universe(|universe| {
                            if let Some(entry) = find_mut(universe, &current_id) {
                                entry.status = EntityStatus::Unverified;
                                entry.set_meta(keys::SCAN_EXCEPTION, panic_message(panic.as_ref()));
                            }
                        });
                        continue;
                    }
                    Ok(Ok(outcome)) => outcome,
                },
            };

            match outcome {
                ScanOutcome::Success {
                    patch,
                    discovered,
                    updates,
                    child_hints,
                } => {
                    if !child_hints.is_empty() {
                        debug!(adapter = adapter.name(), hints = ?child_hints, "child adapter hints");
                    }
                    current_id =
                        apply_success(ctx, &current_id, patch, discovered, updates, queue);
                }
                ScanOutcome::Failure { message, details } => {
                    debug!(adapter = adapter.name(), entity = %current_id, error = %message, "adapter failed");
                    ctx.with_universe(|universe| {
                        if let Some(entry) = find_mut(universe, &current_id) {
                            entry.status = EntityStatus::Unverified;
                            entry.set_meta(keys::SCAN_ERROR, message);
                            if !details.is_empty() {
                                entry.set_meta(keys::SCAN_ERROR_REASON, details);
                            }
                        }
                    });
                }
            }
        }
        current_id
    }
}

/// Apply a successful outcome in one step: patch the scanned entity, rebind
/// references when its id was rewritten, patch other entities, append and
/// queue the children. Returns the entity's id after the patch.
fn apply_success(
    ctx: &ScanContext,
    id: &str,
    patch: EntityPatch,
    discovered: Vec<Entity>,
    updates: Vec<(String, EntityPatch)>,
    queue: &mut VecDeque<String>,
) -> String {
    ctx.with_universe(|universe| {
        let Some(index) = universe.iter().position(|entity| entity.id == id) else {
            return id.to_owned();
        };
        patch.apply(&mut universe[index]);
        let new_id = universe[index].id.clone();

        if new_id != id {
            for entity in universe.iter_mut() {
                if entity.parent_id.as_deref() == Some(id) {
                    entity.parent_id = Some(new_id.clone());
                }
            }
            for pending in queue.iter_mut() {
                if pending == id {
                    pending.clone_from(&new_id);
                }
            }
        }

        for (target, update) in updates {
            match find_mut(universe, &target) {
                Some(entry) => update.apply(entry),
                None => debug!(target = %target, "update for unknown entity dropped"),
            }
        }

        for mut child in discovered {
            if child.parent_id.is_none() {
                child.parent_id = Some(new_id.clone());
            }
            queue.push_back(child.id.clone());
            universe.push(child);
        }

        new_id
    })
}

fn find<'a>(universe: &'a [Entity], id: &str) -> Option<&'a Entity> {
    universe.iter().find(|entity| entity.id == id)
}

fn find_mut<'a>(universe: &'a mut [Entity], id: &str) -> Option<&'a mut Entity> {
    universe.iter_mut().find(|entity| entity.id == id)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "adapter panicked".to_owned()
    }
}
