use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{conflict::Conflict, entity::Entity};

/// Per-run counters grouped by kind and by status.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySummary {
    pub total: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub conflicts: usize,
}

/// Frozen result of one discovery run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologyReport {
    pub scan_id: String,
    pub timestamp: DateTime<Utc>,
    pub subnets: Vec<String>,
    pub entities: Vec<Entity>,
    pub conflicts: Vec<Conflict>,
    pub summary: TopologySummary,
}

/// Time-ordered scan identifier, `scan-YYYYMMDD-HHMMSS` in UTC.
#[must_use]
pub fn scan_id_for(timestamp: DateTime<Utc>) -> String {
    timestamp.format("scan-%Y%m%d-%H%M%S").to_string()
}

impl TopologyReport {
    /// Deduplicate the universe by id (first occurrence wins), compute the
    /// summary counters and freeze.
    #[must_use]
    pub fn assemble(
        scan_id: String,
        timestamp: DateTime<Utc>,
        subnets: Vec<String>,
        universe: Vec<Entity>,
        conflicts: Vec<Conflict>,
    ) -> Self {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut entities = Vec::with_capacity(universe.len());
        for entity in universe {
            if seen.insert(entity.id.clone()) {
                entities.push(entity);
            }
        }

        let mut summary = TopologySummary {
            total: entities.len(),
            conflicts: conflicts.len(),
            ..TopologySummary::default()
        };
        for entity in &entities {
            *summary.by_kind.entry(entity.kind.to_string()).or_default() += 1;
            *summary
                .by_status
                .entry(entity.status.to_string())
                .or_default() += 1;
        }

        Self {
            scan_id,
            timestamp,
            subnets,
            entities,
            conflicts,
            summary,
        }
    }

    /// Entity lookup by id.
    #[must_use]
    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.entities.iter().find(|entity| entity.id == id)
    }

    /// Direct children of an entity, in discovery order.
    #[must_use]
    pub fn children_of(&self, id: &str) -> Vec<&Entity> {
        self.entities
            .iter()
            .filter(|entity| entity.parent_id.as_deref() == Some(id))
            .collect()
    }
}
