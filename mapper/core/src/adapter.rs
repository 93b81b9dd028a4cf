use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;

use crate::{
    context::ScanContext,
    entity::{CertificateSummary, Entity, EntityKind, EntityStatus, MetaValue},
};

/// Predicate evaluated against the candidate entity during adapter selection.
pub type ActivationPredicate = Arc<dyn Fn(&Entity) -> bool + Send + Sync>;

/// Criteria an entity must satisfy before a non-type-matched adapter runs.
#[derive(Clone, Default)]
pub struct ActivationCriteria {
    /// Any overlap with the entity's open ports satisfies this.
    pub required_open_ports: Vec<u16>,
    /// Every `(header, substring)` pair must match case-insensitively.
    pub required_http_headers: Vec<(String, String)>,
    /// At least one pattern must answer 2xx at `https://<ip><pattern>`
    /// (HTTP fallback).
    pub required_url_patterns: Vec<String>,
    pub predicate: Option<ActivationPredicate>,
}

impl ActivationCriteria {
    #[must_use]
    pub fn ports(ports: &[u16]) -> Self {
        Self {
            required_open_ports: ports.to_vec(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn header(name: &str, substring: &str) -> Self {
        Self {
            required_http_headers: vec![(name.to_owned(), substring.to_owned())],
            ..Self::default()
        }
    }

    #[must_use]
    pub fn predicate(predicate: ActivationPredicate) -> Self {
        Self {
            predicate: Some(predicate),
            ..Self::default()
        }
    }
}

/// Changes an adapter wants applied to the entity it scanned.
///
/// The orchestrator applies the whole patch atomically together with the
/// emitted children, so id rewrites and re-parenting cannot race against
/// queued work.
#[derive(Clone, Debug, Default)]
pub struct EntityPatch {
    pub kind: Option<EntityKind>,
    /// Rewritten stable id. Queued work referencing the old id is rebound.
    pub id: Option<String>,
    /// `Some(String::new())` clears the address (logical promotion).
    pub ip: Option<String>,
    pub name: Option<String>,
    /// `Some("")` pins the entity as a root.
    pub parent_id: Option<String>,
    pub status: Option<EntityStatus>,
    pub certificate: Option<CertificateSummary>,
    pub metadata: BTreeMap<String, MetaValue>,
}

impl EntityPatch {
    #[must_use]
    pub fn promote(kind: EntityKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: EntityStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_meta(mut self, key: &str, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.to_owned(), value.into());
        self
    }

    /// Apply onto an entity. Metadata entries overwrite existing keys.
    pub fn apply(&self, entity: &mut Entity) {
        if let Some(kind) = self.kind {
            entity.kind = kind;
        }
        if let Some(id) = &self.id {
            entity.id.clone_from(id);
        }
        if let Some(ip) = &self.ip {
            entity.ip.clone_from(ip);
        }
        if let Some(name) = &self.name {
            entity.name.clone_from(name);
        }
        if let Some(parent_id) = &self.parent_id {
            entity.parent_id = Some(parent_id.clone());
        }
        if let Some(status) = self.status {
            entity.status = status;
        }
        if let Some(certificate) = &self.certificate {
            entity.certificate = Some(certificate.clone());
        }
        for (key, value) in &self.metadata {
            entity.metadata.insert(key.clone(), value.clone());
        }
    }
}

/// Result of one adapter scanning one entity.
pub enum ScanOutcome {
    Success {
        /// Mutations to the scanned entity itself.
        patch: EntityPatch,
        /// Newly discovered children, appended to the universe and queued.
        discovered: Vec<Entity>,
        /// Patches for other, already known entities, addressed by id.
        updates: Vec<(String, EntityPatch)>,
        /// Adapter names worth trying on the discovered children.
        child_hints: Vec<String>,
    },
    Failure {
        message: String,
        details: String,
    },
}

impl ScanOutcome {
    #[must_use]
    pub fn success(patch: EntityPatch) -> Self {
        Self::Success {
            patch,
            discovered: Vec::new(),
            updates: Vec::new(),
            child_hints: Vec::new(),
        }
    }

    #[must_use]
    pub fn failure(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
            details: details.into(),
        }
    }
}

/// A platform adapter: verifies an identity and enumerates child resources.
///
/// Adapters surface every failure through [`ScanOutcome::Failure`]; the
/// orchestrator never aborts the run because one of them misbehaved.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ascending order of execution among applicable adapters, before
    /// dependency resolution reorders hard requirements.
    fn priority(&self) -> u32;

    /// Adapters that must have run on the same entity first.
    fn depends_on(&self) -> &[&'static str] {
        &[]
    }

    /// Adapters that should run first when present, best effort.
    fn optional_depends_on(&self) -> &[&'static str] {
        &[]
    }

    fn activation(&self) -> ActivationCriteria {
        ActivationCriteria::default()
    }

    async fn scan(&self, entity: &Entity, ctx: &ScanContext) -> ScanOutcome;
}
