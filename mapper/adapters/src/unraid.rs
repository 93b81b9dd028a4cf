use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use labmap_core::{
    ActivationCriteria, Adapter, Credentials, Entity, EntityKind, EntityPatch, EntityStatus,
    ScanContext, ScanOutcome, correlate::docker_ids_match, keys,
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::BackendError;

/// Substring of the CSP header every Unraid web UI sends.
const CSP_TOKEN: &str = "unraid.net";

#[derive(Clone, Debug)]
pub struct UnraidContainerView {
    /// Full engine id.
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
}

/// Access to the Unraid GraphQL API.
#[async_trait]
pub trait UnraidApi: Send + Sync {
    async fn docker_state(
        &self,
        host: &str,
        creds: &Credentials,
    ) -> Result<Vec<UnraidContainerView>, BackendError>;
}

/// Claims a host running Unraid and folds its Docker state onto containers
/// other adapters already discovered.
pub struct UnraidAdapter {
    api: Arc<dyn UnraidApi>,
}

impl UnraidAdapter {
    #[must_use]
    pub fn new(api: Arc<dyn UnraidApi>) -> Self {
        Self { api }
    }

    fn container_updates(
        containers: &[UnraidContainerView],
        host_ip: &str,
        known: &[Entity],
    ) -> Vec<(String, EntityPatch)> {
        let mut updates = Vec::new();
        for container in containers {
            let Some(existing) = known.iter().find(|candidate| {
                candidate.kind == EntityKind::Container
                    && candidate
                        .meta_str(keys::CONTAINER_ID)
                        .or_else(|| candidate.meta_str(keys::DOCKER_ID))
                        .is_some_and(|id| docker_ids_match(id, &container.id))
            }) else {
                // Containers only Unraid knows about are left for later
                // runs; fabricating them here would bypass the engine view.
                continue;
            };

            let status = if container.running {
                EntityStatus::Reachable
            } else {
                EntityStatus::Unreachable
            };
            let mut patch = EntityPatch::default()
                .with_ip(host_ip)
                .with_status(status)
                .with_meta(keys::CONTAINER_ID, container.id.as_str());
            if existing.meta_str(keys::CONTAINER_IMAGE).is_none() {
                patch = patch.with_meta(keys::CONTAINER_IMAGE, container.image.as_str());
            }
            updates.push((existing.id.clone(), patch));
        }
        updates
    }
}

#[async_trait]
impl Adapter for UnraidAdapter {
    fn name(&self) -> &'static str {
        "Unraid"
    }

    fn priority(&self) -> u32 {
        35
    }

    fn activation(&self) -> ActivationCriteria {
        ActivationCriteria::header("content-security-policy", CSP_TOKEN)
    }

    async fn scan(&self, entity: &Entity, ctx: &ScanContext) -> ScanOutcome {
        let containers = match self.api.docker_state(&entity.ip, &ctx.credentials).await {
            Ok(containers) => containers,
            Err(err) => return ScanOutcome::failure(err.summary(), err.details()),
        };

        let known = ctx.universe_snapshot();
        let updates = Self::container_updates(&containers, &entity.ip, &known);

        if entity.kind == EntityKind::Unknown {
            return ScanOutcome::Success {
                patch: EntityPatch::promote(EntityKind::Unraid)
                    .with_status(EntityStatus::Reachable),
                discovered: Vec::new(),
                updates,
                child_hints: Vec::new(),
            };
        }
        if entity.kind == EntityKind::Unraid {
            // Already claimed (the root created below re-enters here);
            // just refresh container state.
            return ScanOutcome::Success {
                patch: EntityPatch::default(),
                discovered: Vec::new(),
                updates,
                child_hints: Vec::new(),
            };
        }

        // The host already carries another identity (Portainer, Docker).
        // Keep it and hang it off a new Unraid root at the same address.
        let root_id = format!("unraid-{}", entity.ip);
        debug!(host = %entity.ip, root = %root_id, "host already classified, adding unraid root");
        let mut root = Entity::child(root_id.clone(), EntityKind::Unraid, "unraid");
        root.ip.clone_from(&entity.ip);
        root.parent_id = Some(String::new());
        root.status = EntityStatus::Reachable;

        ScanOutcome::Success {
            patch: EntityPatch::default().with_parent(root_id),
            discovered: vec![root],
            updates,
            child_hints: Vec::new(),
        }
    }
}

// GraphQL backend against the Unraid API.

#[derive(Deserialize)]
struct GraphqlEnvelope {
    data: Option<GraphqlData>,
}

#[derive(Deserialize)]
struct GraphqlData {
    docker: Option<GraphqlDocker>,
}

#[derive(Deserialize)]
struct GraphqlDocker {
    containers: Vec<GraphqlContainer>,
}

#[derive(Deserialize)]
struct GraphqlContainer {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    image: String,
    #[serde(default)]
    state: String,
}

/// HTTPS client for the Unraid GraphQL endpoint.
pub struct UnraidHttpApi {
    client: Client,
}

impl UnraidHttpApi {
    const SERVICE: &'static str = "unraid";

    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UnraidApi for UnraidHttpApi {
    async fn docker_state(
        &self,
        host: &str,
        creds: &Credentials,
    ) -> Result<Vec<UnraidContainerView>, BackendError> {
        let api_key =
            creds
                .get(Self::SERVICE, "api_key")
                .ok_or(BackendError::MissingCredentials {
                    service: "unraid",
                    key: "api_key",
                })?;
        let query = json!({
            "query": "query { docker { containers { id names image state } } }"
        });
        let response = self
            .client
            .post(format!("https://{host}/graphql"))
            .header("x-api-key", api_key)
            .json(&query)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status {
                service: "unraid",
                status: response.status().as_u16(),
            });
        }
        let envelope: GraphqlEnvelope = response.json().await?;
        let docker = envelope
            .data
            .and_then(|data| data.docker)
            .ok_or_else(|| BackendError::Payload {
                service: "unraid",
                detail: "missing docker state in GraphQL response".to_owned(),
            })?;
        Ok(docker
            .containers
            .into_iter()
            .map(|container| UnraidContainerView {
                name: container
                    .names
                    .first()
                    .map(|name| name.trim_start_matches('/').to_owned())
                    .unwrap_or_default(),
                image: container.image,
                running: container.state.eq_ignore_ascii_case("running"),
                id: container.id,
            })
            .collect())
    }
}
