use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use labmap_core::{
    ActivationCriteria, Adapter, Credentials, Entity, EntityKind, EntityPatch, EntityStatus,
    MetaValue, ScanContext, ScanOutcome, correlate::docker_ids_match, keys,
};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::{docker::short_id, error::BackendError};

/// Preference order when several Portainer ports answer.
const PORT_PREFERENCE: [u16; 3] = [9443, 9010, 9000];

#[derive(Clone, Debug)]
pub struct EndpointView {
    pub id: i64,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct StackView {
    pub id: i64,
    pub name: String,
    pub endpoint_id: i64,
}

#[derive(Clone, Debug)]
pub struct PortainerContainerView {
    /// Full engine id.
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    /// Compose project label, the stack binding.
    pub compose_project: Option<String>,
    pub ip: Option<String>,
}

/// Access to a Portainer instance at a resolved base URL.
#[async_trait]
pub trait PortainerApi: Send + Sync {
    /// Verify the instance and return its version string.
    async fn verify(&self, base: &str, creds: &Credentials) -> Result<String, BackendError>;

    async fn endpoints(
        &self,
        base: &str,
        creds: &Credentials,
    ) -> Result<Vec<EndpointView>, BackendError>;

    async fn stacks(&self, base: &str, creds: &Credentials)
    -> Result<Vec<StackView>, BackendError>;

    async fn containers(
        &self,
        base: &str,
        endpoint_id: i64,
        creds: &Credentials,
    ) -> Result<Vec<PortainerContainerView>, BackendError>;
}

/// Expands a Portainer instance into stacks and containers, enriching
/// containers the Docker adapter already emitted instead of duplicating
/// them.
pub struct PortainerAdapter {
    api: Arc<dyn PortainerApi>,
}

impl PortainerAdapter {
    #[must_use]
    pub fn new(api: Arc<dyn PortainerApi>) -> Self {
        Self { api }
    }

    fn candidate_bases(entity: &Entity) -> Vec<String> {
        let open: Vec<u16> = PORT_PREFERENCE
            .iter()
            .copied()
            .filter(|port| entity.open_ports.contains(port))
            .collect();
        let ports = if open.is_empty() {
            PORT_PREFERENCE.to_vec()
        } else {
            open
        };
        ports
            .into_iter()
            .map(|port| {
                let scheme = if port == 9443 { "https" } else { "http" };
                format!("{scheme}://{}:{port}", entity.ip)
            })
            .collect()
    }
}

#[async_trait]
impl Adapter for PortainerAdapter {
    fn name(&self) -> &'static str {
        "Portainer"
    }

    fn priority(&self) -> u32 {
        30
    }

    fn optional_depends_on(&self) -> &[&'static str] {
        &["Docker"]
    }

    fn activation(&self) -> ActivationCriteria {
        ActivationCriteria::ports(&PORT_PREFERENCE)
    }

    async fn scan(&self, entity: &Entity, ctx: &ScanContext) -> ScanOutcome {
        let mut base = None;
        let mut last_error = None;
        for candidate in Self::candidate_bases(entity) {
            match self.api.verify(&candidate, &ctx.credentials).await {
                Ok(version) => {
                    debug!(base = %candidate, version = %version, "portainer verified");
                    base = Some(candidate);
                    break;
                }
                Err(err) => last_error = Some(err),
            }
        }
        let Some(base) = base else {
            let err = last_error.unwrap_or(BackendError::Payload {
                service: "portainer",
                detail: "no candidate port".to_owned(),
            });
            return ScanOutcome::failure(err.summary(), err.details());
        };

        let endpoints = match self.api.endpoints(&base, &ctx.credentials).await {
            Ok(endpoints) => endpoints,
            Err(err) => return ScanOutcome::failure(err.summary(), err.details()),
        };
        let stacks = match self.api.stacks(&base, &ctx.credentials).await {
            Ok(stacks) => stacks,
            Err(err) => return ScanOutcome::failure(err.summary(), err.details()),
        };

        let known = ctx.universe_snapshot();
        let mut discovered = Vec::new();
        let mut updates = Vec::new();

        for endpoint in &endpoints {
            let containers = match self.api.containers(&base, endpoint.id, &ctx.credentials).await {
                Ok(containers) => containers,
                Err(err) => {
                    debug!(endpoint = %endpoint.name, error = %err, "container listing failed");
                    continue;
                }
            };

            for stack in stacks.iter().filter(|stack| stack.endpoint_id == endpoint.id) {
                let stack_entity_id = format!("portainer-stack-{}", stack.id);
                let member_ids: Vec<String> = containers
                    .iter()
                    .filter(|container| {
                        container.compose_project.as_deref() == Some(stack.name.as_str())
                    })
                    .map(|container| container.id.clone())
                    .collect();

                let mut child =
                    Entity::child(stack_entity_id, EntityKind::PortainerStack, stack.name.clone());
                child.status = EntityStatus::Reachable;
                child.set_meta(keys::PORTAINER_STACK_ID, stack.id.to_string());
                child.set_meta(keys::CONTAINER_IDS, MetaValue::List(member_ids));
                discovered.push(child);
            }

            for container in &containers {
                let stack_parent = container.compose_project.as_deref().and_then(|project| {
                    stacks
                        .iter()
                        .find(|stack| {
                            stack.endpoint_id == endpoint.id && stack.name == project
                        })
                        .map(|stack| format!("portainer-stack-{}", stack.id))
                });

                let existing = known.iter().find(|candidate| {
                    candidate.kind == EntityKind::Container
                        && candidate
                            .meta_str(keys::CONTAINER_ID)
                            .or_else(|| candidate.meta_str(keys::DOCKER_ID))
                            .is_some_and(|id| docker_ids_match(id, &container.id))
                });

                if let Some(existing) = existing {
                    let mut patch = EntityPatch::default()
                        .with_meta(keys::CONTAINER_ID, container.id.as_str());
                    if existing.meta_str(keys::CONTAINER_IMAGE).is_none() {
                        patch = patch.with_meta(keys::CONTAINER_IMAGE, container.image.as_str());
                    }
                    if let Some(stack_id) = stack_parent {
                        patch = patch.with_parent(stack_id);
                    }
                    updates.push((existing.id.clone(), patch));
                } else {
                    let mut child = Entity::child(
                        short_id(&container.id).to_owned(),
                        EntityKind::Container,
                        container.name.trim_start_matches('/').to_owned(),
                    );
                    child.ip = container.ip.clone().unwrap_or_default();
                    child.parent_id = stack_parent;
                    child.set_meta(keys::DOCKER_ID, container.id.as_str());
                    child.set_meta(keys::CONTAINER_ID, container.id.as_str());
                    child.set_meta(keys::CONTAINER_IMAGE, container.image.as_str());
                    child.status = if !container.running {
                        EntityStatus::Unreachable
                    } else if !child.ip.is_empty() && ctx.is_swept(&child.ip) {
                        EntityStatus::Reachable
                    } else {
                        EntityStatus::Unverified
                    };
                    discovered.push(child);
                }
            }
        }

        ScanOutcome::Success {
            patch: EntityPatch::promote(EntityKind::PortainerService),
            discovered,
            updates,
            child_hints: Vec::new(),
        }
    }
}

// Portainer REST backend, X-API-Key auth.

#[derive(Deserialize)]
struct ApiStatus {
    #[serde(rename = "Version")]
    version: String,
}

#[derive(Deserialize)]
struct ApiEndpoint {
    #[serde(rename = "Id")]
    id: i64,
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Deserialize)]
struct ApiStack {
    #[serde(rename = "Id")]
    id: i64,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "EndpointId")]
    endpoint_id: i64,
}

#[derive(Deserialize)]
struct ApiContainer {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: std::collections::BTreeMap<String, String>,
    #[serde(rename = "NetworkSettings")]
    network_settings: Option<ApiNetworkSettings>,
}

#[derive(Deserialize)]
struct ApiNetworkSettings {
    #[serde(rename = "Networks", default)]
    networks: std::collections::BTreeMap<String, ApiNetwork>,
}

#[derive(Deserialize)]
struct ApiNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// HTTP(S) client for the Portainer API.
pub struct PortainerHttpApi {
    client: Client,
}

impl PortainerHttpApi {
    const SERVICE: &'static str = "portainer";

    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client })
    }

    fn api_key(creds: &Credentials) -> Result<String, BackendError> {
        creds
            .get(Self::SERVICE, "api_key")
            .map(str::to_owned)
            .ok_or(BackendError::MissingCredentials {
                service: "portainer",
                key: "api_key",
            })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        base: &str,
        path: &str,
        creds: &Credentials,
    ) -> Result<T, BackendError> {
        let response = self
            .client
            .get(format!("{base}{path}"))
            .header("X-API-Key", Self::api_key(creds)?)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status {
                service: "portainer",
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PortainerApi for PortainerHttpApi {
    async fn verify(&self, base: &str, creds: &Credentials) -> Result<String, BackendError> {
        let status: ApiStatus = self.get_json(base, "/api/system/status", creds).await?;
        Ok(status.version)
    }

    async fn endpoints(
        &self,
        base: &str,
        creds: &Credentials,
    ) -> Result<Vec<EndpointView>, BackendError> {
        let listed: Vec<ApiEndpoint> = self.get_json(base, "/api/endpoints", creds).await?;
        Ok(listed
            .into_iter()
            .map(|endpoint| EndpointView {
                id: endpoint.id,
                name: endpoint.name,
            })
            .collect())
    }

    async fn stacks(
        &self,
        base: &str,
        creds: &Credentials,
    ) -> Result<Vec<StackView>, BackendError> {
        let listed: Vec<ApiStack> = self.get_json(base, "/api/stacks", creds).await?;
        Ok(listed
            .into_iter()
            .map(|stack| StackView {
                id: stack.id,
                name: stack.name,
                endpoint_id: stack.endpoint_id,
            })
            .collect())
    }

    async fn containers(
        &self,
        base: &str,
        endpoint_id: i64,
        creds: &Credentials,
    ) -> Result<Vec<PortainerContainerView>, BackendError> {
        let listed: Vec<ApiContainer> = self
            .get_json(
                base,
                &format!("/api/endpoints/{endpoint_id}/docker/containers/json?all=true"),
                creds,
            )
            .await?;
        Ok(listed
            .into_iter()
            .map(|container| PortainerContainerView {
                name: container
                    .names
                    .first()
                    .map(|name| name.trim_start_matches('/').to_owned())
                    .unwrap_or_default(),
                image: container.image,
                running: container.state == "running",
                compose_project: container.labels.get(COMPOSE_PROJECT_LABEL).cloned(),
                ip: container.network_settings.and_then(|settings| {
                    settings
                        .networks
                        .into_values()
                        .map(|network| network.ip_address)
                        .find(|address| !address.is_empty())
                }),
                id: container.id,
            })
            .collect())
    }
}
