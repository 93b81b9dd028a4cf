use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use labmap_core::{
    ActivationCriteria, Adapter, Entity, EntityKind, EntityPatch, EntityStatus, MetaValue,
    ScanContext, ScanOutcome, keys,
};
use reqwest::Client;
use serde::Deserialize;

use crate::error::BackendError;

/// One container as reported by the engine.
#[derive(Clone, Debug)]
pub struct ContainerView {
    /// Full engine id.
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    /// `(network name, address)` pairs; the address may be empty.
    pub networks: Vec<(String, String)>,
    pub exposed_ports: Vec<String>,
}

/// Access to a Docker engine API.
#[async_trait]
pub trait DockerApi: Send + Sync {
    async fn ping(&self, host: &str) -> Result<(), BackendError>;
    async fn containers(&self, host: &str) -> Result<Vec<ContainerView>, BackendError>;
}

/// Short engine id used for stable entity ids.
#[must_use]
pub fn short_id(full: &str) -> &str {
    full.get(..12).unwrap_or(full)
}

fn is_bridge_local(ip: &str) -> bool {
    ip.starts_with("172.") || ip.starts_with("10.")
}

/// Promotes a host with an exposed engine socket and emits its containers.
pub struct DockerAdapter {
    api: Arc<dyn DockerApi>,
}

impl DockerAdapter {
    #[must_use]
    pub fn new(api: Arc<dyn DockerApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Adapter for DockerAdapter {
    fn name(&self) -> &'static str {
        "Docker"
    }

    fn priority(&self) -> u32 {
        20
    }

    fn activation(&self) -> ActivationCriteria {
        ActivationCriteria::ports(&[2375, 2376])
    }

    async fn scan(&self, entity: &Entity, ctx: &ScanContext) -> ScanOutcome {
        if let Err(err) = self.api.ping(&entity.ip).await {
            return ScanOutcome::failure(err.summary(), err.details());
        }
        let containers = match self.api.containers(&entity.ip).await {
            Ok(containers) => containers,
            Err(err) => return ScanOutcome::failure(err.summary(), err.details()),
        };

        let mut discovered = Vec::new();
        for container in containers {
            let mut child = Entity::child(
                short_id(&container.id).to_owned(),
                EntityKind::Container,
                container.name.trim_start_matches('/').to_owned(),
            );
            child.ip = container
                .networks
                .iter()
                .map(|(_, address)| address.as_str())
                .find(|address| !address.is_empty())
                .unwrap_or_default()
                .to_owned();
            child.set_meta(keys::DOCKER_ID, container.id.as_str());
            child.set_meta(keys::CONTAINER_ID, container.id.as_str());
            child.set_meta(keys::CONTAINER_IMAGE, container.image.as_str());
            if !container.exposed_ports.is_empty() {
                child.set_meta(keys::EXPOSED_PORTS, MetaValue::List(container.exposed_ports));
            }

            // Bridge networks are not routable from the scanner; an address
            // from the swept set is the only proof of reachability.
            child.status = if !container.running {
                EntityStatus::Unreachable
            } else if child.ip.is_empty() {
                EntityStatus::Unverified
            } else if is_bridge_local(&child.ip) {
                EntityStatus::Unreachable
            } else if ctx.is_swept(&child.ip) {
                EntityStatus::Reachable
            } else {
                EntityStatus::Unverified
            };
            discovered.push(child);
        }

        ScanOutcome::Success {
            patch: EntityPatch::promote(EntityKind::DockerHost),
            discovered,
            updates: Vec::new(),
            child_hints: vec!["Portainer".to_owned()],
        }
    }
}

// Docker Engine REST backend over the plain TCP socket.

#[derive(Deserialize)]
struct EngineContainer {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Ports", default)]
    ports: Vec<EnginePort>,
    #[serde(rename = "NetworkSettings")]
    network_settings: Option<EngineNetworkSettings>,
}

#[derive(Deserialize)]
struct EnginePort {
    #[serde(rename = "PrivatePort")]
    private_port: u16,
    #[serde(rename = "PublicPort")]
    public_port: Option<u16>,
    #[serde(rename = "Type", default)]
    protocol: String,
}

#[derive(Deserialize)]
struct EngineNetworkSettings {
    #[serde(rename = "Networks", default)]
    networks: std::collections::BTreeMap<String, EngineNetwork>,
}

#[derive(Deserialize)]
struct EngineNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

/// HTTP client for an unauthenticated engine socket on port 2375.
pub struct DockerHttpApi {
    client: Client,
}

impl DockerHttpApi {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DockerApi for DockerHttpApi {
    async fn ping(&self, host: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .get(format!("http://{host}:2375/_ping"))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status {
                service: "docker",
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn containers(&self, host: &str) -> Result<Vec<ContainerView>, BackendError> {
        let response = self
            .client
            .get(format!("http://{host}:2375/containers/json?all=true"))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status {
                service: "docker",
                status: response.status().as_u16(),
            });
        }
        let listed: Vec<EngineContainer> = response.json().await?;
        Ok(listed
            .into_iter()
            .map(|container| ContainerView {
                name: container
                    .names
                    .first()
                    .map(|name| name.trim_start_matches('/').to_owned())
                    .unwrap_or_default(),
                image: container.image,
                running: container.state == "running",
                networks: container
                    .network_settings
                    .map(|settings| {
                        settings
                            .networks
                            .into_iter()
                            .map(|(name, network)| (name, network.ip_address))
                            .collect()
                    })
                    .unwrap_or_default(),
                exposed_ports: container
                    .ports
                    .iter()
                    .map(|port| match port.public_port {
                        Some(public) => {
                            format!("{public}:{}/{}", port.private_port, port.protocol)
                        }
                        None => format!("{}/{}", port.private_port, port.protocol),
                    })
                    .collect(),
                id: container.id,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use labmap_core::{Credentials, Timeouts};
    use tokio_util::sync::CancellationToken;

    use super::*;

    struct FixtureDocker {
        containers: Vec<ContainerView>,
    }

    #[async_trait]
    impl DockerApi for FixtureDocker {
        async fn ping(&self, _host: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn containers(&self, _host: &str) -> Result<Vec<ContainerView>, BackendError> {
            Ok(self.containers.clone())
        }
    }

    fn container(id: &str, name: &str, ip: &str) -> ContainerView {
        ContainerView {
            id: id.to_owned(),
            name: name.to_owned(),
            image: "nginx:latest".to_owned(),
            running: true,
            networks: vec![("bridge".to_owned(), ip.to_owned())],
            exposed_ports: vec!["80/tcp".to_owned()],
        }
    }

    fn context(swept: &[&str]) -> ScanContext {
        let mut ctx = ScanContext::new(
            Credentials::new(),
            Timeouts::default(),
            CancellationToken::new(),
        )
        .expect("context");
        ctx.set_swept(swept.iter().map(|ip| (*ip).to_owned()));
        ctx
    }

    #[tokio::test]
    async fn containers_become_children_with_short_ids() {
        let full_id = "4f5e6d7c8b9a0f1e2d3c4b5a69788766554433221100ffeeddccbbaa99887766";
        let adapter = DockerAdapter::new(Arc::new(FixtureDocker {
            containers: vec![container(full_id, "/media-server", "192.168.1.120")],
        }));
        let ctx = context(&["192.168.1.80", "192.168.1.120"]);

        let ScanOutcome::Success { patch, discovered, .. } =
            adapter.scan(&Entity::unknown("192.168.1.80"), &ctx).await
        else {
            panic!("expected success");
        };

        assert_eq!(patch.kind, Some(EntityKind::DockerHost));
        assert_eq!(discovered.len(), 1);
        let child = &discovered[0];
        assert_eq!(child.id, &full_id[..12]);
        assert_eq!(child.name, "media-server");
        assert_eq!(child.meta_str(keys::DOCKER_ID), Some(full_id));
        assert_eq!(child.status, EntityStatus::Reachable);
    }

    #[tokio::test]
    async fn bridge_local_addresses_mark_the_container_unreachable() {
        let adapter = DockerAdapter::new(Arc::new(FixtureDocker {
            containers: vec![
                container("aaa111bbb222ccc333", "portainer", "172.17.0.2"),
                container("ddd444eee555fff666", "tenner", "10.0.3.7"),
                container("111222333444555666", "floater", ""),
            ],
        }));
        let ctx = context(&["192.168.1.80"]);

        let ScanOutcome::Success { discovered, .. } =
            adapter.scan(&Entity::unknown("192.168.1.80"), &ctx).await
        else {
            panic!("expected success");
        };

        assert_eq!(discovered[0].status, EntityStatus::Unreachable);
        assert_eq!(discovered[1].status, EntityStatus::Unreachable);
        assert_eq!(discovered[2].status, EntityStatus::Unverified);
    }

    #[tokio::test]
    async fn routable_but_unswept_addresses_stay_unverified() {
        let adapter = DockerAdapter::new(Arc::new(FixtureDocker {
            containers: vec![container("aaa111bbb222ccc333", "app", "192.168.1.121")],
        }));
        let ctx = context(&["192.168.1.80"]);

        let ScanOutcome::Success { discovered, .. } =
            adapter.scan(&Entity::unknown("192.168.1.80"), &ctx).await
        else {
            panic!("expected success");
        };
        assert_eq!(discovered[0].status, EntityStatus::Unverified);
    }
}
