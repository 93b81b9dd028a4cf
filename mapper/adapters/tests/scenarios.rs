//! End-to-end graph scenarios: fingerprinted hosts go through adapter
//! expansion, correlation, conflict detection and assembly, with all
//! platform APIs replaced by fixtures.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use labmap_adapters::{
    BackendError, DockerAdapter, DockerApi, PortainerAdapter, PortainerApi, ProxmoxAdapter,
    ProxmoxApi, UnraidAdapter, UnraidApi,
    docker::ContainerView,
    portainer::{EndpointView, PortainerContainerView, StackView},
    proxmox::{ClusterView, GuestKind, GuestView, NodeView},
    unraid::UnraidContainerView,
};
use labmap_core::{
    ActivationCriteria, Adapter, AdapterRegistry, Credentials, Entity, EntityKind, EntityStatus,
    Orchestrator, ScanContext, ScanOutcome, Timeouts, TopologyReport, correlate::correlate,
    detect_conflicts, keys,
};
use tokio_util::sync::CancellationToken;

const MEDIA_CONTAINER_ID: &str = "bbmedia00112233445566778899aabbccddeeff00112233445566778899aabb";
const PORTAINER_CONTAINER_ID: &str =
    "aaportainer0011223344556677889900aabbccddeeff001122334455667788";

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

fn fingerprinted(ip: &str, ports: &[u16]) -> Entity {
    let mut entity = Entity::unknown(ip);
    entity.open_ports = ports.iter().copied().collect();
    entity
}

async fn run_graph(
    initial: Vec<Entity>,
    registry: AdapterRegistry,
    ctx: &ScanContext,
) -> TopologyReport {
    let mut universe = Orchestrator::new(registry).run(initial, ctx).await;
    correlate(&mut universe, ctx.swept());
    let conflicts = detect_conflicts(&mut universe);
    TopologyReport::assemble(
        "scan-20260801-120000".to_owned(),
        Utc::now(),
        vec!["192.168.1.0/24".to_owned()],
        universe,
        conflicts,
    )
}

fn registry(adapters: Vec<Arc<dyn Adapter>>) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        registry.register(adapter);
    }
    registry
}

struct ScenarioProxmox;

#[async_trait]
impl ProxmoxApi for ScenarioProxmox {
    async fn cluster_view(
        &self,
        _host: &str,
        _creds: &Credentials,
    ) -> Result<ClusterView, BackendError> {
        Ok(ClusterView {
            cluster_name: None,
            nodes: vec![NodeView {
                name: "pve".to_owned(),
                ip: "192.168.1.51".to_owned(),
                online: true,
            }],
        })
    }

    async fn guests(
        &self,
        _host: &str,
        _node: &str,
        _creds: &Credentials,
    ) -> Result<Vec<GuestView>, BackendError> {
        Ok(vec![GuestView {
            vmid: 100,
            name: "docker-vm".to_owned(),
            kind: GuestKind::Vm,
            running: true,
        }])
    }

    async fn guest_agent_ip(
        &self,
        _host: &str,
        _node: &str,
        _vmid: u32,
        _kind: GuestKind,
        _creds: &Credentials,
    ) -> Result<Option<String>, BackendError> {
        Ok(None)
    }

    async fn guest_config_ip(
        &self,
        _host: &str,
        _node: &str,
        _vmid: u32,
        _kind: GuestKind,
        _creds: &Credentials,
    ) -> Result<Option<String>, BackendError> {
        Ok(Some("192.168.1.80".to_owned()))
    }
}

struct ScenarioDocker;

#[async_trait]
impl DockerApi for ScenarioDocker {
    async fn ping(&self, _host: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn containers(&self, _host: &str) -> Result<Vec<ContainerView>, BackendError> {
        Ok(vec![
            ContainerView {
                id: PORTAINER_CONTAINER_ID.to_owned(),
                name: "portainer".to_owned(),
                image: "portainer/portainer-ce:latest".to_owned(),
                running: true,
                networks: vec![("bridge".to_owned(), "172.17.0.2".to_owned())],
                exposed_ports: vec!["9000/tcp".to_owned()],
            },
            ContainerView {
                id: MEDIA_CONTAINER_ID.to_owned(),
                name: "media-server".to_owned(),
                image: "jellyfin:latest".to_owned(),
                running: true,
                networks: vec![("lan".to_owned(), "192.168.1.120".to_owned())],
                exposed_ports: vec!["8096/tcp".to_owned()],
            },
        ])
    }
}

struct ScenarioPortainer;

#[async_trait]
impl PortainerApi for ScenarioPortainer {
    async fn verify(&self, _base: &str, _creds: &Credentials) -> Result<String, BackendError> {
        Ok("2.19.4".to_owned())
    }

    async fn endpoints(
        &self,
        _base: &str,
        _creds: &Credentials,
    ) -> Result<Vec<EndpointView>, BackendError> {
        Ok(vec![EndpointView {
            id: 1,
            name: "local".to_owned(),
        }])
    }

    async fn stacks(
        &self,
        _base: &str,
        _creds: &Credentials,
    ) -> Result<Vec<StackView>, BackendError> {
        Ok(vec![StackView {
            id: 7,
            name: "media".to_owned(),
            endpoint_id: 1,
        }])
    }

    async fn containers(
        &self,
        _base: &str,
        _endpoint_id: i64,
        _creds: &Credentials,
    ) -> Result<Vec<PortainerContainerView>, BackendError> {
        Ok(vec![
            PortainerContainerView {
                id: PORTAINER_CONTAINER_ID.to_owned(),
                name: "portainer".to_owned(),
                image: "portainer/portainer-ce:latest".to_owned(),
                running: true,
                compose_project: None,
                ip: Some("172.17.0.2".to_owned()),
            },
            PortainerContainerView {
                id: MEDIA_CONTAINER_ID.to_owned(),
                name: "media-server".to_owned(),
                image: "jellyfin:latest".to_owned(),
                running: true,
                compose_project: Some("media".to_owned()),
                ip: Some("192.168.1.120".to_owned()),
            },
        ])
    }
}

/// Scenario: Proxmox hypervisor hosting a VM that runs Docker with a
/// containerized Portainer managing one stack.
#[tokio::test]
async fn proxmox_vm_docker_portainer_stack_chain() {
    let registry = registry(vec![
        Arc::new(ProxmoxAdapter::new(Arc::new(ScenarioProxmox))) as Arc<dyn Adapter>,
        Arc::new(DockerAdapter::new(Arc::new(ScenarioDocker))),
        Arc::new(PortainerAdapter::new(Arc::new(ScenarioPortainer))),
    ]);
    let ctx = context(&["192.168.1.51", "192.168.1.80", "192.168.1.120"]);

    let report = run_graph(
        vec![
            fingerprinted("192.168.1.51", &[22, 8006]),
            fingerprinted("192.168.1.80", &[22, 2375, 9000]),
            fingerprinted("192.168.1.120", &[80]),
        ],
        registry,
        &ctx,
    )
    .await;

    // Hypervisor -> VM.
    let node = report.entity("192.168.1.51").expect("proxmox host");
    assert_eq!(node.kind, EntityKind::ProxmoxNode);
    let vm = report.entity("proxmox-vm-pve-100").expect("vm");
    assert_eq!(vm.parent_id.as_deref(), Some("192.168.1.51"));
    assert_eq!(vm.ip, "192.168.1.80");
    assert_eq!(vm.status, EntityStatus::Reachable);

    // VM -> Portainer service host.
    let host = report.entity("192.168.1.80").expect("engine host");
    assert_eq!(host.kind, EntityKind::PortainerService);
    assert_eq!(host.parent_id.as_deref(), Some("proxmox-vm-pve-100"));

    // Service -> stack -> container.
    let stack = report.entity("portainer-stack-7").expect("stack");
    assert_eq!(stack.kind, EntityKind::PortainerStack);
    assert_eq!(stack.parent_id.as_deref(), Some("192.168.1.80"));
    let media = report.entity(&MEDIA_CONTAINER_ID[..12]).expect("container");
    assert_eq!(media.parent_id.as_deref(), Some("portainer-stack-7"));
    assert_eq!(media.ip, "192.168.1.120");

    // The swept record at .120 was folded into the container.
    let at_120: Vec<_> = report
        .entities
        .iter()
        .filter(|entity| entity.ip == "192.168.1.120")
        .collect();
    assert_eq!(at_120.len(), 1);
    assert_eq!(at_120[0].kind, EntityKind::Container);

    assert!(report.conflicts.is_empty(), "conflicts: {:?}", report.conflicts);
}

struct CollisionPortainer;

#[async_trait]
impl PortainerApi for CollisionPortainer {
    async fn verify(&self, _base: &str, _creds: &Credentials) -> Result<String, BackendError> {
        Ok("2.19.4".to_owned())
    }

    async fn endpoints(
        &self,
        _base: &str,
        _creds: &Credentials,
    ) -> Result<Vec<EndpointView>, BackendError> {
        Ok(Vec::new())
    }

    async fn stacks(
        &self,
        _base: &str,
        _creds: &Credentials,
    ) -> Result<Vec<StackView>, BackendError> {
        Ok(Vec::new())
    }

    async fn containers(
        &self,
        _base: &str,
        _endpoint_id: i64,
        _creds: &Credentials,
    ) -> Result<Vec<PortainerContainerView>, BackendError> {
        Ok(Vec::new())
    }
}

/// A Portainer service emitted next to the anonymous sweep record at the
/// same address is merged, not reported as a collision.
struct EmittingAdapter;

#[async_trait]
impl Adapter for EmittingAdapter {
    fn name(&self) -> &'static str {
        "Emitter"
    }

    fn priority(&self) -> u32 {
        30
    }

    fn activation(&self) -> ActivationCriteria {
        ActivationCriteria::ports(&[9443])
    }

    async fn scan(&self, entity: &Entity, _ctx: &ScanContext) -> ScanOutcome {
        let mut service =
            Entity::child("portainer-200", EntityKind::PortainerService, "portainer");
        service.ip.clone_from(&entity.ip);
        service.parent_id = Some(String::new());
        service.status = EntityStatus::Reachable;
        ScanOutcome::Success {
            patch: labmap_core::EntityPatch::default(),
            discovered: vec![service],
            updates: Vec::new(),
            child_hints: Vec::new(),
        }
    }
}

#[tokio::test]
async fn unknown_and_identified_at_one_address_merge_without_conflict() {
    let registry = registry(vec![Arc::new(EmittingAdapter) as Arc<dyn Adapter>]);
    let ctx = context(&["192.168.1.200"]);

    let report = run_graph(
        vec![fingerprinted("192.168.1.200", &[80, 443, 9443])],
        registry,
        &ctx,
    )
    .await;

    let at_200: Vec<_> = report
        .entities
        .iter()
        .filter(|entity| entity.ip == "192.168.1.200")
        .collect();
    assert_eq!(at_200.len(), 1);
    let merged = at_200[0];
    assert_eq!(merged.kind, EntityKind::PortainerService);
    assert_eq!(merged.open_ports, [80, 443, 9443].into_iter().collect());
    assert!(report.conflicts.is_empty());
}

struct ClusterProxmox;

#[async_trait]
impl ProxmoxApi for ClusterProxmox {
    async fn cluster_view(
        &self,
        _host: &str,
        _creds: &Credentials,
    ) -> Result<ClusterView, BackendError> {
        Ok(ClusterView {
            cluster_name: Some("pve".to_owned()),
            nodes: vec![
                NodeView {
                    name: "pve1".to_owned(),
                    ip: "192.168.1.51".to_owned(),
                    online: true,
                },
                NodeView {
                    name: "pve2".to_owned(),
                    ip: "192.168.1.52".to_owned(),
                    online: true,
                },
            ],
        })
    }

    async fn guests(
        &self,
        _host: &str,
        _node: &str,
        _creds: &Credentials,
    ) -> Result<Vec<GuestView>, BackendError> {
        Ok(Vec::new())
    }

    async fn guest_agent_ip(
        &self,
        _host: &str,
        _node: &str,
        _vmid: u32,
        _kind: GuestKind,
        _creds: &Credentials,
    ) -> Result<Option<String>, BackendError> {
        Ok(None)
    }

    async fn guest_config_ip(
        &self,
        _host: &str,
        _node: &str,
        _vmid: u32,
        _kind: GuestKind,
        _creds: &Credentials,
    ) -> Result<Option<String>, BackendError> {
        Ok(None)
    }
}

#[tokio::test]
async fn duplicate_cluster_entry_point_is_suppressed() {
    let registry = registry(vec![
        Arc::new(ProxmoxAdapter::new(Arc::new(ClusterProxmox))) as Arc<dyn Adapter>,
    ]);
    let ctx = context(&["192.168.1.51", "192.168.1.52"]);

    let report = run_graph(
        vec![
            fingerprinted("192.168.1.51", &[8006]),
            fingerprinted("192.168.1.52", &[8006]),
        ],
        registry,
        &ctx,
    )
    .await;

    let cluster = report.entity("proxmox-cluster-pve").expect("cluster");
    assert_eq!(cluster.kind, EntityKind::ProxmoxCluster);
    assert!(cluster.ip.is_empty());
    assert!(cluster.is_root());

    // Both member nodes hang off the cluster.
    let children = report.children_of("proxmox-cluster-pve");
    assert!(
        children
            .iter()
            .filter(|child| child.kind == EntityKind::ProxmoxNode)
            .count()
            == 2
    );

    // The second entry point was folded under the cluster.
    let duplicate = report.entity("192.168.1.52").expect("duplicate entry");
    assert_eq!(duplicate.kind, EntityKind::Proxmox);
    assert_eq!(duplicate.parent_id.as_deref(), Some("proxmox-cluster-pve"));
    assert_eq!(duplicate.status, EntityStatus::Unreachable);
    assert_eq!(duplicate.meta_str(keys::REASON), Some("Duplicate cluster node"));
}

struct UnraidFixture;

#[async_trait]
impl UnraidApi for UnraidFixture {
    async fn docker_state(
        &self,
        _host: &str,
        _creds: &Credentials,
    ) -> Result<Vec<UnraidContainerView>, BackendError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn unraid_behind_portainer_gains_a_root_without_conflicts() {
    let registry = registry(vec![
        Arc::new(PortainerAdapter::new(Arc::new(CollisionPortainer))) as Arc<dyn Adapter>,
        Arc::new(UnraidAdapter::new(Arc::new(UnraidFixture))),
    ]);
    let ctx = context(&["192.168.1.90"]);

    let mut host = fingerprinted("192.168.1.90", &[80, 443, 9443]);
    host.http_headers.insert(
        "content-security-policy".to_owned(),
        "frame-ancestors 'self' https://unraid.net".to_owned(),
    );

    let report = run_graph(vec![host], registry, &ctx).await;

    let root = report.entity("unraid-192.168.1.90").expect("unraid root");
    assert_eq!(root.kind, EntityKind::Unraid);
    assert!(root.is_root());

    let service = report.entity("192.168.1.90").expect("portainer host");
    assert_eq!(service.kind, EntityKind::PortainerService);
    assert_eq!(service.parent_id.as_deref(), Some("unraid-192.168.1.90"));

    assert!(
        report
            .conflicts
            .iter()
            .all(|conflict| conflict.kind != labmap_core::ConflictKind::TypeMismatch)
    );
}

struct ExplodingAdapter;

#[async_trait]
impl Adapter for ExplodingAdapter {
    fn name(&self) -> &'static str {
        "Exploding"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn activation(&self) -> ActivationCriteria {
        ActivationCriteria::ports(&[3000])
    }

    async fn scan(&self, _entity: &Entity, _ctx: &ScanContext) -> ScanOutcome {
        panic!("fixture backend exploded");
    }
}

#[tokio::test]
async fn adapter_exception_is_isolated_and_reported() {
    let registry = registry(vec![
        Arc::new(ExplodingAdapter) as Arc<dyn Adapter>,
        Arc::new(DockerAdapter::new(Arc::new(ScenarioDocker))),
    ]);
    let ctx = context(&["192.168.1.60", "192.168.1.80", "192.168.1.120"]);

    let report = run_graph(
        vec![
            fingerprinted("192.168.1.60", &[3000]),
            fingerprinted("192.168.1.80", &[2375]),
        ],
        registry,
        &ctx,
    )
    .await;

    let failed = report.entity("192.168.1.60").expect("failed entity");
    assert_eq!(failed.status, EntityStatus::Unverified);
    assert_eq!(
        failed.meta_str(keys::SCAN_EXCEPTION),
        Some("fixture backend exploded")
    );

    // The rest of the run completed.
    assert!(report.entity("192.168.1.80").is_some());
    assert!(report.entity(&MEDIA_CONTAINER_ID[..12]).is_some());

    let unverified: Vec<_> = report
        .conflicts
        .iter()
        .filter(|conflict| conflict.kind == labmap_core::ConflictKind::UnverifiedEntity)
        .collect();
    assert!(
        unverified
            .iter()
            .any(|conflict| conflict.involved.contains(&"192.168.1.60".to_owned()))
    );
}

struct CancellingAdapter;

#[async_trait]
impl Adapter for CancellingAdapter {
    fn name(&self) -> &'static str {
        "Cancelling"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn activation(&self) -> ActivationCriteria {
        ActivationCriteria::ports(&[5000])
    }

    async fn scan(&self, _entity: &Entity, ctx: &ScanContext) -> ScanOutcome {
        ctx.cancel.cancel();
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        ScanOutcome::failure("unreachable", "")
    }
}

#[tokio::test]
async fn cancellation_keeps_partial_results() {
    let registry = registry(vec![
        Arc::new(CancellingAdapter) as Arc<dyn Adapter>,
        Arc::new(DockerAdapter::new(Arc::new(ScenarioDocker))),
    ]);
    let ctx = context(&["192.168.1.70", "192.168.1.80", "192.168.1.120"]);

    let report = run_graph(
        vec![
            fingerprinted("192.168.1.70", &[5000]),
            fingerprinted("192.168.1.80", &[2375]),
        ],
        registry,
        &ctx,
    )
    .await;

    // The entity whose adapter was interrupted is unverified.
    let interrupted = report.entity("192.168.1.70").expect("interrupted entity");
    assert_eq!(interrupted.status, EntityStatus::Unverified);

    // The queued host was skipped but still reported.
    let skipped = report.entity("192.168.1.80").expect("skipped entity");
    assert_eq!(skipped.kind, EntityKind::Unknown);
    assert_eq!(report.entities.len(), 2);
}
