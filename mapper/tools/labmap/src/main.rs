use std::sync::Arc;

use labmap_adapters::{
    DockerAdapter, DockerHttpApi, JsonLeaseSource, PortainerAdapter, PortainerHttpApi,
    ProxmoxAdapter, ProxmoxHttpApi, RouterAdapter, UnraidAdapter, UnraidHttpApi,
};
use labmap_core::{
    Adapter, AdapterRegistry, HistoryStore, PipelineConfig, ScanPipeline, TopologyReport, diff,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;

use config::ScanConfig;

const DEFAULT_CONFIG_PATH: &str = "labmap.yaml";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned());

    if let Err(err) = run(&config_path).await {
        warn!("scan failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run(config_path: &str) -> anyhow::Result<()> {
    let config = ScanConfig::load(config_path)?;
    let credentials = config.resolve_credentials();
    let timeouts = config.timeouts.to_timeouts();

    let registry = build_registry(&config)?;
    info!(adapters = ?registry.names(), subnets = ?config.subnets, "starting discovery run");

    let cancel = CancellationToken::new();
    let signal_guard = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing with partial results");
            signal_guard.cancel();
        }
    });

    let pipeline_config = PipelineConfig {
        subnets: config.subnets.clone(),
        timeouts,
        hints: config.hints.iter().map(config::HintConfig::to_hint).collect(),
        ..PipelineConfig::default()
    };
    let pipeline = ScanPipeline::new(pipeline_config, registry);
    let report = pipeline.run(credentials, cancel).await?;
    log_summary(&report);

    let store = HistoryStore::new(&config.history.dir, config.history.retain);
    let previous = store.latest()?;
    let path = store.save(&report)?;
    info!(path = %path.display(), "report persisted");

    if let Some(previous) = previous {
        let delta = diff(&previous, &report);
        if delta.is_empty() {
            info!(base = %delta.base_scan_id, "no changes since previous run");
        } else {
            for change in &delta.changes {
                info!(
                    kind = ?change.kind,
                    entity = %change.entity_id,
                    "{}", change.details
                );
            }
        }
    }

    Ok(())
}

fn build_registry(config: &ScanConfig) -> anyhow::Result<AdapterRegistry> {
    let timeout = config.timeouts.to_timeouts().adapter;
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(ProxmoxAdapter::new(Arc::new(ProxmoxHttpApi::new(
        timeout,
    )?))));
    registry.register(Arc::new(DockerAdapter::new(Arc::new(DockerHttpApi::new(
        timeout,
    )?))));
    registry.register(Arc::new(PortainerAdapter::new(Arc::new(
        PortainerHttpApi::new(timeout)?,
    ))));
    registry.register(Arc::new(UnraidAdapter::new(Arc::new(UnraidHttpApi::new(
        timeout,
    )?))));

    match (&config.gateway_ip, &config.lease_url) {
        (Some(gateway_ip), Some(lease_url)) => {
            let source = JsonLeaseSource::new(lease_url.clone(), timeout)?;
            let adapter: Arc<dyn Adapter> =
                Arc::new(RouterAdapter::new(gateway_ip.clone(), Arc::new(source)));
            registry.register(adapter);
        }
        (Some(_), None) | (None, Some(_)) => {
            warn!("router adapter needs both gateway_ip and lease_url, skipping");
        }
        (None, None) => {}
    }

    Ok(registry)
}

fn log_summary(report: &TopologyReport) {
    info!(
        scan = %report.scan_id,
        entities = report.summary.total,
        conflicts = report.summary.conflicts,
        "discovery run complete"
    );
    for (kind, count) in &report.summary.by_kind {
        info!(kind = %kind, count, "entities by kind");
    }
    for (status, count) in &report.summary.by_status {
        info!(status = %status, count, "entities by status");
    }
    for conflict in &report.conflicts {
        warn!(ip = %conflict.ip, kind = ?conflict.kind, "{}", conflict.description);
    }
}
