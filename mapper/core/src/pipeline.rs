use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    context::{Credentials, ScanContext, Timeouts},
    conflict::detect_conflicts,
    correlate::correlate,
    hint::{Hint, apply_hints},
    orchestrator::Orchestrator,
    probe::{DEFAULT_PROBE_WIDTH, PortProber},
    registry::AdapterRegistry,
    report::{TopologyReport, scan_id_for},
    sweep::{DEFAULT_SUBNET_CAP, DEFAULT_SWEEP_WIDTH, HostSweeper, Pinger, SweepError, TcpPinger},
};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Sweep(#[from] SweepError),
    #[error("failed to build HTTP clients: {source}")]
    HttpClient {
        #[source]
        source: reqwest::Error,
    },
}

/// Knobs for a full discovery run.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub subnets: Vec<String>,
    pub timeouts: Timeouts,
    pub sweep_width: usize,
    pub probe_width: usize,
    pub subnet_cap: usize,
    pub hints: Vec<Hint>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            subnets: Vec::new(),
            timeouts: Timeouts::default(),
            sweep_width: DEFAULT_SWEEP_WIDTH,
            probe_width: DEFAULT_PROBE_WIDTH,
            subnet_cap: DEFAULT_SUBNET_CAP,
            hints: Vec::new(),
        }
    }
}

/// The phased discovery run: sweep, probe, hints, adapter expansion,
/// correlation, conflict detection, assembly.
///
/// Cancellation at any phase still produces a report from whatever finished.
pub struct ScanPipeline {
    config: PipelineConfig,
    registry: AdapterRegistry,
    pinger: Arc<dyn Pinger>,
}

impl ScanPipeline {
    #[must_use]
    pub fn new(config: PipelineConfig, registry: AdapterRegistry) -> Self {
        Self {
            config,
            registry,
            pinger: Arc::new(TcpPinger),
        }
    }

    #[must_use]
    pub fn with_pinger(mut self, pinger: Arc<dyn Pinger>) -> Self {
        self.pinger = pinger;
        self
    }

    pub async fn run(
        &self,
        credentials: Credentials,
        cancel: CancellationToken,
    ) -> Result<TopologyReport, PipelineError> {
        let timeouts = self.config.timeouts;
        let mut ctx = ScanContext::new(credentials, timeouts, cancel.clone())
            .map_err(|source| PipelineError::HttpClient { source })?;

        let sweeper = HostSweeper::new(Arc::clone(&self.pinger), timeouts.ping)
            .with_width(self.config.sweep_width)
            .with_subnet_cap(self.config.subnet_cap);
        let swept = sweeper.sweep(&self.config.subnets, &cancel).await?;
        info!(hosts = swept.len(), "sweep phase complete");
        ctx.set_swept(swept.iter().map(ToString::to_string));

        let prober = PortProber::new(timeouts.probe_per_port, timeouts.http)
            .map_err(|source| PipelineError::HttpClient { source })?
            .with_width(self.config.probe_width);
        let probes = swept.iter().map(|ip| {
            let prober = &prober;
            let cancel = &cancel;
            async move {
                if cancel.is_cancelled() {
                    None
                } else {
                    Some(prober.probe(*ip).await)
                }
            }
        });
        let mut fingerprinted: Vec<_> = join_all(probes).await.into_iter().flatten().collect();
        info!(hosts = fingerprinted.len(), "probe phase complete");

        apply_hints(&mut fingerprinted, &self.config.hints);
        for hint in &self.config.hints {
            ctx.mark_routable(hint.ip.clone());
        }

        let orchestrator = Orchestrator::new(self.registry.clone());
        let mut universe = orchestrator.run(fingerprinted, &ctx).await;
        info!(entities = universe.len(), "adapter expansion complete");

        correlate(&mut universe, ctx.swept());
        let conflicts = detect_conflicts(&mut universe);
        if !conflicts.is_empty() {
            info!(count = conflicts.len(), "conflicts detected");
        }

        let now = Utc::now();
        Ok(TopologyReport::assemble(
            scan_id_for(now),
            now,
            self.config.subnets.clone(),
            universe,
            conflicts,
        ))
    }
}
