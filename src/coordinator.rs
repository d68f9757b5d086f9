use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::FarmConfig;
use crate::gateway::{run_gateway, GatewayState};
use crate::props::PropRegistry;
use crate::scheduler::{Assigner, JobStore, NodeRegistry};

/// Owns the three stores and runs the background sweep plus the gateway.
pub struct Coordinator {
    pub config: FarmConfig,
    pub nodes: Arc<NodeRegistry>,
    pub store: Arc<JobStore>,
    pub assigner: Arc<Assigner>,
    pub props: Arc<PropRegistry>,
}

impl Coordinator {
    pub fn new(config: FarmConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: FarmConfig, clock: Arc<dyn Clock>) -> Self {
        let nodes = Arc::new(NodeRegistry::new(
            config.scheduler.heartbeat_timeout(),
            clock.clone(),
        ));
        let store = Arc::new(JobStore::new(config.scheduler.clone(), clock.clone()));
        let assigner = Arc::new(Assigner::new(store.clone(), nodes.clone()));
        let props = Arc::new(PropRegistry::new(clock));

        Self {
            config,
            nodes,
            store,
            assigner,
            props,
        }
    }

    pub fn gateway_state(&self) -> GatewayState {
        GatewayState {
            nodes: self.nodes.clone(),
            store: self.store.clone(),
            assigner: self.assigner.clone(),
            props: self.props.clone(),
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// 1. Spawns the sweep loop (offline nodes, expired leases)
    /// 2. Serves the gateway on `config.listen_addr` (blocking)
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway cannot bind or fails while serving.
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let sweep_nodes = self.nodes.clone();
        let sweep_assigner = self.assigner.clone();
        let sweep_interval = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        let sweep_shutdown = shutdown.clone();
        let sweeper = tokio::spawn(async move {
            Self::sweep_loop(sweep_nodes, sweep_assigner, sweep_interval, sweep_shutdown).await;
        });

        let result = run_gateway(self.config.listen_addr, self.gateway_state(), shutdown.clone()).await;

        shutdown.cancel();
        if let Err(e) = sweeper.await {
            tracing::warn!(error = %e, "Sweep loop ended abnormally");
        }
        tracing::info!("Coordinator stopped");
        result
    }

    /// Periodic liveness and lease sweep.
    ///
    /// Reads already sweep lazily; this loop bounds how stale the state can get
    /// when nobody is polling.
    async fn sweep_loop(
        nodes: Arc<NodeRegistry>,
        assigner: Arc<Assigner>,
        period: Duration,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let offline = nodes.sweep();
                    let reclaimed = assigner.reclaim_expired();
                    if !offline.is_empty() || !reclaimed.is_empty() {
                        tracing::debug!(
                            offline = offline.len(),
                            reclaimed = reclaimed.len(),
                            "Sweep pass"
                        );
                    }
                }
            }
        }
    }
}
