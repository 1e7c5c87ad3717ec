//! Agent lifecycle: wires the store, collector, and sweeper together and
//! owns the background loops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collector::Collector;
use crate::config::Config;
use crate::export::HealthMetrics;
use crate::store::Store;

/// Agent orchestrates all components: store, collector, sweeper, health server.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    store: Option<Arc<Store>>,
    collect_task: Option<JoinHandle<()>>,
    sweep_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            store: None,
            collect_task: None,
            sweep_task: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin polling.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server (before the store opens so probes respond).
        self.health
            .start()
            .await
            .context("starting health metrics server")?;
        info!("health metrics server started");

        // 1. Open the store and bring the schema up to date.
        let store = Arc::new(
            Store::open(&self.cfg.store.path)
                .await
                .context("opening store")?,
        );
        info!(path = %self.cfg.store.path.display(), "store ready");

        // 2. Build the collector over the configured servers.
        let collector = Collector::new(
            Arc::clone(&store),
            self.cfg.servers.clone(),
            Arc::clone(&self.health),
        );
        info!(servers = self.cfg.servers.len(), "collector ready");

        // 3. Start the poll loop.
        self.collect_task = Some(self.spawn_collection_loop(collector));

        // 4. Start the retention sweeper.
        self.sweep_task = Some(self.spawn_retention_sweeper(Arc::clone(&store)));

        self.store = Some(store);

        info!("agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        // Let an in-flight cycle finish before the store closes under it.
        if let Some(task) = self.collect_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "collection task panicked");
            }
        }
        if let Some(task) = self.sweep_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "sweeper task panicked");
            }
        }

        if let Some(store) = self.store.take() {
            store.close().await;
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    /// Spawn the reconciliation poll loop.
    fn spawn_collection_loop(&self, collector: Collector) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let poll_interval = self.cfg.poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            // The first tick fires immediately, so a cycle runs at startup.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        collector.run_cycle(Utc::now()).await;
                    }
                }
            }
        })
    }

    /// Spawn the retention sweeper.
    fn spawn_retention_sweeper(&self, store: Arc<Store>) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let sessions_horizon = self.cfg.retention.sessions;
        let traffic_horizon = self.cfg.retention.traffic;
        let sweep_interval = self.cfg.retention.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Consume the immediate first tick; the first sweep happens one
            // full interval after startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        sweep_once(&store, &health, sessions_horizon, traffic_horizon).await;
                    }
                }
            }
        })
    }
}

async fn sweep_once(
    store: &Store,
    health: &HealthMetrics,
    sessions_horizon: Duration,
    traffic_horizon: Duration,
) {
    match store
        .prune_expired(Utc::now(), sessions_horizon, traffic_horizon)
        .await
    {
        Ok(outcome) => {
            health
                .retention_removed
                .with_label_values(&["sessions"])
                .inc_by(outcome.sessions_removed as f64);
            health
                .retention_removed
                .with_label_values(&["samples"])
                .inc_by(outcome.samples_removed as f64);
            info!(
                sessions = outcome.sessions_removed,
                samples = outcome.samples_removed,
                "retention sweep finished",
            );
        }
        Err(e) => {
            warn!(error = %e, "retention sweep failed");
        }
    }
}
