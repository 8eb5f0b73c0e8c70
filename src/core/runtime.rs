//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: truncation (log replay, startup pass) → coordinator → retransmit sweep
//! - Shutdown order: retransmit sweep → coordinator → truncation reapers

use crate::cluster::memory::{CountingSindex, MemStore, QueueTransport, StaticPartitionMap};
use crate::cluster::ReplicaSet;
use crate::core::config::Config;
use crate::core::time::SystemClock;
use crate::ops::observability::{HealthStatus, KeystoneMetrics};
use crate::rw::{Coordinator, CoordinatorDeps};
use crate::truncate::TruncationRegistry;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component is degraded but functional.
    Degraded,
    /// Component has failed.
    Failed,
    /// Component is stopping.
    Stopping,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// Truncation registry and its reapers.
    pub truncation: ComponentHealth,
    /// Write coordinator.
    pub coordinator: ComponentHealth,
    /// Retransmit sweep task.
    pub sweeper: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            truncation: ComponentHealth::Starting,
            coordinator: ComponentHealth::Starting,
            sweeper: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        matches!(
            (self.truncation, self.coordinator, self.sweeper),
            (
                ComponentHealth::Healthy | ComponentHealth::Degraded,
                ComponentHealth::Healthy,
                ComponentHealth::Healthy
            )
        )
    }

    /// Check if the runtime is alive (not failed).
    pub fn is_alive(&self) -> bool {
        ![self.truncation, self.coordinator, self.sweeper].contains(&ComponentHealth::Failed)
    }
}

/// Keystone runtime holding all component handles.
pub struct Runtime {
    /// Configuration.
    config: Arc<Config>,

    /// Shared metrics.
    metrics: Arc<KeystoneMetrics>,

    /// Collaborators handed to the coordinator.
    deps: CoordinatorDeps,

    /// Truncation registry (if started).
    truncation: Option<Arc<TruncationRegistry>>,

    /// Write coordinator (if started).
    coordinator: Option<Arc<Coordinator>>,

    /// Runtime health status.
    health: RuntimeHealth,

    /// Whether the runtime is running.
    running: Arc<AtomicBool>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,

    /// Retransmit sweep task handle.
    sweep_handle: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Create a standalone runtime: an in-memory store and a partition map
    /// in which this node masters every partition with no replicas.
    pub fn new(config: Config) -> Result<Self> {
        let master = ReplicaSet::new(config.node.node_id, Vec::new());
        let deps = CoordinatorDeps {
            store: Arc::new(MemStore::new()),
            partitions: Arc::new(StaticPartitionMap::new(
                config.namespaces.len() as u32,
                master,
            )),
            transport: Arc::new(QueueTransport::new()),
            sindex: Arc::new(CountingSindex::new()),
            clock: Arc::new(SystemClock),
        };
        Self::with_deps(config, deps)
    }

    /// Create a runtime over caller-supplied collaborators.
    pub fn with_deps(config: Config, deps: CoordinatorDeps) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            metrics: Arc::new(KeystoneMetrics::new()),
            deps,
            truncation: None,
            coordinator: None,
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            sweep_handle: None,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the shared metrics.
    pub fn metrics(&self) -> &Arc<KeystoneMetrics> {
        &self.metrics
    }

    /// Get the coordinator (if started).
    pub fn coordinator(&self) -> Option<&Arc<Coordinator>> {
        self.coordinator.as_ref()
    }

    /// Get the truncation registry (if started).
    pub fn truncation(&self) -> Option<&Arc<TruncationRegistry>> {
        self.truncation.as_ref()
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    /// Readiness summary for probes.
    pub fn health_status(&self) -> HealthStatus {
        if self.health.is_ready() {
            return HealthStatus::healthy();
        }
        let h = &self.health;
        HealthStatus::unhealthy(format!(
            "truncation={:?} coordinator={:?} sweeper={:?}",
            h.truncation, h.coordinator, h.sweeper
        ))
    }

    /// Check if the runtime is alive.
    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Initialize and start all runtime components.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            node_id = self.config.node.node_id,
            storage_dir = %self.config.node.storage_dir,
            namespaces = self.config.namespaces.len(),
            "starting Keystone runtime"
        );

        self.init_truncation()?;
        self.init_coordinator()?;
        self.start_sweeper();

        self.running.store(true, Ordering::Release);
        tracing::info!("Keystone runtime started");
        Ok(())
    }

    /// Replay the truncation log and run the startup pass.
    fn init_truncation(&mut self) -> Result<()> {
        tracing::debug!("initializing truncation registry");

        let registry = TruncationRegistry::open(
            &self.config,
            Arc::clone(&self.deps.store),
            Arc::clone(&self.deps.sindex),
            Arc::clone(&self.deps.clock),
            Arc::clone(&self.metrics),
        )
        .context("failed to open truncate log")?;
        let registry = Arc::new(registry);
        registry.done_startup();

        self.truncation = Some(registry);
        self.health.truncation = ComponentHealth::Healthy;
        tracing::info!("truncation registry initialized");
        Ok(())
    }

    fn init_coordinator(&mut self) -> Result<()> {
        let truncation = self
            .truncation
            .clone()
            .context("truncation registry not initialized")?;
        let coordinator = Coordinator::new(
            Arc::clone(&self.config),
            truncation,
            self.deps.clone(),
            Arc::clone(&self.metrics),
        );
        self.coordinator = Some(Arc::new(coordinator));
        self.health.coordinator = ComponentHealth::Healthy;
        tracing::info!(node_id = self.config.node.node_id, "write coordinator initialized");
        Ok(())
    }

    /// Spawn the retransmit sweep on the tokio runtime.
    fn start_sweeper(&mut self) {
        let Some(coordinator) = self.coordinator.clone() else {
            self.health.sweeper = ComponentHealth::Failed;
            return;
        };
        let period = Duration::from_millis(self.config.transaction.retransmit_ms.max(1));
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        coordinator.retransmit_sweep();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("retransmit sweep stopped");
        });

        self.sweep_handle = Some(handle);
        self.health.sweeper = ComponentHealth::Healthy;
        tracing::info!(period_ms = period.as_millis() as u64, "retransmit sweep started");
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for shutdown signal.
    pub async fn wait_for_shutdown(&mut self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Run the runtime until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await
    }

    /// Stop all runtime components in reverse start order.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping Keystone runtime");
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        self.health.sweeper = ComponentHealth::Stopping;
        if let Some(handle) = self.sweep_handle.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "retransmit sweep task panicked"),
                Err(_) => tracing::warn!("retransmit sweep stop timed out"),
            }
        }
        self.health.sweeper = ComponentHealth::Stopped;

        self.health.coordinator = ComponentHealth::Stopping;
        if let Some(coordinator) = self.coordinator.take() {
            let in_flight = coordinator.in_flight();
            if in_flight > 0 {
                tracing::warn!(in_flight, "stopping with transactions in flight");
                coordinator.registry().dump();
            }
        }
        self.health.coordinator = ComponentHealth::Stopped;

        self.health.truncation = ComponentHealth::Stopping;
        if let Some(truncation) = self.truncation.take() {
            truncation.shutdown();
            tokio::task::spawn_blocking(move || truncation.drain())
                .await
                .context("truncate reaper drain panicked")?;
        }
        self.health.truncation = ComponentHealth::Stopped;

        tracing::debug!(metrics = %self.metrics.export(), "final metrics");
        tracing::info!("Keystone runtime stopped");
        Ok(())
    }
}
