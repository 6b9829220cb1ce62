//! Coordinator service loop.
//!
//! Runs the single inbound poll loop for a supervisor and a periodic
//! maintenance sweep, until stopped. Stopping broadcasts the shutdown notice
//! and, when configured, saves a registry snapshot.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::clock;
use crate::config::Settings;
use crate::core::{AgentRegistry, MaintenanceReport, QueueManager, SupervisorCoordinator};
use crate::error::{Error, Result};
use crate::transport;

/// Coordinator daemon.
pub struct CoordinatorDaemon {
    coordinator: Arc<SupervisorCoordinator>,
    snapshot_path: Option<PathBuf>,
    running: Arc<RwLock<bool>>,
}

impl CoordinatorDaemon {
    pub fn new(coordinator: Arc<SupervisorCoordinator>) -> Self {
        Self {
            coordinator,
            snapshot_path: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Save the registry here after every sweep and on stop.
    pub fn with_snapshot(mut self, path: PathBuf) -> Self {
        self.snapshot_path = Some(path);
        self
    }

    /// Build the whole stack from settings, restoring the registry snapshot
    /// if one exists.
    pub fn from_settings(settings: &Settings) -> Self {
        let clock = clock::system();
        let transport = transport::connect(&settings.transport);
        let queue = Arc::new(QueueManager::new(transport, settings.queue.clone(), clock.clone()));
        let registry = Arc::new(AgentRegistry::new(settings.registry.clone(), clock.clone()));

        if let Some(path) = &settings.registry.snapshot_path {
            if path.exists() {
                if let Err(e) = registry.restore(path) {
                    tracing::warn!("Ignoring registry snapshot {}: {}", path.display(), e);
                }
            }
        }

        let coordinator = Arc::new(SupervisorCoordinator::new(
            settings.supervisor_id.clone(),
            queue,
            registry,
            settings.coordinator.clone(),
            clock,
        ));
        let daemon = Self::new(coordinator);
        match &settings.registry.snapshot_path {
            Some(path) => daemon.with_snapshot(path.clone()),
            None => daemon,
        }
    }

    pub fn coordinator(&self) -> &Arc<SupervisorCoordinator> {
        &self.coordinator
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Run until [`stop`](Self::stop) is called.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(Error::Other("Daemon already running".to_string()));
        }
        *running = true;
        drop(running);

        let settings = self.coordinator.settings().clone();
        tracing::info!("Coordinator daemon started for {}", self.coordinator.id());

        let mut next_sweep = Instant::now() + settings.maintenance_interval();
        loop {
            if !*self.running.read().await {
                tracing::info!("Coordinator daemon stopping");
                break;
            }

            let handled = self
                .coordinator
                .poll_inbound(settings.batch_size, settings.poll_block())
                .await;
            if handled > 0 {
                tracing::debug!("Handled {} inbound envelopes", handled);
            }

            if Instant::now() >= next_sweep {
                self.sweep().await;
                next_sweep = Instant::now() + settings.maintenance_interval();
            }
        }

        self.coordinator.shutdown().await;
        self.save_snapshot();
        Ok(())
    }

    /// Run one maintenance sweep and save the snapshot.
    pub async fn sweep(&self) -> MaintenanceReport {
        let report = self.coordinator.maintenance_sweep().await;
        if report.stale_agents > 0 || !report.stuck_tasks.is_empty() || !report.overdue_tasks.is_empty() {
            tracing::info!(
                "Maintenance: {} stale agents, {} stuck tasks, {} overdue tasks",
                report.stale_agents,
                report.stuck_tasks.len(),
                report.overdue_tasks.len()
            );
        }
        self.save_snapshot();
        report
    }

    fn save_snapshot(&self) {
        if let Some(path) = &self.snapshot_path {
            if let Err(e) = self.coordinator.registry().snapshot(path) {
                tracing::warn!("Registry snapshot failed: {}", e);
            }
        }
    }

    /// Stop the daemon.
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        tracing::info!("Coordinator daemon stopped");
    }
}

/// Run the coordinator daemon until Ctrl+C.
pub async fn run_coordinator_daemon(settings: &Settings) -> Result<()> {
    tracing::info!("Starting coordinator daemon...");

    let daemon = CoordinatorDaemon::from_settings(settings);

    // Handle Ctrl+C
    let running = daemon.running.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        let mut r = running.write().await;
        *r = false;
    });

    daemon.start().await
}
