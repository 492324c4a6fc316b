use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use super::orchestrator::Orchestrator;

#[derive(Debug, Clone)]
pub struct StatusSyncWorkerConfig {
    pub interval: Duration,
}

impl Default for StatusSyncWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Periodically refreshes the observed status of every idle endpoint.
pub struct StatusSyncWorker {
    orchestrator: Arc<Orchestrator>,
    config: StatusSyncWorkerConfig,
}

impl StatusSyncWorker {
    pub fn new(orchestrator: Arc<Orchestrator>, config: StatusSyncWorkerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    #[instrument(skip(self, shutdown), name = "status_sync_worker")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting status sync worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sync_pass().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Status sync worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn sync_pass(&self) {
        match self.orchestrator.sync_all().await {
            Ok(stats) if stats.updated > 0 || stats.failed > 0 => {
                info!(
                    checked = stats.checked,
                    updated = stats.updated,
                    skipped = stats.skipped,
                    failed = stats.failed,
                    "Status sync pass complete"
                );
            }
            Ok(stats) => debug!(checked = stats.checked, "Status sync pass complete"),
            Err(e) => error!(error = %e, "Status sync pass failed"),
        }
    }
}
