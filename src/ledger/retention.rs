// Retention policy and periodic pruning

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::TaskLedger;
use crate::config::LedgerConfig;

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Terminal tasks older than this are evicted
    pub retention: Duration,
    /// Upper bound on stored tasks; only terminal tasks are evicted to meet it
    pub max_entries: usize,
    pub prune_interval: Duration,
}

impl RetentionPolicy {
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self {
            retention: Duration::from_secs(config.retention_secs),
            max_entries: config.max_entries,
            prune_interval: Duration::from_secs(config.prune_interval_secs),
        }
    }

    pub(crate) fn window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100))
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_config(&LedgerConfig::default())
    }
}

/// Prune `ledger` every `prune_interval` until `shutdown` is cancelled
pub fn spawn_retention(ledger: Arc<TaskLedger>, shutdown: CancellationToken) -> JoinHandle<()> {
    let interval = ledger.retention().prune_interval;

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = ledger.prune();
                    if removed > 0 {
                        tracing::info!(
                            removed,
                            remaining = ledger.len(),
                            "Evicted tasks past retention"
                        );
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::debug!("Ledger retention task stopped");
                    break;
                }
            }
        }
    })
}
