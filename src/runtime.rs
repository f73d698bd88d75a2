// Shared services for every front end
//
// Owns the registry, ledger and memory store that all conversations share,
// plus the background retention task.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentSettings, ModelClient};
use crate::config::Config;
use crate::ledger::{spawn_retention, RetentionPolicy, TaskLedger};
use crate::memory::MemoryStore;
use crate::tools::ToolRegistry;

pub struct Services {
    pub config: Config,
    pub registry: Arc<ToolRegistry>,
    pub ledger: Arc<TaskLedger>,
    pub memory: Option<Arc<MemoryStore>>,
    shutdown: CancellationToken,
    retention: Option<JoinHandle<()>>,
}

impl Services {
    /// Build shared state and start the retention task; needs a tokio runtime
    pub fn start(config: Config) -> Result<Self> {
        let registry = Arc::new(
            ToolRegistry::from_config(&config.tools).context("Failed to set up tools")?,
        );
        let ledger = Arc::new(TaskLedger::new(RetentionPolicy::from_config(&config.ledger)));

        let memory = if config.memory.enabled {
            let store = MemoryStore::open(&config.memory.path).with_context(|| {
                format!("Failed to open memory store {}", config.memory.path.display())
            })?;
            Some(Arc::new(store))
        } else {
            None
        };

        let shutdown = CancellationToken::new();
        let retention = spawn_retention(Arc::clone(&ledger), shutdown.clone());

        Ok(Self {
            config,
            registry,
            ledger,
            memory,
            shutdown,
            retention: Some(retention),
        })
    }

    pub fn agent(&self, model: Arc<dyn ModelClient>) -> Agent {
        Agent::new(
            model,
            Arc::clone(&self.registry),
            Arc::clone(&self.ledger),
            self.memory.clone(),
            AgentSettings::from_config(&self.config),
        )
    }

    /// Stop background work and wait for it to finish
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.retention.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Retention task ended abnormally");
            }
        }
    }
}
