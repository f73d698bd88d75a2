// Tool registry
//
// Maps each tool kind to its executor and settings. Built once at startup and
// read-only afterwards, so it is shared behind an Arc without locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::executor::ToolExecutor;
use super::implementations::{PerplexityTool, PythonTool, TerminalTool};
use crate::config::ToolsConfig;
use crate::tags::ToolKind;

/// Timeout used when a configured value cannot be represented
const FALLBACK_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSettings {
    pub enabled: bool,
    pub timeout_seconds: f64,
    /// Retry once when the tool reports an execution failure
    pub retry_on_error: bool,
}

impl ToolSettings {
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_seconds)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs(FALLBACK_TIMEOUT_SECS))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = timeout.as_secs_f64();
        self
    }

    pub fn with_retry(mut self, retry_on_error: bool) -> Self {
        self.retry_on_error = retry_on_error;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: 30.0,
            retry_on_error: false,
        }
    }
}

#[derive(Clone)]
pub struct ToolRegistration {
    pub executor: Arc<dyn ToolExecutor>,
    pub settings: ToolSettings,
}

pub struct ToolRegistry {
    tools: HashMap<ToolKind, ToolRegistration>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    /// Registry with the built-in python, terminal and perplexity executors
    pub fn from_config(config: &ToolsConfig) -> anyhow::Result<Self> {
        let registry = Self::builder()
            .register(
                Arc::new(PythonTool::new(&config.python)?),
                config.python.settings(),
            )
            .register(
                Arc::new(TerminalTool::new(&config.terminal)),
                config.terminal.settings(),
            )
            .register(
                Arc::new(PerplexityTool::new(&config.perplexity)?),
                config.perplexity.settings(),
            )
            .build();

        tracing::info!(
            enabled = ?registry.enabled_kinds(),
            "Tool registry ready"
        );
        Ok(registry)
    }

    /// Registration for `kind` if it exists and is enabled
    pub fn resolve(&self, kind: ToolKind) -> Option<&ToolRegistration> {
        self.tools.get(&kind).filter(|reg| reg.settings.enabled)
    }

    /// Registration for `kind`, enabled or not
    pub fn get(&self, kind: ToolKind) -> Option<&ToolRegistration> {
        self.tools.get(&kind)
    }

    /// Enabled kinds in tag order
    pub fn enabled_kinds(&self) -> Vec<ToolKind> {
        let mut kinds: Vec<ToolKind> = self
            .tools
            .iter()
            .filter(|(_, reg)| reg.settings.enabled)
            .map(|(kind, _)| *kind)
            .collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: HashMap<ToolKind, ToolRegistration>,
}

impl ToolRegistryBuilder {
    /// Register `executor` under its own kind; a later registration replaces an earlier one
    pub fn register(mut self, executor: Arc<dyn ToolExecutor>, settings: ToolSettings) -> Self {
        let kind = executor.kind();
        self.tools
            .insert(kind, ToolRegistration { executor, settings });
        self
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}
