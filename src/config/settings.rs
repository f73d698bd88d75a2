// Configuration structs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::tools::ToolSettings;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be > 0")]
    NonPositive(&'static str),

    #[error("invalid pattern in {field}: {pattern}")]
    InvalidPattern { field: &'static str, pattern: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub tools: ToolsConfig,
    pub ledger: LedgerConfig,
    pub conversation: ConversationConfig,
    pub processor: ProcessorConfig,
    pub memory: MemoryConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.max_tokens == 0 {
            return Err(ConfigError::NonPositive("model.max_tokens"));
        }
        if self.model.request_timeout_secs == 0 {
            return Err(ConfigError::NonPositive("model.request_timeout_secs"));
        }
        for (field, settings) in [
            ("tools.python.timeout_seconds", self.tools.python.settings()),
            ("tools.terminal.timeout_seconds", self.tools.terminal.settings()),
            ("tools.perplexity.timeout_seconds", self.tools.perplexity.settings()),
        ] {
            if !(settings.timeout_seconds > 0.0 && settings.timeout_seconds.is_finite()) {
                return Err(ConfigError::NonPositive(field));
            }
        }
        for pattern in &self.tools.python.blocked_patterns {
            if regex::Regex::new(pattern).is_err() {
                return Err(ConfigError::InvalidPattern {
                    field: "tools.python.blocked_patterns",
                    pattern: pattern.clone(),
                });
            }
        }
        if self.ledger.max_entries == 0 {
            return Err(ConfigError::NonPositive("ledger.max_entries"));
        }
        if self.ledger.prune_interval_secs == 0 {
            return Err(ConfigError::NonPositive("ledger.prune_interval_secs"));
        }
        if self.conversation.max_messages == 0 {
            return Err(ConfigError::NonPositive("conversation.max_messages"));
        }
        if self.processor.max_region_bytes == 0 {
            return Err(ConfigError::NonPositive("processor.max_region_bytes"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub max_tokens: u32,
    pub api_url: String,
    pub request_timeout_secs: u64,
    /// Usually supplied through ANTHROPIC_API_KEY
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "claude-3-5-sonnet-latest".to_string(),
            max_tokens: 4096,
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
            request_timeout_secs: 120,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub python: PythonToolConfig,
    pub terminal: TerminalToolConfig,
    pub perplexity: PerplexityToolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PythonToolConfig {
    pub enabled: bool,
    pub timeout_seconds: f64,
    pub retry_on_error: bool,
    pub interpreter: String,
    /// Working directory for executed code
    pub output_dir: PathBuf,
    /// Regexes (case-insensitive) that reject code before it runs
    pub blocked_patterns: Vec<String>,
    pub max_output_chars: usize,
}

impl PythonToolConfig {
    pub fn settings(&self) -> ToolSettings {
        ToolSettings {
            enabled: self.enabled,
            timeout_seconds: self.timeout_seconds,
            retry_on_error: self.retry_on_error,
        }
    }
}

impl Default for PythonToolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: 30.0,
            retry_on_error: false,
            interpreter: "python3".to_string(),
            output_dir: PathBuf::from("output"),
            blocked_patterns: default_python_blocked_patterns(),
            max_output_chars: 10_000,
        }
    }
}

fn default_python_blocked_patterns() -> Vec<String> {
    [
        r"\bimport\s+(os|sys|subprocess|shutil|socket)\b",
        r"\bfrom\s+(os|sys|subprocess|shutil|socket)\b",
        r"__import__",
        r"\beval\s*\(",
        r"\bexec\s*\(",
        r"\bopen\s*\(",
        r"\b(os|sys|subprocess)\.",
        r"\bglobals\s*\(",
        r"\blocals\s*\(",
    ]
    .iter()
    .map(|pattern| pattern.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalToolConfig {
    pub enabled: bool,
    pub timeout_seconds: f64,
    pub retry_on_error: bool,
    pub working_dir: PathBuf,
    pub max_output_chars: usize,
}

impl TerminalToolConfig {
    pub fn settings(&self) -> ToolSettings {
        ToolSettings {
            enabled: self.enabled,
            timeout_seconds: self.timeout_seconds,
            retry_on_error: self.retry_on_error,
        }
    }
}

impl Default for TerminalToolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: 30.0,
            retry_on_error: false,
            working_dir: PathBuf::from("."),
            max_output_chars: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerplexityToolConfig {
    pub enabled: bool,
    pub timeout_seconds: f64,
    pub retry_on_error: bool,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub cache_ttl_secs: u64,
    /// Usually supplied through PERPLEXITY_API_KEY
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl PerplexityToolConfig {
    pub fn settings(&self) -> ToolSettings {
        ToolSettings {
            enabled: self.enabled,
            timeout_seconds: self.timeout_seconds,
            retry_on_error: self.retry_on_error,
        }
    }
}

impl Default for PerplexityToolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: 30.0,
            retry_on_error: true,
            base_url: "https://api.perplexity.ai".to_string(),
            model: "sonar-pro".to_string(),
            max_tokens: 300,
            temperature: 0.7,
            cache_ttl_secs: 300,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub retention_secs: u64,
    pub max_entries: usize,
    pub prune_interval_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention_secs: 3600,
            max_entries: 1000,
            prune_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub max_messages: usize,
    /// Rough budget: 1 token ≈ 4 characters
    pub max_context_chars: usize,
    pub max_continuations: usize,
    /// Cut a model turn right after the first spliced tool result
    pub stop_after_tool: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_messages: 20,
            max_context_chars: 32_000,
            max_continuations: 5,
            stop_after_tool: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Largest open region before it degrades to literal text
    pub max_region_bytes: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_region_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("memory/long_term.jsonl"),
        }
    }
}
