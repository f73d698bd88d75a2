// Configuration loader
// Reads ~/.glad/config.toml (or an explicit path) and applies environment overrides

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::settings::Config;
use crate::errors::config_parse_error;

/// Default config location: ~/.glad/config.toml
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".glad").join("config.toml"))
}

/// Load configuration from `path`, the default location, or built-in defaults
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            read_config_file(path)?
        }
        None => match default_config_path() {
            Some(path) if path.exists() => read_config_file(&path)?,
            _ => {
                tracing::debug!("No config file found, using defaults");
                Config::default()
            }
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Parse and validate TOML text without consulting the environment
pub fn parse_config(text: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(text).map_err(|e| anyhow::anyhow!(config_parse_error(&e.to_string())))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    tracing::info!(path = %path.display(), "Loading configuration");
    toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!(config_parse_error(&e.to_string())))
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Apply GLAD_* and provider key variables using `lookup`
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(key) = non_empty(lookup("ANTHROPIC_API_KEY")) {
        config.model.api_key = Some(key);
    }
    if let Some(key) = non_empty(lookup("PERPLEXITY_API_KEY")) {
        config.tools.perplexity.api_key = Some(key);
    }
    if let Some(model) = non_empty(lookup("GLAD_MODEL")) {
        config.model.name = model;
    }
    if let Some(path) = non_empty(lookup("GLAD_MEMORY_PATH")) {
        config.memory.path = PathBuf::from(path);
    }

    let python = &mut config.tools.python;
    override_tool(&lookup, "PYTHON", &mut python.enabled, &mut python.timeout_seconds);
    let terminal = &mut config.tools.terminal;
    override_tool(&lookup, "TERMINAL", &mut terminal.enabled, &mut terminal.timeout_seconds);
    let perplexity = &mut config.tools.perplexity;
    override_tool(
        &lookup,
        "PERPLEXITY",
        &mut perplexity.enabled,
        &mut perplexity.timeout_seconds,
    );
}

fn override_tool<F>(lookup: &F, name: &str, enabled: &mut bool, timeout_seconds: &mut f64)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(&format!("GLAD_{}_ENABLED", name)) {
        *enabled = parse_bool(&value);
    }
    if let Some(value) = lookup(&format!("GLAD_{}_TIMEOUT_SECS", name)) {
        match value.trim().parse::<f64>() {
            Ok(secs) if secs > 0.0 => *timeout_seconds = secs,
            _ => tracing::warn!(tool = name, value = %value, "Ignoring invalid timeout override"),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
