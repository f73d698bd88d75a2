// User-friendly error messages
//
// Helpers that turn technical failures into actionable messages, plus
// re-exports of the error enums each module exposes at its seam.

use std::fmt;

pub use crate::config::ConfigError;
pub use crate::ledger::LedgerError;
pub use crate::processor::ProcessorError;
pub use crate::tools::ToolError;

/// Appended to a response whose stream failed part way through
pub const STREAM_FAILURE_NOTICE: &str =
    "I encountered an error while processing your request. Please try again.";

/// Format a config parse error with helpful suggestions
pub fn config_parse_error(error: &str) -> String {
    format!(
        "Failed to parse config file\n\n\
        \x1b[1;33mError:\x1b[0m {}\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. Check config file syntax:\n\
           \x1b[36mcat ~/.glad/config.toml\x1b[0m\n\n\
        2. Move it aside to fall back to defaults:\n\
           \x1b[36mmv ~/.glad/config.toml ~/.glad/config.toml.backup\x1b[0m\n\n\
        3. Common mistakes:\n\
           • Missing quotes around strings\n\
           • Unclosed brackets []\n\
           • Numbers where booleans are expected",
        error
    )
}

/// Format a missing API key error
pub fn api_key_missing_error(provider: &str, env_var: &str) -> String {
    format!(
        "{} API key is not configured\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. Export it for this shell:\n\
           \x1b[36mexport {}=...\x1b[0m\n\n\
        2. Or add it to your config file:\n\
           \x1b[36m~/.glad/config.toml\x1b[0m",
        provider, env_var
    )
}

/// Format an HTTP error returned by a model provider
pub fn provider_http_error(provider: &str, status: u16, body: &str) -> String {
    let hint = match status {
        401 | 403 => "Check that your API key is valid",
        404 => "Check the configured model name and API URL",
        429 => "Rate limited; wait a moment and retry",
        500..=599 => "The provider is having trouble; retry shortly",
        _ => "See the response body above",
    };
    format!(
        "{} API error ({}): {}\n\n\x1b[1;32mSuggestion:\x1b[0m {}",
        provider,
        status,
        body.trim(),
        hint
    )
}

/// Format a file not found error
pub fn file_not_found_error(path: &str, description: &str) -> String {
    format!(
        "{} not found: {}\n\n\
        \x1b[1;33mPossible causes:\x1b[0m\n\
        • File has been deleted or moved\n\
        • Path is relative to a different directory\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        \x1b[36mls -la {}\x1b[0m",
        description, path, path
    )
}

/// Wrap any error with a suggestion line
pub fn wrap_error_with_suggestion(error: impl fmt::Display, suggestion: &str) -> String {
    format!(
        "{}\n\n\x1b[1;32mSuggestion:\x1b[0m {}",
        error, suggestion
    )
}
