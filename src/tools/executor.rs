// Tool executor trait and invocation context
//
// An executor turns the raw text of a tool region into output. It never sees
// the surrounding stream and never touches the ledger.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::ledger::TaskId;
use crate::tags::{ErrorClass, ToolKind};

/// Why a tool invocation produced no output
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    /// Input refused before anything ran (safety check, missing credential)
    #[error("{0}")]
    Rejected(String),

    /// The tool ran and failed
    #[error("{0}")]
    Execution(String),

    /// Deadline passed before the tool finished
    #[error("Tool execution timed out after {} seconds", format_secs(.0))]
    Timeout(Duration),
}

impl ToolError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        ToolError::Rejected(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        ToolError::Execution(msg.into())
    }

    /// Only execution failures are worth a second attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::Execution(_))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ToolError::Rejected(_) => ErrorClass::Rejected,
            ToolError::Execution(_) => ErrorClass::Failed,
            ToolError::Timeout(_) => ErrorClass::Timeout,
        }
    }
}

/// Whole seconds print without a fraction: 30 not 30.0
pub fn format_secs(duration: &Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs.fract() == 0.0 {
        format!("{}", duration.as_secs())
    } else {
        format!("{}", secs)
    }
}

/// Per-invocation data handed to an executor
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub task_id: TaskId,
    pub timeout: Duration,
    /// Cancelled when the owning stream is cancelled
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn kind(&self) -> ToolKind;

    /// One-line description used in the system prompt
    fn description(&self) -> &str;

    /// Whether aborting `invoke` mid-flight leaves nothing running behind it
    fn supports_cancellation(&self) -> bool {
        false
    }

    async fn invoke(&self, input: &str, ctx: &InvocationContext) -> Result<String, ToolError>;
}
