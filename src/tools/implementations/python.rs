// Python tool - runs short snippets through the interpreter

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use std::path::PathBuf;
use tokio::process::Command;

use super::truncate_output;
use crate::config::PythonToolConfig;
use crate::tags::ToolKind;
use crate::tools::executor::{InvocationContext, ToolError, ToolExecutor};

/// Runs the snippet passed as `argv[1]`; when it prints nothing, the last
/// value it bound is shown if it has a plain type
const RUNNER: &str = r#"
import contextlib, io, sys
namespace = {}
captured = io.StringIO()
with contextlib.redirect_stdout(captured):
    exec(compile(sys.argv[1], "<python>", "exec"), namespace)
output = captured.getvalue()
if not output.strip():
    values = [v for k, v in namespace.items() if not k.startswith("__")]
    if values and isinstance(values[-1], (int, float, str, list, dict, tuple, set, bool)):
        output = str(values[-1])
sys.stdout.write(output)
"#;

pub struct PythonTool {
    interpreter: String,
    output_dir: PathBuf,
    blocked: Vec<Regex>,
    max_output_chars: usize,
}

impl PythonTool {
    pub fn new(config: &PythonToolConfig) -> Result<Self> {
        let blocked = config
            .blocked_patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("Invalid blocked pattern: {}", pattern))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            interpreter: config.interpreter.clone(),
            output_dir: config.output_dir.clone(),
            blocked,
            max_output_chars: config.max_output_chars,
        })
    }

    /// First blocked pattern found in `code`
    fn blocked_pattern(&self, code: &str) -> Option<&str> {
        self.blocked
            .iter()
            .find(|re| re.is_match(code))
            .map(|re| re.as_str())
    }
}

#[async_trait]
impl ToolExecutor for PythonTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Python
    }

    fn description(&self) -> &str {
        "Execute a Python snippet and return what it prints"
    }

    fn supports_cancellation(&self) -> bool {
        true
    }

    async fn invoke(&self, input: &str, ctx: &InvocationContext) -> Result<String, ToolError> {
        if let Some(pattern) = self.blocked_pattern(input) {
            tracing::warn!(task_id = %ctx.task_id, pattern, "Rejected python code");
            return Err(ToolError::rejected(
                "Code contains operations that are not allowed for security reasons",
            ));
        }

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| ToolError::execution(format!("Failed to prepare output directory: {}", e)))?;

        let output = Command::new(&self.interpreter)
            .arg("-c")
            .arg(RUNNER)
            .arg(input)
            .current_dir(&self.output_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ToolError::execution(format!("Failed to execute code: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // The traceback's last line names the exception
            let message = stderr
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or("Python exited with an error")
                .to_string();
            return Err(ToolError::Execution(message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok("Code executed successfully (no output)".to_string());
        }
        Ok(truncate_output(stdout, self.max_output_chars))
    }
}
