// Terminal tool - runs allow-listed shell commands

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;

use super::truncate_output;
use crate::config::TerminalToolConfig;
use crate::tags::ToolKind;
use crate::tools::executor::{InvocationContext, ToolError, ToolExecutor};

/// Commands that may run, with the options each accepts.
/// An empty option list accepts any argument.
const ALLOWED_COMMANDS: &[(&str, &[&str])] = &[
    ("ls", &["-l", "-a", "-h", "-t", "-r", "-la", "-lh", "--help"]),
    ("cat", &["--help"]),
    ("grep", &["-i", "-n", "-r", "-l", "--help"]),
    ("pwd", &["--help"]),
    ("echo", &[]),
    ("head", &["-n", "--help"]),
    ("tail", &["-n", "--help"]),
    ("wc", &["-l", "-w", "-c", "--help"]),
    ("find", &["-name", "-type", "-size", "--help"]),
    ("sort", &["-n", "-r", "--help"]),
    ("uniq", &["-c", "-d", "-u", "--help"]),
    ("date", &["--help"]),
    ("df", &["-h", "--help"]),
    ("du", &["-h", "-s", "--help"]),
    ("ps", &["aux", "-ef", "--help"]),
];

/// Shell operators refused anywhere in the command
const DANGEROUS_OPERATORS: &[&str] = &[";", "&&", "||", "|", ">", "<", "`", "$(", "\n"];

/// Programs refused as any whitespace-separated word
const DANGEROUS_WORDS: &[&str] = &[
    "rm", "mv", "cp", "chmod", "chown", "sudo", "su", "wget", "curl", "ssh", "ftp", "kill",
    "pkill", "dd", "mkfs", "mount", "umount", "apt", "yum", "brew",
];

const REJECTION: &str = "Command not allowed for security reasons. \
    Only basic file and text processing commands are permitted.";

pub struct TerminalTool {
    working_dir: PathBuf,
    max_output_chars: usize,
}

impl TerminalTool {
    pub fn new(config: &TerminalToolConfig) -> Self {
        Self {
            working_dir: config.working_dir.clone(),
            max_output_chars: config.max_output_chars,
        }
    }
}

/// Whether `command` passes the allow-list and pattern checks
pub fn is_safe_command(command: &str) -> bool {
    let parts: Vec<&str> = command.split_whitespace().collect();
    let Some((base, args)) = parts.split_first() else {
        return false;
    };

    let Some((_, options)) = ALLOWED_COMMANDS.iter().find(|(name, _)| name == base) else {
        return false;
    };

    if DANGEROUS_OPERATORS.iter().any(|op| command.contains(op)) {
        return false;
    }
    if args.iter().any(|arg| DANGEROUS_WORDS.contains(arg)) {
        return false;
    }

    // Plain file arguments are fine; flags must be listed
    options.is_empty()
        || args
            .iter()
            .filter(|arg| arg.starts_with('-'))
            .all(|arg| options.contains(arg))
}

#[async_trait]
impl ToolExecutor for TerminalTool {
    fn kind(&self) -> ToolKind {
        ToolKind::Terminal
    }

    fn description(&self) -> &str {
        "Run a read-only shell command (ls, cat, grep, find, wc, head, tail, ...)"
    }

    fn supports_cancellation(&self) -> bool {
        true
    }

    async fn invoke(&self, input: &str, ctx: &InvocationContext) -> Result<String, ToolError> {
        let command = input.trim();
        if !is_safe_command(command) {
            tracing::warn!(task_id = %ctx.task_id, command, "Rejected terminal command");
            return Err(ToolError::rejected(REJECTION));
        }

        tracing::debug!(task_id = %ctx.task_id, command, "Running terminal command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ToolError::execution(format!("Failed to execute command: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!(
                    "Command exited with status {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr
            };
            return Err(ToolError::Execution(truncate_output(
                &message,
                self.max_output_chars,
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok("Command executed successfully (no output)".to_string());
        }
        Ok(truncate_output(stdout, self.max_output_chars))
    }
}
