// Console front end
//
// Interactive REPL over one conversation. Slash commands inspect the task
// ledger and memory; Ctrl-C while a response is streaming cancels it.

mod input;

pub use input::InputHandler;

use anyhow::Result;
use std::io::Write;

use crate::agent::{Agent, Conversation, Response};
use crate::ledger::{TaskFilter, TaskLedger};
use crate::memory::{MemoryQuery, MemoryStore};
use crate::runtime::Services;
use crate::tags::{Fragment, ToolKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    Clear,
    Tasks,
    Memory,
    Exit,
    Unknown(String),
}

impl Command {
    /// Parse a slash command; plain text yields None
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix('/')?;
        let name = rest.split_whitespace().next().unwrap_or("").to_lowercase();
        Some(match name.as_str() {
            "help" => Command::Help,
            "status" => Command::Status,
            "clear" => Command::Clear,
            "tasks" => Command::Tasks,
            "memory" => Command::Memory,
            "exit" | "quit" => Command::Exit,
            _ => Command::Unknown(name),
        })
    }
}

pub fn help_text(services: &Services) -> String {
    let mut text = String::from(
        "Available commands:\n\n\
        /help   - Show this help message\n\
        /status - Show system status\n\
        /clear  - Clear conversation context\n\
        /tasks  - Show active and recent tasks\n\
        /memory - Show recent memories\n\
        /exit   - Exit the program\n",
    );

    let enabled = services.registry.enabled_kinds();
    if !enabled.is_empty() {
        text.push_str("\nYou can also:\n");
        for kind in enabled {
            text.push_str(match kind {
                ToolKind::Python => "• Run Python code\n",
                ToolKind::Terminal => "• Execute terminal commands\n",
                ToolKind::Perplexity => "• Ask to search the web\n",
            });
        }
    }
    text.push_str("\nPress Ctrl-C while a response is streaming to stop it.");
    text
}

pub fn status_text(services: &Services, conversation: &Conversation) -> String {
    let counts = services.ledger.counts();
    let mut text = format!(
        "System status:\n\n\
        Context size: {} messages (~{} tokens)\n\
        Tasks: {} running, {} pending, {} completed, {} failed, {} timed out\n\n\
        Tools:\n",
        conversation.history().message_count(),
        conversation.history().estimated_tokens(),
        counts.running,
        counts.pending,
        counts.completed,
        counts.failed,
        counts.timed_out,
    );

    for kind in ToolKind::ALL {
        match services.registry.get(kind) {
            Some(reg) if reg.settings.enabled => text.push_str(&format!(
                "[✓] {} (timeout: {}s)\n",
                kind, reg.settings.timeout_seconds
            )),
            _ => text.push_str(&format!("[✗] {}\n", kind)),
        }
    }
    text
}

pub fn tasks_text(ledger: &TaskLedger) -> String {
    if ledger.is_empty() {
        return "No tasks have been executed yet.".to_string();
    }

    let mut text = String::from("Active tasks:\n");
    let active = ledger.active();
    if active.is_empty() {
        text.push_str("  none\n");
    }
    for task in &active {
        text.push_str(&format!(
            "• {} {} ({} for {}s)\n",
            task.id,
            task.kind,
            task.status,
            task.elapsed().num_seconds()
        ));
    }

    text.push_str("\nRecent tasks:\n");
    let recent: Vec<_> = ledger
        .list(&TaskFilter::default())
        .into_iter()
        .filter(|task| task.status.is_terminal())
        .take(5)
        .collect();
    if recent.is_empty() {
        text.push_str("  none\n");
    }
    for task in &recent {
        text.push_str(&format!(
            "• {} {} {} in {}ms",
            task.id,
            task.kind,
            task.status,
            task.elapsed().num_milliseconds()
        ));
        if let Some(error) = &task.error {
            text.push_str(&format!(": {}", error));
        }
        text.push('\n');
    }
    text
}

pub fn memory_text(memory: Option<&MemoryStore>, limit: usize) -> Result<String> {
    let Some(memory) = memory else {
        return Ok("Memory is disabled.".to_string());
    };
    let entries = memory.retrieve(&MemoryQuery::default().with_limit(limit))?;
    if entries.is_empty() {
        return Ok("No memories stored yet.".to_string());
    }
    let mut text = String::from("Recent memories:\n");
    for entry in entries {
        text.push_str(&format!(
            "• [{}] ({}) {}\n",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.tags.join(", "),
            entry.content
        ));
    }
    Ok(text)
}

/// One line describing a spliced tool result
fn splice_notice(fragment: &Fragment) -> Option<String> {
    match fragment {
        Fragment::Text { .. } => None,
        Fragment::ToolResult { task_id, tool, .. } => {
            Some(format!("\x1b[2m[{} {}: done]\x1b[0m", task_id, tool))
        }
        Fragment::ToolError {
            task_id,
            tool,
            class,
            ..
        } => Some(format!("\x1b[2m[{} {}: {}]\x1b[0m", task_id, tool, class)),
    }
}

fn print_response(response: &Response) {
    if response.cancelled {
        println!("\n(stopped)");
    }
    if !response.answer.is_empty() {
        println!("\nGLAD: {}\n", response.answer);
    }
}

/// Run the interactive console until /exit or end of input
pub async fn run(services: &Services, agent: Agent) -> Result<()> {
    let mut input = InputHandler::new()?;
    let mut conversation = agent.new_conversation();

    println!("GLAD console. Type /help for commands.");

    loop {
        let line = match tokio::task::block_in_place(|| input.read_line("> "))? {
            Some(line) => line,
            None => break,
        };
        if line.is_empty() {
            continue;
        }

        if let Some(command) = Command::parse(&line) {
            match command {
                Command::Help => println!("{}", help_text(services)),
                Command::Status => println!("{}", status_text(services, &conversation)),
                Command::Clear => {
                    conversation.clear();
                    println!("Conversation context has been cleared.");
                }
                Command::Tasks => println!("{}", tasks_text(&services.ledger)),
                Command::Memory => match memory_text(services.memory.as_deref(), 10) {
                    Ok(text) => println!("{}", text),
                    Err(e) => println!("Failed to read memory: {:#}", e),
                },
                Command::Exit => break,
                Command::Unknown(name) => {
                    println!("Unknown command /{}. Type /help to see available commands.", name)
                }
            }
            continue;
        }

        let cancel = conversation.cancel_handle();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });

        let result = agent
            .respond(&mut conversation, &line, |fragment| {
                if let Some(notice) = splice_notice(fragment) {
                    println!("{}", notice);
                    let _ = std::io::stdout().flush();
                }
            })
            .await;
        watcher.abort();
        conversation.reset_cancel();

        match result {
            Ok(response) => print_response(&response),
            Err(e) => eprintln!("Error: {:#}", e),
        }
    }

    if let Err(e) = input.save_history() {
        tracing::warn!(error = %e, "Failed to save input history");
    }
    Ok(())
}
