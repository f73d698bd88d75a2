// GLAD - AI coworker with inline tool execution
// Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use glad::claude::ClaudeClient;
use glad::config::load_config;
use glad::console;
use glad::errors::{file_not_found_error, wrap_error_with_suggestion};
use glad::memory::MemoryQuery;
use glad::processor::{ProcessorSettings, StreamProcessor};
use glad::runtime::Services;
use glad::tags::render_all;

#[derive(Parser, Debug)]
#[command(name = "glad")]
#[command(about = "AI coworker that runs tools inline in its answers", version)]
struct Args {
    /// Run mode (interactive console when omitted)
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file (default: ~/.glad/config.toml)
    #[arg(long, global = true, env = "GLAD_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "glad::processor=debug"
    #[arg(long, global = true, env = "GLAD_LOG")]
    log: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive console
    Chat,
    /// Answer a single query and exit
    Query {
        /// Query text
        query: String,
    },
    /// Run text through the tag processor without a model
    Process {
        /// Input file (stdin when omitted)
        file: Option<PathBuf>,
    },
    /// Show stored memories
    Memory {
        /// Only entries carrying this tag
        #[arg(long)]
        tag: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    // Logs go to stderr so console output stays clean
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log.as_deref());

    let config = load_config(args.config.as_deref())?;
    let services = Services::start(config).map_err(|e| {
        anyhow::anyhow!(wrap_error_with_suggestion(
            format!("{:#}", e),
            "Check the [tools] and [memory] sections of ~/.glad/config.toml"
        ))
    })?;

    let result = match args.command {
        None | Some(Command::Chat) => run_console(&services).await,
        Some(Command::Query { query }) => run_query(&services, &query).await,
        Some(Command::Process { file }) => run_process(&services, file.as_deref()).await,
        Some(Command::Memory { tag, limit }) => run_memory(&services, tag, limit),
    };

    services.shutdown().await;
    result
}

async fn run_console(services: &Services) -> Result<()> {
    let model = Arc::new(ClaudeClient::new(&services.config.model)?);
    let agent = services.agent(model);
    console::run(services, agent).await
}

async fn run_query(services: &Services, query: &str) -> Result<()> {
    let model = Arc::new(ClaudeClient::new(&services.config.model)?);
    let agent = services.agent(model);
    let mut conversation = agent.new_conversation();

    let response = agent.respond(&mut conversation, query, |_| {}).await?;
    println!("{}", response.answer);

    if let Some(failure) = response.failure {
        anyhow::bail!("Response incomplete: {}", failure);
    }
    Ok(())
}

async fn run_process(services: &Services, file: Option<&Path>) -> Result<()> {
    let input = match file {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!(file_not_found_error(&path.display().to_string(), "Input file"));
            }
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?
        }
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read stdin")?;
            buffer
        }
    };

    let mut processor = StreamProcessor::new(
        Arc::clone(&services.registry),
        Arc::clone(&services.ledger),
        ProcessorSettings::from_config(&services.config.processor),
        CancellationToken::new(),
    );

    let mut stdout = io::stdout();
    let mut fragments = processor.feed(&input).await?;
    fragments.extend(processor.finalize()?);
    write!(stdout, "{}", render_all(&fragments))?;
    stdout.flush()?;

    let summary = processor.summary();
    eprintln!(
        "\n{} tool call(s), {} anomaly(ies), task closed: {}",
        summary.tool_calls,
        summary.anomalies,
        if summary.endtask_seen { "yes" } else { "no" }
    );
    for id in &summary.task_ids {
        if let Some(task) = services.ledger.get(*id) {
            eprintln!(
                "  {} {} {} ({}ms)",
                task.id,
                task.kind,
                task.status,
                task.elapsed().num_milliseconds()
            );
        }
    }
    Ok(())
}

fn run_memory(services: &Services, tag: Option<String>, limit: usize) -> Result<()> {
    let Some(memory) = services.memory.as_deref() else {
        println!("Memory is disabled.");
        return Ok(());
    };

    let mut query = MemoryQuery::default().with_limit(limit);
    if let Some(tag) = tag {
        query.tags.push(tag);
    }
    for entry in memory.retrieve(&query)? {
        println!(
            "[{}] ({}) {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.tags.join(", "),
            entry.content
        );
    }
    Ok(())
}
