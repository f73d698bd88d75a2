// Shared fixtures for integration tests
#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use glad::agent::{ModelClient, TurnRequest};
use glad::ledger::TaskLedger;
use glad::processor::{ProcessorSettings, StreamProcessor};
use glad::tags::{render_all, ToolKind};
use glad::tools::{InvocationContext, ToolError, ToolExecutor, ToolRegistry, ToolSettings};

type Handler = Box<dyn Fn(&str) -> Result<String, ToolError> + Send + Sync>;

/// Executor backed by a closure; records every input it receives
pub struct FnTool {
    kind: ToolKind,
    handler: Handler,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl FnTool {
    pub fn new<F>(kind: ToolKind, handler: F) -> Self
    where
        F: Fn(&str) -> Result<String, ToolError> + Send + Sync + 'static,
    {
        Self {
            kind,
            handler: Box::new(handler),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns its input uppercased
    pub fn upper(kind: ToolKind) -> Self {
        Self::new(kind, |input| Ok(input.to_uppercase()))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for FnTool {
    fn kind(&self) -> ToolKind {
        self.kind
    }

    fn description(&self) -> &str {
        "test tool"
    }

    async fn invoke(&self, input: &str, _ctx: &InvocationContext) -> Result<String, ToolError> {
        self.calls.lock().unwrap().push(input.to_string());
        (self.handler)(input)
    }
}

/// Sleeps before answering "done"
pub struct SlowTool {
    kind: ToolKind,
    delay: Duration,
    cooperative: bool,
    pub finished: Arc<AtomicUsize>,
}

impl SlowTool {
    pub fn new(kind: ToolKind, delay: Duration, cooperative: bool) -> Self {
        Self {
            kind,
            delay,
            cooperative,
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl ToolExecutor for SlowTool {
    fn kind(&self) -> ToolKind {
        self.kind
    }

    fn description(&self) -> &str {
        "slow test tool"
    }

    fn supports_cancellation(&self) -> bool {
        self.cooperative
    }

    async fn invoke(&self, _input: &str, _ctx: &InvocationContext) -> Result<String, ToolError> {
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok("done".to_string())
    }
}

/// Fails with an Execution error for the first `failures` attempts
pub struct FlakyTool {
    kind: ToolKind,
    failures: usize,
    pub attempts: Arc<AtomicUsize>,
}

impl FlakyTool {
    pub fn new(kind: ToolKind, failures: usize) -> Self {
        Self {
            kind,
            failures,
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl ToolExecutor for FlakyTool {
    fn kind(&self) -> ToolKind {
        self.kind
    }

    fn description(&self) -> &str {
        "flaky test tool"
    }

    async fn invoke(&self, _input: &str, _ctx: &InvocationContext) -> Result<String, ToolError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            Err(ToolError::execution("flaky"))
        } else {
            Ok(format!("ok after {}", attempt))
        }
    }
}

pub fn registry(tools: Vec<(Arc<dyn ToolExecutor>, ToolSettings)>) -> Arc<ToolRegistry> {
    let builder = tools
        .into_iter()
        .fold(ToolRegistry::builder(), |builder, (executor, settings)| {
            builder.register(executor, settings)
        });
    Arc::new(builder.build())
}

pub fn processor(registry: Arc<ToolRegistry>) -> (StreamProcessor, Arc<TaskLedger>) {
    processor_with(registry, ProcessorSettings::default(), CancellationToken::new())
}

pub fn processor_with(
    registry: Arc<ToolRegistry>,
    settings: ProcessorSettings,
    cancel: CancellationToken,
) -> (StreamProcessor, Arc<TaskLedger>) {
    let ledger = Arc::new(TaskLedger::default());
    let processor = StreamProcessor::new(registry, Arc::clone(&ledger), settings, cancel);
    (processor, ledger)
}

/// Feed `parts` in order, finalize, and render the whole output
pub async fn run_stream(processor: &mut StreamProcessor, parts: &[&str]) -> String {
    let mut out = Vec::new();
    for part in parts {
        out.extend(processor.feed(part).await.unwrap());
    }
    out.extend(processor.finalize().unwrap());
    render_all(&out)
}

/// Split `text` into chunks of `size` characters
pub fn chunks(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

/// Model that streams canned turns; an `Err` chunk becomes a stream error
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Vec<Result<String, String>>>>,
    pub requests: Mutex<Vec<TurnRequest>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<Vec<Result<String, String>>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every turn succeeds with the given chunks
    pub fn from_text(turns: Vec<Vec<&str>>) -> Self {
        Self::new(
            turns
                .into_iter()
                .map(|turn| turn.into_iter().map(|c| Ok(c.to_string())).collect())
                .collect(),
        )
    }

    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_turn(
        &self,
        request: &TurnRequest,
    ) -> anyhow::Result<mpsc::Receiver<anyhow::Result<String>>> {
        self.requests.lock().unwrap().push(request.clone());
        let chunks = self.turns.lock().unwrap().pop_front().unwrap_or_default();

        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            tx.send(chunk.map_err(|e| anyhow!(e)))
                .await
                .map_err(|_| anyhow!("receiver dropped"))?;
        }
        Ok(rx)
    }
}
