// Streaming tag processor
//
// Consumes model output fragment by fragment, passes prose through as soon as
// it cannot begin a marker, and replaces each closed tool region with the
// result of running it. One processor serves one response stream; regions are
// handled strictly left to right.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ProcessorConfig;
use crate::ledger::{LedgerError, TaskId, TaskLedger};
use crate::tags::{
    match_marker, ErrorClass, Fragment, MarkerMatch, TagKind, ToolKind, END_TASK_MARKER,
};
use crate::tools::{InvocationContext, ToolError, ToolRegistration, ToolRegistry};

/// An Execution failure gets at most one retry
const MAX_ATTEMPTS: u32 = 2;

const CANCELLED_MESSAGE: &str = "Tool execution cancelled";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("stream already finalized")]
    Finished,

    #[error("stream cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Open regions larger than this degrade to literal text
    pub max_region_bytes: usize,
    /// Drop everything after the first splice
    pub stop_after_splice: bool,
}

impl ProcessorSettings {
    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self {
            max_region_bytes: config.max_region_bytes,
            stop_after_splice: false,
        }
    }
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self::from_config(&ProcessorConfig::default())
    }
}

/// What happened over the life of one stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub tool_calls: usize,
    pub task_ids: Vec<TaskId>,
    pub endtask_seen: bool,
    /// Interrupted, oversized or unterminated regions
    pub anomalies: usize,
    pub memory_entries: Vec<String>,
}

#[derive(Debug, Clone)]
struct OpenRegion {
    kind: TagKind,
    id: Option<String>,
    open_len: usize,
    /// Body offset where the next scan resumes; everything before it is decided
    scanned: usize,
}

#[derive(Debug, Clone)]
enum ScanState {
    Text,
    /// The region's start marker sits at buffer index 0
    Region(OpenRegion),
}

struct ClosedRegion {
    kind: TagKind,
    id: Option<String>,
    raw: String,
    inner: String,
}

enum RegionEvent {
    Close(usize),
    EndTask(usize),
    Interrupt(usize),
}

enum Step {
    Wait,
    Continue,
    Closed(ClosedRegion),
}

enum Invocation {
    Done(Result<String, ToolError>),
    Cancelled,
}

pub struct StreamProcessor {
    registry: Arc<ToolRegistry>,
    ledger: Arc<TaskLedger>,
    settings: ProcessorSettings,
    cancel: CancellationToken,
    buffer: String,
    state: ScanState,
    finished: bool,
    halted: bool,
    summary: StreamSummary,
}

impl StreamProcessor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        ledger: Arc<TaskLedger>,
        settings: ProcessorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            ledger,
            settings,
            cancel,
            buffer: String::new(),
            state: ScanState::Text,
            finished: false,
            halted: false,
            summary: StreamSummary::default(),
        }
    }

    /// Consume `fragment` and return the output it completes
    pub async fn feed(&mut self, fragment: &str) -> Result<Vec<Fragment>, ProcessorError> {
        let mut out = Vec::new();
        self.feed_with(fragment, &mut |f| out.push(f)).await?;
        Ok(out)
    }

    /// Like `feed`, handing output to `sink` as soon as it is decided.
    ///
    /// Text preceding a tool region reaches the sink before the tool runs.
    /// On cancellation everything decided so far has been delivered, ending
    /// with a `cancelled` error splice when a tool was interrupted.
    pub async fn feed_with<F>(&mut self, fragment: &str, sink: &mut F) -> Result<(), ProcessorError>
    where
        F: FnMut(Fragment) + Send,
    {
        self.check_open()?;
        if self.halted {
            return Ok(());
        }
        self.buffer.push_str(fragment);
        self.drive(sink).await
    }

    /// Flush everything still held back.
    ///
    /// An open structural region is closed with its end marker; an open tool
    /// region is emitted as literal text and never run.
    pub fn finalize(&mut self) -> Result<Vec<Fragment>, ProcessorError> {
        self.check_open()?;
        self.finished = true;

        let mut out = Vec::new();
        if self.halted {
            self.buffer.clear();
            return Ok(out);
        }

        let rest = std::mem::take(&mut self.buffer);
        match std::mem::replace(&mut self.state, ScanState::Text) {
            ScanState::Text => push_text(&mut out, &rest),
            ScanState::Region(region) if region.kind.is_structural() => {
                debug!(kind = %region.kind, "Closing unterminated region");
                let inner = &rest[region.open_len..];
                self.record_structural(region.kind, region.id.as_deref(), inner);
                let mut raw = rest.clone();
                raw.push_str(region.kind.end_marker());
                push_text(&mut out, &raw);
            }
            ScanState::Region(region) => {
                warn!(kind = %region.kind, "Unterminated tool region left unexecuted");
                self.summary.anomalies += 1;
                push_text(&mut out, &rest);
            }
        }
        Ok(out)
    }

    pub fn summary(&self) -> &StreamSummary {
        &self.summary
    }

    pub fn take_memory_entries(&mut self) -> Vec<String> {
        std::mem::take(&mut self.summary.memory_entries)
    }

    /// True once a splice cut the stream short
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    fn check_open(&self) -> Result<(), ProcessorError> {
        if self.cancel.is_cancelled() {
            return Err(ProcessorError::Cancelled);
        }
        if self.finished {
            return Err(ProcessorError::Finished);
        }
        Ok(())
    }

    async fn drive<F>(&mut self, sink: &mut F) -> Result<(), ProcessorError>
    where
        F: FnMut(Fragment) + Send,
    {
        let mut out = Vec::new();
        loop {
            if self.halted {
                self.buffer.clear();
                break;
            }
            let step = match std::mem::replace(&mut self.state, ScanState::Text) {
                ScanState::Text => self.scan_text(&mut out),
                ScanState::Region(region) => self.scan_region(region, &mut out),
            };
            match step {
                Step::Wait => break,
                Step::Continue => {}
                Step::Closed(region) => {
                    if let Some(tool) = region.kind.tool() {
                        // Deliver preceding text before the tool blocks the stream
                        out.drain(..).for_each(&mut *sink);
                        match self.handle_tool(tool, region).await? {
                            Fragment::Text { text } => push_text(&mut out, &text),
                            splice => out.push(splice),
                        }
                        if self.cancel.is_cancelled() {
                            out.into_iter().for_each(sink);
                            return Err(ProcessorError::Cancelled);
                        }
                    } else {
                        self.record_structural(region.kind, region.id.as_deref(), &region.inner);
                        push_text(&mut out, &region.raw);
                    }
                }
            }
        }
        out.into_iter().for_each(sink);
        Ok(())
    }

    fn scan_text(&mut self, out: &mut Vec<Fragment>) -> Step {
        let mut cursor = 0;
        while let Some(offset) = self.buffer[cursor..].find('<') {
            let at = cursor + offset;
            match match_marker(&self.buffer[at..]) {
                MarkerMatch::None => cursor = at + 1,
                MarkerMatch::Partial => {
                    self.emit_prefix(at, out);
                    return Step::Wait;
                }
                MarkerMatch::Start { kind, len, id } => {
                    self.emit_prefix(at, out);
                    self.state = ScanState::Region(OpenRegion {
                        kind,
                        id,
                        open_len: len,
                        scanned: 0,
                    });
                    return Step::Continue;
                }
                MarkerMatch::EndTask { len } => {
                    self.emit_prefix(at + len, out);
                    self.record_endtask();
                    return Step::Continue;
                }
            }
        }
        let len = self.buffer.len();
        self.emit_prefix(len, out);
        Step::Wait
    }

    fn scan_region(&mut self, mut region: OpenRegion, out: &mut Vec<Fragment>) -> Step {
        let max = self.settings.max_region_bytes;
        let end_marker = region.kind.end_marker();
        if region.open_len + end_marker.len() > max {
            return self.overflow(&region, out);
        }

        // Only the first `max` bytes can hold a region that fits
        let view_end = floor_char_boundary(&self.buffer, self.buffer.len().min(max));
        let (event, resume) = scan_body(
            &self.buffer[region.open_len..view_end],
            region.scanned,
            region.kind,
        );
        region.scanned = resume;

        match event {
            Some(RegionEvent::Close(at)) => {
                let inner_end = region.open_len + at;
                let inner = self.buffer[region.open_len..inner_end].to_string();
                let raw: String = self
                    .buffer
                    .drain(..inner_end + end_marker.len())
                    .collect();
                return Step::Closed(ClosedRegion {
                    kind: region.kind,
                    id: region.id,
                    raw,
                    inner,
                });
            }
            Some(RegionEvent::EndTask(at)) => {
                let inner_end = region.open_len + at;
                let inner = self.buffer[region.open_len..inner_end].to_string();
                self.record_structural(TagKind::Task, region.id.as_deref(), &inner);
                self.emit_prefix(inner_end + END_TASK_MARKER.len(), out);
                self.record_endtask();
                return Step::Continue;
            }
            Some(RegionEvent::Interrupt(at)) => {
                warn!(
                    kind = %region.kind,
                    "Region interrupted by another marker, emitting literally"
                );
                self.summary.anomalies += 1;
                self.emit_prefix(region.open_len + at, out);
                return Step::Continue;
            }
            None => {}
        }

        if self.buffer.len() >= max {
            return self.overflow(&region, out);
        }
        self.state = ScanState::Region(region);
        Step::Wait
    }

    fn overflow(&mut self, region: &OpenRegion, out: &mut Vec<Fragment>) -> Step {
        warn!(
            kind = %region.kind,
            max_region_bytes = self.settings.max_region_bytes,
            "Region exceeded size limit, emitting literally"
        );
        self.summary.anomalies += 1;
        self.emit_prefix(region.open_len, out);
        Step::Continue
    }

    fn emit_prefix(&mut self, len: usize, out: &mut Vec<Fragment>) {
        if len == 0 {
            return;
        }
        let text: String = self.buffer.drain(..len).collect();
        push_text(out, &text);
    }

    fn record_endtask(&mut self) {
        self.summary.endtask_seen = true;
        self.ledger.mark(TagKind::Task, Some("endtask"), END_TASK_MARKER);
    }

    fn record_structural(&mut self, kind: TagKind, label: Option<&str>, inner: &str) {
        self.ledger.mark(kind, label, inner);
        if kind == TagKind::Memory {
            let entry = inner.trim();
            if !entry.is_empty() {
                self.summary.memory_entries.push(entry.to_string());
            }
        }
    }

    async fn handle_tool(
        &mut self,
        tool: ToolKind,
        region: ClosedRegion,
    ) -> Result<Fragment, ProcessorError> {
        let Some(registration) = self.registry.resolve(tool).cloned() else {
            debug!(tool = %tool, "Tool not available, passing region through");
            return Ok(Fragment::text(region.raw));
        };

        let fragment = self.dispatch(tool, &registration, region.inner.trim()).await?;
        self.summary.tool_calls += 1;
        if let Some(id) = fragment.task_id() {
            self.summary.task_ids.push(id);
        }
        if self.settings.stop_after_splice {
            debug!("Stopping stream after splice");
            self.halted = true;
            self.buffer.clear();
        }
        Ok(fragment)
    }

    #[instrument(skip_all, fields(tool = %tool))]
    async fn dispatch(
        &mut self,
        tool: ToolKind,
        registration: &ToolRegistration,
        input: &str,
    ) -> Result<Fragment, ProcessorError> {
        if self.cancel.is_cancelled() {
            return Err(ProcessorError::Cancelled);
        }

        let task_id = self.ledger.create(tool, input);
        log_ledger(self.ledger.start(task_id));
        let timeout = registration.settings.timeout();
        let mut attempt = 1;

        loop {
            let result = match self.invoke_once(registration, task_id, input, timeout).await {
                Invocation::Done(result) => result,
                Invocation::Cancelled => {
                    info!(task_id = %task_id, "Stream cancelled during tool execution");
                    return Ok(Fragment::ToolError {
                        task_id,
                        tool,
                        class: ErrorClass::Cancelled,
                        message: CANCELLED_MESSAGE.to_string(),
                    });
                }
            };

            match result {
                Ok(output) => {
                    debug!(task_id = %task_id, attempt, "Tool completed");
                    log_ledger(self.ledger.complete(task_id, &output));
                    return Ok(Fragment::ToolResult {
                        task_id,
                        tool,
                        output,
                    });
                }
                Err(err)
                    if err.is_retryable()
                        && registration.settings.retry_on_error
                        && attempt < MAX_ATTEMPTS =>
                {
                    warn!(task_id = %task_id, error = %err, "Tool failed, retrying");
                    attempt += 1;
                    log_ledger(self.ledger.record_attempt(task_id).map(|_| ()));
                }
                Err(ToolError::Timeout(after)) => {
                    warn!(task_id = %task_id, ?after, "Tool timed out");
                    log_ledger(self.ledger.timeout(task_id));
                    return Ok(error_fragment(task_id, tool, &ToolError::Timeout(after)));
                }
                Err(err) => {
                    warn!(task_id = %task_id, error = %err, "Tool failed");
                    log_ledger(self.ledger.fail(task_id, &err.to_string()));
                    return Ok(error_fragment(task_id, tool, &err));
                }
            }
        }
    }

    async fn invoke_once(
        &self,
        registration: &ToolRegistration,
        task_id: TaskId,
        input: &str,
        timeout: Duration,
    ) -> Invocation {
        let ctx = InvocationContext {
            task_id,
            timeout,
            cancel: self.cancel.child_token(),
        };
        let executor = Arc::clone(&registration.executor);
        let call_ctx = ctx.clone();
        let input = input.to_string();

        let mut handle = tokio::spawn(async move {
            match time::timeout(timeout, executor.invoke(&input, &call_ctx)).await {
                Ok(result) => result,
                Err(_) => Err(ToolError::Timeout(timeout)),
            }
        });

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(result) => Invocation::Done(result),
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "Tool task panicked");
                    Invocation::Done(Err(ToolError::execution("tool task panicked")))
                }
            },
            _ = self.cancel.cancelled() => {
                if registration.executor.supports_cancellation() {
                    ctx.cancel.cancel();
                    handle.abort();
                    log_ledger(self.ledger.fail(task_id, "cancelled"));
                } else {
                    // Let the deadline end it; the result has nowhere to go
                    let ledger = Arc::clone(&self.ledger);
                    tokio::spawn(async move {
                        let outcome = match handle.await {
                            Ok(Err(ToolError::Timeout(_))) => ledger.timeout(task_id),
                            _ => ledger.fail(task_id, "cancelled; result discarded"),
                        };
                        log_ledger(outcome);
                    });
                }
                Invocation::Cancelled
            }
        }
    }
}

fn error_fragment(task_id: TaskId, tool: ToolKind, err: &ToolError) -> Fragment {
    let message = match err {
        ToolError::Execution(msg) => format!("Tool execution failed: {}", msg),
        other => other.to_string(),
    };
    Fragment::ToolError {
        task_id,
        tool,
        class: err.class(),
        message,
    }
}

/// Ledger trouble is never fatal to the stream
fn log_ledger(result: Result<(), LedgerError>) {
    if let Err(e) = result {
        error!(error = %e, "Task ledger inconsistency");
    }
}

/// First marker in `body` at or after `from` that decides the open region.
///
/// Also returns where the next scan should resume: the undecided `<` held at
/// the end of `body`, or `body.len()` when nothing is pending. Each byte is
/// looked at a bounded number of times however the region is fragmented.
fn scan_body(body: &str, from: usize, open: TagKind) -> (Option<RegionEvent>, usize) {
    let end_marker = open.end_marker();
    let mut cursor = from;
    while let Some(offset) = body[cursor..].find('<') {
        let at = cursor + offset;
        let rest = &body[at..];
        if rest.starts_with(end_marker) {
            return (Some(RegionEvent::Close(at)), at);
        }
        match match_marker(rest) {
            MarkerMatch::EndTask { .. } if open == TagKind::Task => {
                return (Some(RegionEvent::EndTask(at)), at);
            }
            MarkerMatch::EndTask { .. } => return (Some(RegionEvent::Interrupt(at)), at),
            MarkerMatch::Start { kind, .. } if kind != open => {
                return (Some(RegionEvent::Interrupt(at)), at);
            }
            MarkerMatch::Partial => return (None, at),
            MarkerMatch::Start { .. } | MarkerMatch::None => {}
        }
        if end_marker.starts_with(rest) {
            return (None, at);
        }
        cursor = at + 1;
    }
    (None, body.len())
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Append `text`, merging with a trailing text fragment
fn push_text(out: &mut Vec<Fragment>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Fragment::Text { text: last }) = out.last_mut() {
        last.push_str(text);
    } else {
        out.push(Fragment::text(text));
    }
}
