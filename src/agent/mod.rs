// Agent: drives model turns through the tag processor
//
// Each user message becomes one or more model turns. Every turn streams
// through a fresh StreamProcessor; when a tool result was spliced and the
// model has not closed the task, the processed text so far goes back to the
// model as a continuation.

mod conversation;
mod model;
mod prompt;

pub use conversation::{ConversationHistory, Message, Role};
pub use model::{ModelClient, TurnRequest};
pub use prompt::{system_prompt, wrap_user_message};

use anyhow::Result;
use chrono::Local;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, ConversationConfig};
use crate::errors::STREAM_FAILURE_NOTICE;
use crate::ledger::{TaskId, TaskLedger};
use crate::memory::{MemoryStore, CONVERSATION_MEMORY_TAG, USER_MESSAGE_TAG};
use crate::processor::{ProcessorError, ProcessorSettings, StreamProcessor};
use crate::tags::{final_answer, Fragment};
use crate::tools::ToolRegistry;

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub conversation: ConversationConfig,
    pub processor: ProcessorSettings,
    pub max_tokens: u32,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            conversation: config.conversation.clone(),
            processor: ProcessorSettings::from_config(&config.processor),
            max_tokens: config.model.max_tokens,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One user-facing conversation
pub struct Conversation {
    id: Uuid,
    history: ConversationHistory,
    cancel: CancellationToken,
    next_task: u64,
}

impl Conversation {
    pub fn new(settings: &ConversationConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            history: ConversationHistory::with_limits(
                settings.max_messages,
                settings.max_context_chars,
            ),
            cancel: CancellationToken::new(),
            next_task: 1,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Token that stops the in-flight response when cancelled
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Replace a spent cancellation token so later responses can run
    pub fn reset_cancel(&mut self) {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
    }

    /// Forget history and stop anything still running
    pub fn clear(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.history.clear();
    }
}

/// Outcome of one user message
#[derive(Debug, Clone, Default)]
pub struct Response {
    /// Processed output with tool results spliced in
    pub text: String,
    /// What the user should see
    pub answer: String,
    pub tool_calls: usize,
    pub task_ids: Vec<TaskId>,
    pub turns: usize,
    /// The model closed the task with </endtask>
    pub completed: bool,
    pub cancelled: bool,
    pub memory_entries: Vec<String>,
    /// Set when the response ended on an error
    pub failure: Option<String>,
}

pub struct Agent {
    model: Arc<dyn ModelClient>,
    registry: Arc<ToolRegistry>,
    ledger: Arc<TaskLedger>,
    memory: Option<Arc<MemoryStore>>,
    settings: AgentSettings,
    system_prompt: String,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ModelClient>,
        registry: Arc<ToolRegistry>,
        ledger: Arc<TaskLedger>,
        memory: Option<Arc<MemoryStore>>,
        settings: AgentSettings,
    ) -> Self {
        let system_prompt = system_prompt(&registry.enabled_kinds());
        debug!(model = model.name(), "Agent ready");
        Self {
            model,
            registry,
            ledger,
            memory,
            settings,
            system_prompt,
        }
    }

    pub fn new_conversation(&self) -> Conversation {
        Conversation::new(&self.settings.conversation)
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn ledger(&self) -> &Arc<TaskLedger> {
        &self.ledger
    }

    pub fn memory(&self) -> Option<&Arc<MemoryStore>> {
        self.memory.as_ref()
    }

    /// Answer `user_text`, reporting each output fragment as it is decided
    pub async fn respond<F>(
        &self,
        conversation: &mut Conversation,
        user_text: &str,
        mut on_fragment: F,
    ) -> Result<Response>
    where
        F: FnMut(&Fragment) + Send,
    {
        let task_number = conversation.next_task;
        conversation.next_task += 1;
        let user_message = wrap_user_message(task_number, user_text, Local::now());
        let cancel = conversation.cancel_handle();

        let mut base = conversation.history.messages().to_vec();
        base.push(Message::user(user_message.clone()));

        let mut processor_settings = self.settings.processor.clone();
        processor_settings.stop_after_splice = self.settings.conversation.stop_after_tool;

        let mut response = Response::default();
        let mut processed = String::new();
        let mut continuations = 0;

        loop {
            response.turns += 1;
            let mut messages = base.clone();
            if !processed.trim().is_empty() {
                messages.push(Message::assistant(processed.trim_end()));
            }
            let request = TurnRequest {
                system: self.system_prompt.clone(),
                messages,
                max_tokens: self.settings.max_tokens,
            };

            let mut processor = StreamProcessor::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.ledger),
                processor_settings.clone(),
                cancel.clone(),
            );

            let outcome = self
                .run_turn(&request, &mut processor, &cancel, &mut |fragment| {
                    processed.push_str(&fragment.render());
                    on_fragment(&fragment);
                })
                .await;

            let summary = processor.summary().clone();
            response.tool_calls += summary.tool_calls;
            response.task_ids.extend(summary.task_ids.iter().copied());
            response.completed |= summary.endtask_seen;
            response.memory_entries.extend(processor.take_memory_entries());

            match outcome {
                TurnOutcome::Finished => {}
                TurnOutcome::Cancelled => {
                    info!(conversation = %conversation.id, "Response cancelled");
                    response.cancelled = true;
                    break;
                }
                TurnOutcome::Failed(err) => {
                    warn!(conversation = %conversation.id, error = %err, "Response failed");
                    let notice = Fragment::text(format!("\n\n{}", STREAM_FAILURE_NOTICE));
                    processed.push_str(&notice.render());
                    on_fragment(&notice);
                    response.failure = Some(err);
                    break;
                }
            }

            let needs_continuation = summary.tool_calls > 0 && !summary.endtask_seen;
            if !needs_continuation {
                break;
            }
            if continuations >= self.settings.conversation.max_continuations {
                warn!(
                    conversation = %conversation.id,
                    continuations,
                    "Continuation limit reached before the task was closed"
                );
                break;
            }
            continuations += 1;
            debug!(conversation = %conversation.id, continuations, "Requesting continuation");
        }

        response.text = processed.trim().to_string();
        response.answer = final_answer(&response.text);

        conversation.history.add_user_message(user_message);
        if !response.text.is_empty() {
            conversation
                .history
                .add_assistant_message(response.text.clone());
        }
        self.remember(user_text, &response.memory_entries);

        Ok(response)
    }

    async fn run_turn<F>(
        &self,
        request: &TurnRequest,
        processor: &mut StreamProcessor,
        cancel: &CancellationToken,
        sink: &mut F,
    ) -> TurnOutcome
    where
        F: FnMut(Fragment) + Send,
    {
        let mut rx = tokio::select! {
            started = self.model.stream_turn(request) => match started {
                Ok(rx) => rx,
                Err(e) => return TurnOutcome::Failed(format!("{:#}", e)),
            },
            _ = cancel.cancelled() => return TurnOutcome::Cancelled,
        };

        loop {
            let chunk = tokio::select! {
                chunk = rx.recv() => chunk,
                _ = cancel.cancelled() => return TurnOutcome::Cancelled,
            };
            match chunk {
                Some(Ok(text)) => match processor.feed_with(&text, sink).await {
                    Ok(()) if processor.is_halted() => break,
                    Ok(()) => {}
                    Err(ProcessorError::Cancelled) => return TurnOutcome::Cancelled,
                    Err(e) => return TurnOutcome::Failed(e.to_string()),
                },
                Some(Err(e)) => {
                    // Keep whatever was held back before reporting
                    flush(processor, sink);
                    return TurnOutcome::Failed(format!("{:#}", e));
                }
                None => break,
            }
        }

        match processor.finalize() {
            Ok(fragments) => {
                fragments.into_iter().for_each(sink);
                TurnOutcome::Finished
            }
            Err(ProcessorError::Cancelled) => TurnOutcome::Cancelled,
            Err(e) => TurnOutcome::Failed(e.to_string()),
        }
    }

    fn remember(&self, user_text: &str, entries: &[String]) {
        let Some(memory) = &self.memory else {
            return;
        };
        for entry in entries {
            if let Err(e) = memory.store(entry, &[CONVERSATION_MEMORY_TAG]) {
                warn!(error = %e, "Failed to store memory entry");
            }
        }
        if let Err(e) = memory.store(user_text, &[USER_MESSAGE_TAG]) {
            warn!(error = %e, "Failed to store user message");
        }
    }
}

enum TurnOutcome {
    Finished,
    Cancelled,
    Failed(String),
}

fn flush<F>(processor: &mut StreamProcessor, sink: &mut F)
where
    F: FnMut(Fragment),
{
    if let Ok(fragments) = processor.finalize() {
        fragments.into_iter().for_each(sink);
    }
}
