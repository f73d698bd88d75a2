// Task ledger shared by every conversation pipeline
//
// Tracks each tool invocation from dispatch to a terminal state. Entries live
// in a DashMap so concurrent streams never lose updates; each mutation holds
// only the lock of the entry it touches.

mod retention;
mod task;

pub use retention::{spawn_retention, RetentionPolicy};
pub use task::{
    LedgerEvent, Marker, StatusCounts, Task, TaskFilter, TaskId, TaskStatus, EXCERPT_CHARS,
};

use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::tags::{TagKind, ToolKind};
use task::excerpt;

const EVENT_CAPACITY: usize = 256;
const MARKER_HISTORY: usize = 64;

/// Operation referenced a task the ledger cannot act on
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}

pub struct TaskLedger {
    tasks: DashMap<TaskId, Task>,
    next_id: AtomicU64,
    markers: Mutex<VecDeque<Marker>>,
    events: broadcast::Sender<LedgerEvent>,
    retention: RetentionPolicy,
}

impl TaskLedger {
    pub fn new(retention: RetentionPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tasks: DashMap::new(),
            next_id: AtomicU64::new(1),
            markers: Mutex::new(VecDeque::with_capacity(MARKER_HISTORY)),
            events,
            retention,
        }
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    /// Record a new Pending task and return its identifier
    pub fn create(&self, kind: ToolKind, input: &str) -> TaskId {
        let id = TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.tasks.insert(id, Task::new(id, kind, input));
        tracing::debug!(task_id = %id, tool = %kind, "Task created");
        self.emit(LedgerEvent::Created { id, kind });
        id
    }

    pub fn start(&self, id: TaskId) -> Result<(), LedgerError> {
        self.transition(id, TaskStatus::Running, |task| {
            task.started_at = Some(Utc::now());
            task.attempts = task.attempts.max(1);
        })?;
        self.emit(LedgerEvent::Started { id });
        Ok(())
    }

    /// Count another attempt on a Running task
    pub fn record_attempt(&self, id: TaskId) -> Result<u32, LedgerError> {
        let mut entry = self.tasks.get_mut(&id).ok_or(LedgerError::UnknownTask(id))?;
        if entry.status != TaskStatus::Running {
            return Err(LedgerError::InvalidTransition {
                id,
                from: entry.status,
                to: TaskStatus::Running,
            });
        }
        entry.attempts += 1;
        Ok(entry.attempts)
    }

    pub fn complete(&self, id: TaskId, output: &str) -> Result<(), LedgerError> {
        self.transition(id, TaskStatus::Completed, |task| {
            task.completed_at = Some(Utc::now());
            task.output = Some(excerpt(output));
        })?;
        self.emit(LedgerEvent::Completed { id });
        Ok(())
    }

    pub fn fail(&self, id: TaskId, error: &str) -> Result<(), LedgerError> {
        self.transition(id, TaskStatus::Failed, |task| {
            task.completed_at = Some(Utc::now());
            task.error = Some(excerpt(error));
        })?;
        self.emit(LedgerEvent::Failed {
            id,
            error: excerpt(error),
        });
        Ok(())
    }

    pub fn timeout(&self, id: TaskId) -> Result<(), LedgerError> {
        self.transition(id, TaskStatus::TimedOut, |task| {
            task.completed_at = Some(Utc::now());
            task.error = Some("deadline exceeded".to_string());
        })?;
        self.emit(LedgerEvent::TimedOut { id });
        Ok(())
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.get(&id).map(|entry| entry.value().clone())
    }

    /// Matching tasks, newest first
    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut rows: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        rows
    }

    /// Pending and Running tasks, newest first
    pub fn active(&self) -> Vec<Task> {
        let mut rows: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| !entry.status.is_terminal())
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        rows
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in self.tasks.iter() {
            counts.add(entry.status);
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Surface a structural region without dispatching anything
    pub fn mark(&self, kind: TagKind, label: Option<&str>, inner: &str) {
        let marker = Marker {
            kind,
            label: label.map(str::to_string),
            excerpt: excerpt(inner.trim()),
            at: Utc::now(),
        };
        if let Ok(mut markers) = self.markers.lock() {
            if markers.len() == MARKER_HISTORY {
                markers.pop_front();
            }
            markers.push_back(marker.clone());
        }
        self.emit(LedgerEvent::Marker(marker));
    }

    /// Recent structural markers, oldest first
    pub fn markers(&self) -> Vec<Marker> {
        self.markers
            .lock()
            .map(|markers| markers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Evict expired and excess terminal tasks; returns how many were removed
    pub fn prune(&self) -> usize {
        self.prune_at(Utc::now())
    }

    pub fn prune_at(&self, now: chrono::DateTime<Utc>) -> usize {
        let cutoff = now - self.retention.window();
        let mut removed = 0;

        let expired: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|entry| {
                entry.status.is_terminal()
                    && entry.completed_at.is_some_and(|done| done < cutoff)
            })
            .map(|entry| *entry.key())
            .collect();
        for id in expired {
            if self
                .tasks
                .remove_if(&id, |_, task| task.status.is_terminal())
                .is_some()
            {
                removed += 1;
            }
        }

        let excess = self.tasks.len().saturating_sub(self.retention.max_entries);
        if excess > 0 {
            let mut terminal: Vec<TaskId> = self
                .tasks
                .iter()
                .filter(|entry| entry.status.is_terminal())
                .map(|entry| *entry.key())
                .collect();
            terminal.sort();
            for id in terminal.into_iter().take(excess) {
                if self
                    .tasks
                    .remove_if(&id, |_, task| task.status.is_terminal())
                    .is_some()
                {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::debug!(removed, remaining = self.tasks.len(), "Pruned task ledger");
        }
        removed
    }

    fn transition<F>(&self, id: TaskId, next: TaskStatus, apply: F) -> Result<(), LedgerError>
    where
        F: FnOnce(&mut Task),
    {
        let mut entry = self.tasks.get_mut(&id).ok_or(LedgerError::UnknownTask(id))?;
        if !entry.status.can_transition_to(next) {
            return Err(LedgerError::InvalidTransition {
                id,
                from: entry.status,
                to: next,
            });
        }
        entry.status = next;
        apply(entry.value_mut());
        Ok(())
    }

    fn emit(&self, event: LedgerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for TaskLedger {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}
