// Long-term memory store
//
// An append-only JSON-lines file. Writers take an exclusive file lock and
// readers a shared one, so several processes can share one memory file.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Tag for entries taken from `<memory>` regions
pub const CONVERSATION_MEMORY_TAG: &str = "conversation_memory";

/// Tag for stored user messages
pub const USER_MESSAGE_TAG: &str = "user_message";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    /// Entry must carry every one of these
    pub tags: Vec<String>,
    pub limit: Option<usize>,
    pub since: Option<DateTime<Utc>>,
}

impl MemoryQuery {
    pub fn tagged(tag: impl Into<String>) -> Self {
        Self {
            tags: vec![tag.into()],
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    fn matches(&self, entry: &MemoryEntry) -> bool {
        if self.since.is_some_and(|since| entry.timestamp < since) {
            return false;
        }
        self.tags.iter().all(|tag| entry.tags.contains(tag))
    }
}

pub struct MemoryStore {
    path: PathBuf,
}

impl MemoryStore {
    /// Open (creating if needed) the memory file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open memory file {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry
    pub fn store(&self, content: &str, tags: &[&str]) -> Result<MemoryEntry> {
        let entry = MemoryEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            content: content.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open memory file {}", self.path.display()))?;
        file.lock_exclusive()?;
        let written = file.write_all(line.as_bytes()).and_then(|_| file.flush());
        file.unlock()?;
        written.context("Failed to append memory entry")?;

        tracing::debug!(id = %entry.id, tags = ?entry.tags, "Stored memory");
        Ok(entry)
    }

    /// Matching entries, newest first
    pub fn retrieve(&self, query: &MemoryQuery) -> Result<Vec<MemoryEntry>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to open memory file {}", self.path.display())
                })
            }
        };
        file.lock_shared()?;
        let lines: std::io::Result<Vec<String>> = BufReader::new(&file).lines().collect();
        file.unlock()?;

        let mut entries = Vec::new();
        for (lineno, line) in lines?.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MemoryEntry>(line) {
                Ok(entry) if query.matches(&entry) => entries.push(entry),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(line = lineno + 1, error = %e, "Skipping unreadable memory entry")
                }
            }
        }

        entries.reverse();
        if let Some(limit) = query.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Remove every entry
    pub fn clear(&self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open memory file {}", self.path.display()))?;
        file.lock_exclusive()?;
        let truncated = file.set_len(0);
        file.unlock()?;
        truncated.context("Failed to clear memory file")?;
        tracing::info!(path = %self.path.display(), "Cleared memory");
        Ok(())
    }
}
