use crate::clients::{Message, MessageRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const TITLE_LIMIT: usize = 60;

/// Append-only message list for one agent run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationHistory {
    messages: Vec<Message>,
}

impl ConversationHistory {
    /// Starts a run: the system message first, then the caller's history
    /// with any system messages of its own left out.
    pub fn with_system(system: Message, prior: &[Message]) -> Self {
        let mut messages = Vec::with_capacity(prior.len() + 1);
        messages.push(system);
        messages.extend(
            prior
                .iter()
                .filter(|m| m.role != MessageRole::System)
                .cloned(),
        );
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("Transcript I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid transcript: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Transcript not found: {0}")]
    NotFound(Uuid),
}

/// A saved chat. System messages are never stored; they are rebuilt for
/// every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    #[serde(default)]
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: String::new(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replaces the stored messages with a finished run's history.
    pub fn update(&mut self, messages: &[Message]) {
        self.messages = messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .cloned()
            .collect();
        if self.title.is_empty() {
            self.title = self
                .messages
                .iter()
                .find(|m| m.role == MessageRole::User)
                .map(|m| m.content_str().split_whitespace().collect::<Vec<_>>().join(" "))
                .map(|t| t.chars().take(TITLE_LIMIT).collect())
                .unwrap_or_default();
        }
        self.updated_at = Utc::now();
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// One pretty-printed JSON file per conversation, named by its id.
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    dir: PathBuf,
}

impl TranscriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub async fn save(&self, conversation: &Conversation) -> Result<PathBuf, TranscriptError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(conversation.id);
        let content = serde_json::to_string_pretty(conversation)?;
        tokio::fs::write(&path, content).await?;
        debug!(id = %conversation.id, messages = conversation.messages.len(), "transcript saved");
        Ok(path)
    }

    pub async fn load(&self, id: Uuid) -> Result<Conversation, TranscriptError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(TranscriptError::NotFound(id));
        }
        let content = tokio::fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// All readable transcripts, most recently updated first. Files that do
    /// not parse are skipped.
    pub async fn list(&self) -> Result<Vec<Conversation>, TranscriptError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut conversations = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<Conversation>(&content) {
                Ok(conversation) => conversations.push(conversation),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable transcript"),
            }
        }

        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), TranscriptError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(TranscriptError::NotFound(id));
        }
        tokio::fs::remove_file(path).await?;
        Ok(())
    }
}
