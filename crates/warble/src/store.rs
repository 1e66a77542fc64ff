//! Durable conversation history.
//!
//! Conversations are independent units of concurrency: every implementation
//! serializes operations per conversation id and never holds a store-wide
//! lock across I/O.
pub mod file;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StoreResult;
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::providers::base::Usage;

pub use file::FileStore;
pub use memory::MemoryStore;

const TITLE_LENGTH: usize = 48;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub message_count: usize,
    pub usage: Usage,
}

impl ConversationSummary {
    fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: String::new(),
            created: now,
            updated: now,
            message_count: 0,
            usage: Usage::default(),
        }
    }

    /// Bookkeeping for one appended message. The first user message names an
    /// untitled conversation.
    fn touch(&mut self, message: &Message) {
        self.message_count += 1;
        self.updated = Utc::now();
        if self.title.is_empty() && message.role == Role::User {
            self.title = derive_title(message);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(flatten)]
    pub summary: ConversationSummary,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn id(&self) -> &str {
        &self.summary.id
    }
}

fn derive_title(message: &Message) -> String {
    let text = message
        .content
        .iter()
        .filter_map(MessageContent::as_text)
        .collect::<Vec<_>>()
        .join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");

    if text.chars().count() <= TITLE_LENGTH {
        text
    } else {
        let mut title: String = text.chars().take(TITLE_LENGTH).collect();
        title.push('…');
        title
    }
}

/// Ids are generated by the store; anything else cannot name a conversation
fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create an empty conversation and return its id
    async fn create(&self) -> StoreResult<String>;

    async fn get(&self, id: &str) -> StoreResult<Conversation>;

    /// Append a message; fails with NotFound for unknown ids
    async fn append(&self, id: &str, message: Message) -> StoreResult<()>;

    /// Add one turn's token usage to the conversation's running total
    async fn record_usage(&self, id: &str, usage: &Usage) -> StoreResult<()>;

    /// Set the title. Renaming is not activity and leaves the `list` order alone.
    async fn rename(&self, id: &str, title: &str) -> StoreResult<()>;

    /// Summaries ordered by most recent activity first
    async fn list(&self) -> StoreResult<Vec<ConversationSummary>>;

    /// Remove a conversation. Deleting an unknown id succeeds.
    async fn delete(&self, id: &str) -> StoreResult<()>;

    async fn exists(&self, id: &str) -> StoreResult<bool> {
        match self.get(id).await {
            Ok(_) => Ok(true),
            Err(crate::errors::StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn sort_by_activity(summaries: &mut [ConversationSummary]) {
    summaries.sort_by(|a, b| b.updated.cmp(&a.updated).then(b.created.cmp(&a.created)));
}
