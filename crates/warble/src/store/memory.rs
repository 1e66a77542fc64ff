use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

use super::{
    new_id, sort_by_activity, Conversation, ConversationStore, ConversationSummary,
};
use crate::errors::{StoreError, StoreResult};
use crate::models::message::Message;
use crate::providers::base::Usage;

/// Keeps conversations in process memory. The outer map is only locked to
/// look up or insert an entry; work on a conversation happens under its own
/// mutex.
#[derive(Default)]
pub struct MemoryStore {
    conversations: RwLock<HashMap<String, Arc<Mutex<Conversation>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &str) -> StoreResult<Arc<Mutex<Conversation>>> {
        self.conversations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create(&self) -> StoreResult<String> {
        let id = new_id();
        let conversation = Conversation {
            summary: ConversationSummary::new(id.clone()),
            messages: Vec::new(),
        };
        self.conversations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.clone(), Arc::new(Mutex::new(conversation)));
        Ok(id)
    }

    async fn get(&self, id: &str) -> StoreResult<Conversation> {
        let entry = self.entry(id)?;
        let conversation = entry.lock().await;
        Ok(conversation.clone())
    }

    async fn append(&self, id: &str, message: Message) -> StoreResult<()> {
        let entry = self.entry(id)?;
        let mut conversation = entry.lock().await;
        conversation.summary.touch(&message);
        conversation.messages.push(message);
        Ok(())
    }

    async fn record_usage(&self, id: &str, usage: &Usage) -> StoreResult<()> {
        let entry = self.entry(id)?;
        entry.lock().await.summary.usage.add(usage);
        Ok(())
    }

    async fn rename(&self, id: &str, title: &str) -> StoreResult<()> {
        let entry = self.entry(id)?;
        entry.lock().await.summary.title = title.to_string();
        Ok(())
    }

    async fn list(&self) -> StoreResult<Vec<ConversationSummary>> {
        let entries: Vec<_> = self
            .conversations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();

        let mut summaries = Vec::with_capacity(entries.len());
        for entry in entries {
            summaries.push(entry.lock().await.summary.clone());
        }
        sort_by_activity(&mut summaries);
        Ok(summaries)
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.conversations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
        Ok(())
    }
}
