use anyhow::Result as AnyhowResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{
    is_valid_id, new_id, sort_by_activity, Conversation, ConversationStore, ConversationSummary,
};
use crate::errors::{StoreError, StoreResult};
use crate::models::message::Message;
use crate::providers::base::Usage;

const MESSAGES_EXT: &str = "jsonl";
const SUMMARY_EXT: &str = "json";

/// Stores each conversation as two files in one directory: `<id>.json` holds
/// the summary and `<id>.jsonl` the messages, one JSON object per line.
pub struct FileStore {
    dir: PathBuf,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileStore {
    /// Open a store in `dir`, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>) -> AnyhowResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: StdMutex::new(HashMap::new()),
        })
    }

    /// `~/.config/warble/conversations`
    pub fn default_dir() -> AnyhowResult<PathBuf> {
        let home_dir =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(home_dir.join(".config").join("warble").join("conversations"))
    }

    fn locks(&self) -> StdMutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `op` while holding the conversation's lock. An entry lives in the
    /// lock map only while some operation on that id is in flight.
    async fn locked<T, F, Fut>(&self, id: &str, op: F) -> StoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        if !is_valid_id(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }

        let lock = Arc::clone(self.locks().entry(id.to_string()).or_default());
        let result = {
            let _guard = lock.lock().await;
            op().await
        };

        let mut locks = self.locks();
        drop(lock);
        // The map holds the last reference once no other operation waits on it
        if locks.get(id).map_or(false, |entry| Arc::strong_count(entry) == 1) {
            locks.remove(id);
        }
        result
    }

    fn path(&self, id: &str, ext: &str) -> StoreResult<PathBuf> {
        if !is_valid_id(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.{}", id, ext)))
    }

    async fn read_summary(&self, id: &str) -> StoreResult<ConversationSummary> {
        let path = self.path(id, SUMMARY_EXT)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the summary file in one rename so readers never see a partial write
    async fn write_summary(&self, summary: &ConversationSummary) -> StoreResult<()> {
        let path = self.path(&summary.id, SUMMARY_EXT)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(summary)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_messages(&self, id: &str) -> StoreResult<Vec<Message>> {
        let path = self.path(id, MESSAGES_EXT)?;
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StoreError::from))
            .collect()
    }

    async fn append_line(&self, id: &str, message: &Message) -> StoreResult<()> {
        let path = self.path(id, MESSAGES_EXT)?;
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn remove_if_present(path: &Path) -> StoreResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ConversationStore for FileStore {
    async fn create(&self) -> StoreResult<String> {
        let id = new_id();
        self.locked(&id, || async {
            fs::write(self.path(&id, MESSAGES_EXT)?, b"").await?;
            self.write_summary(&ConversationSummary::new(id.clone()))
                .await
        })
        .await?;
        Ok(id)
    }

    async fn get(&self, id: &str) -> StoreResult<Conversation> {
        self.locked(id, || async {
            let summary = self.read_summary(id).await?;
            let messages = self.read_messages(id).await?;
            Ok(Conversation { summary, messages })
        })
        .await
    }

    async fn append(&self, id: &str, message: Message) -> StoreResult<()> {
        self.locked(id, || async {
            let mut summary = self.read_summary(id).await?;
            self.append_line(id, &message).await?;
            summary.touch(&message);
            self.write_summary(&summary).await
        })
        .await
    }

    async fn record_usage(&self, id: &str, usage: &Usage) -> StoreResult<()> {
        self.locked(id, || async {
            let mut summary = self.read_summary(id).await?;
            summary.usage.add(usage);
            self.write_summary(&summary).await
        })
        .await
    }

    async fn rename(&self, id: &str, title: &str) -> StoreResult<()> {
        self.locked(id, || async {
            let mut summary = self.read_summary(id).await?;
            summary.title = title.to_string();
            self.write_summary(&summary).await
        })
        .await
    }

    async fn list(&self) -> StoreResult<Vec<ConversationSummary>> {
        let mut summaries = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SUMMARY_EXT) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.read_summary(id).await {
                Ok(summary) => summaries.push(summary),
                // deleted between read_dir and read
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => {
                    tracing::warn!(conversation = %id, error = %e, "skipping unreadable conversation");
                }
            }
        }

        sort_by_activity(&mut summaries);
        Ok(summaries)
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        if !is_valid_id(id) {
            return Ok(());
        }
        self.locked(id, || async {
            Self::remove_if_present(&self.path(id, SUMMARY_EXT)?).await?;
            Self::remove_if_present(&self.path(id, MESSAGES_EXT)?).await
        })
        .await
    }
}
