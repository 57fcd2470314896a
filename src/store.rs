use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{Conversation, IndexEntry, Message, DEFAULT_CONVERSATION_NAME};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    NotFound(Uuid),
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// File-backed conversation store: one JSON record per conversation plus an
/// index file with denormalized names and last-activity timestamps.
///
/// Known hazard: the files are shared mutable state. Writers within this
/// process are serialized per conversation id; a second process on the same
/// data directory races with last-write-wins.
pub struct ConversationStore {
    chats_dir: PathBuf,
    record_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    index_lock: Mutex<()>,
}

impl ConversationStore {
    /// Open a store rooted at `chats_dir`, creating the directory if needed.
    pub async fn open(chats_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let chats_dir = chats_dir.as_ref().to_path_buf();
        fs::create_dir_all(&chats_dir).await?;
        Ok(Self {
            chats_dir,
            record_locks: Mutex::new(HashMap::new()),
            index_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, id: &Uuid) -> PathBuf {
        self.chats_dir.join(format!("{id}.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.chats_dir.join("index.json")
    }

    /// Serializes read-modify-write cycles for one conversation id.
    async fn record_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.record_locks
            .lock()
            .await
            .entry(id)
            .or_default()
            .clone()
    }

    async fn read_index(&self) -> Result<Vec<IndexEntry>, StoreError> {
        match fs::read_to_string(self.index_path()).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_index(&self, entries: &[IndexEntry]) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(entries)?;
        fs::write(self.index_path(), json).await?;
        Ok(())
    }

    async fn read_record(&self, id: &Uuid) -> Result<Option<Conversation>, StoreError> {
        match fs::read_to_string(self.record_path(id)).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(conversation)?;
        fs::write(self.record_path(&conversation.id), json).await?;
        Ok(())
    }

    /// All index entries, most recently active first. A missing index reads
    /// as empty.
    pub async fn list(&self) -> Result<Vec<IndexEntry>, StoreError> {
        let _index = self.index_lock.lock().await;
        let mut entries = self.read_index().await?;
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(entries)
    }

    /// Create an empty conversation and its index entry. Falls back to the
    /// default name when none is given.
    pub async fn create(&self, name: Option<String>) -> Result<Conversation, StoreError> {
        let name = match name {
            Some(n) if !n.trim().is_empty() => n,
            _ => DEFAULT_CONVERSATION_NAME.to_string(),
        };

        // v4 collisions are already negligible; the existence check makes the
        // id guarantee unconditional.
        let mut id = Uuid::new_v4();
        while fs::try_exists(self.record_path(&id)).await? {
            id = Uuid::new_v4();
        }

        let conversation = Conversation {
            id,
            name: name.clone(),
            messages: Vec::new(),
        };

        let lock = self.record_lock(id).await;
        let _guard = lock.lock().await;
        self.write_record(&conversation).await?;

        let _index = self.index_lock.lock().await;
        let mut entries = self.read_index().await?;
        entries.push(IndexEntry {
            id,
            name,
            updated_at: Utc::now(),
        });
        self.write_index(&entries).await?;

        Ok(conversation)
    }

    /// Full conversation by id, or `NotFound`.
    pub async fn get(&self, id: Uuid) -> Result<Conversation, StoreError> {
        self.read_record(&id).await?.ok_or(StoreError::NotFound(id))
    }

    /// Lenient read path: a missing record yields an empty list, not an error.
    pub async fn get_messages(&self, id: Uuid) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .read_record(&id)
            .await?
            .map(|c| c.messages)
            .unwrap_or_default())
    }

    /// Replace the message list wholesale, creating the record with the
    /// default name first if needed, then refresh the index timestamp.
    pub async fn save_messages(&self, id: Uuid, messages: Vec<Message>) -> Result<(), StoreError> {
        let lock = self.record_lock(id).await;
        let _guard = lock.lock().await;

        let mut conversation = self.read_record(&id).await?.unwrap_or(Conversation {
            id,
            name: DEFAULT_CONVERSATION_NAME.to_string(),
            messages: Vec::new(),
        });
        conversation.messages = messages;
        self.write_record(&conversation).await?;

        self.touch_index(id).await
    }

    /// Refresh `updatedAt` for an existing index entry; the name stays as-is.
    /// Name sync is rename's exclusive responsibility.
    async fn touch_index(&self, id: Uuid) -> Result<(), StoreError> {
        let _index = self.index_lock.lock().await;
        let mut entries = self.read_index().await?;
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.updated_at = Utc::now();
            self.write_index(&entries).await?;
        }
        Ok(())
    }

    /// Rename the record and mirror the name into the index. An absent or
    /// empty name is a successful no-op.
    pub async fn rename(&self, id: Uuid, name: Option<&str>) -> Result<(), StoreError> {
        let name = match name {
            Some(n) if !n.trim().is_empty() => n.to_string(),
            _ => return Ok(()),
        };

        let lock = self.record_lock(id).await;
        let _guard = lock.lock().await;

        let mut conversation = self
            .read_record(&id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        conversation.name = name.clone();
        self.write_record(&conversation).await?;

        let _index = self.index_lock.lock().await;
        let mut entries = self.read_index().await?;
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.name = name;
            entry.updated_at = Utc::now();
            self.write_index(&entries).await?;
        }
        Ok(())
    }

    /// Remove the record and any matching index entry. Succeeds even when the
    /// record is already gone.
    pub async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let lock = self.record_lock(id).await;
        let _guard = lock.lock().await;

        match fs::remove_file(self.record_path(&id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let _index = self.index_lock.lock().await;
        let mut entries = self.read_index().await?;
        entries.retain(|e| e.id != id);
        self.write_index(&entries).await?;
        Ok(())
    }
}
