//! Durable storage for per-user delivery queues.
//!
//! The queue must survive a process restart, so every mutation is written
//! through a `QueueStore`. The file backend keeps one JSON document per
//! user and replaces it atomically (write-to-temp, rename).

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::models::QueuedMessage;
use crate::{Error, Result};
use pulse_proto::UserId;

/// Backing store for per-user delivery queues
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Load a user's queued messages (empty if none were ever saved)
    async fn load(&self, user: UserId) -> Result<Vec<QueuedMessage>>;

    /// Replace a user's queue snapshot
    async fn save(&self, user: UserId, messages: &[QueuedMessage]) -> Result<()>;

    /// Drop a user's queue entirely
    async fn clear(&self, user: UserId) -> Result<()>;
}

/// In-memory store for tests and embedders that manage durability themselves
#[derive(Default)]
pub struct MemoryQueueStore {
    queues: DashMap<UserId, Vec<QueuedMessage>>,
}

impl MemoryQueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn load(&self, user: UserId) -> Result<Vec<QueuedMessage>> {
        Ok(self.queues.get(&user).map(|q| q.clone()).unwrap_or_default())
    }

    async fn save(&self, user: UserId, messages: &[QueuedMessage]) -> Result<()> {
        self.queues.insert(user, messages.to_vec());
        Ok(())
    }

    async fn clear(&self, user: UserId) -> Result<()> {
        self.queues.remove(&user);
        Ok(())
    }
}

/// File-backed store: one JSON document per user under a base directory
pub struct FileQueueStore {
    dir: PathBuf,
}

impl FileQueueStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn queue_path(&self, user: UserId) -> PathBuf {
        self.dir.join(format!("{}.json", user.as_u64()))
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn load(&self, user: UserId) -> Result<Vec<QueuedMessage>> {
        let path = self.queue_path(user);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::Io(err)),
        };
        let messages = serde_json::from_slice(&bytes)?;
        debug!(user = %user, path = %path.display(), "Loaded queue snapshot");
        Ok(messages)
    }

    async fn save(&self, user: UserId, messages: &[QueuedMessage]) -> Result<()> {
        let path = self.queue_path(user);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(messages)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn clear(&self, user: UserId) -> Result<()> {
        let path = self.queue_path(user);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DraftMessage;
    use pulse_proto::{ClientId, RoomId};

    fn message(user: UserId) -> QueuedMessage {
        QueuedMessage::new(
            user,
            DraftMessage {
                room_id: RoomId::from("r1"),
                client_id: ClientId::from("c1"),
                content: "hello".to_string(),
                media: Vec::new(),
                ttl_seconds: None,
            },
        )
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryQueueStore::new();
        let user = UserId::new(1);

        assert!(store.load(user).await.unwrap().is_empty());

        let msg = message(user);
        store.save(user, &[msg.clone()]).await.unwrap();
        let loaded = store.load(user).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, msg.id);

        store.clear(user).await.unwrap();
        assert!(store.load(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let user = UserId::new(7);
        let msg = message(user);

        {
            let store = FileQueueStore::open(dir.path()).await.unwrap();
            store.save(user, &[msg.clone()]).await.unwrap();
        }

        // Reopen as a fresh process would
        let store = FileQueueStore::open(dir.path()).await.unwrap();
        let loaded = store.load(user).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].client_id, msg.client_id);
        assert_eq!(loaded[0].version, 1);
    }

    #[tokio::test]
    async fn test_file_store_missing_user_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileQueueStore::open(dir.path()).await.unwrap();
        assert!(store.load(UserId::new(99)).await.unwrap().is_empty());
        // Clearing a never-saved queue is fine
        store.clear(UserId::new(99)).await.unwrap();
    }
}
