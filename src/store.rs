//! Durable session persistence.
//!
//! The store is a thin key-value mapping from `key_hash` to the serialized
//! session. It performs no policy or validity checks: it returns whatever was
//! put. Two implementations are provided: an in-memory map for tests and
//! short-lived processes, and a directory of JSON files that survives
//! process restart.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use alloy::hex;

use crate::session::{KeyHash, Session};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persistence capability for sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(&self, session: &Session) -> Result<(), StoreError>;
    async fn get(&self, key_hash: &KeyHash) -> Result<Option<Session>, StoreError>;
    /// Returns whether an entry was actually removed.
    async fn delete(&self, key_hash: &KeyHash) -> Result<bool, StoreError>;
    async fn list_by_master(&self, master_key_hash: &KeyHash) -> Result<Vec<Session>, StoreError>;
}

/// In-memory store. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<KeyHash, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn put(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().expect("session map poisoned");
        sessions.insert(session.key_hash, session.clone());
        Ok(())
    }

    async fn get(&self, key_hash: &KeyHash) -> Result<Option<Session>, StoreError> {
        let sessions = self.sessions.read().expect("session map poisoned");
        Ok(sessions.get(key_hash).cloned())
    }

    async fn delete(&self, key_hash: &KeyHash) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().expect("session map poisoned");
        Ok(sessions.remove(key_hash).is_some())
    }

    async fn list_by_master(&self, master_key_hash: &KeyHash) -> Result<Vec<Session>, StoreError> {
        let sessions = self.sessions.read().expect("session map poisoned");
        Ok(sessions
            .values()
            .filter(|s| &s.master_key_hash == master_key_hash)
            .cloned()
            .collect())
    }
}

/// File-backed store: one JSON document per session under a directory.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Opens (and creates, if missing) the storage directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key_hash: &KeyHash) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(key_hash.0)))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    #[tracing::instrument(skip_all, fields(key_hash = %session.key_hash))]
    async fn put(&self, session: &Session) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(session)?;
        // Write-then-rename keeps a crash from leaving a torn document.
        let tmp = self.path_for(&session.key_hash).with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, self.path_for(&session.key_hash)).await?;
        Ok(())
    }

    async fn get(&self, key_hash: &KeyHash) -> Result<Option<Session>, StoreError> {
        match tokio::fs::read(self.path_for(key_hash)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key_hash: &KeyHash) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.path_for(key_hash)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_by_master(&self, master_key_hash: &KeyHash) -> Result<Vec<Session>, StoreError> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Session>(&bytes) {
                Ok(session) if &session.master_key_hash == master_key_hash => {
                    sessions.push(session);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable session document");
                }
            }
        }
        Ok(sessions)
    }
}
