//! Persistent mapping-state storage for fieldmap runs.
//!
//! A store holds one [`MappingState`] per key (one key per CRM entity). The
//! file-backed store keeps every key in a single JSON document that is
//! replaced atomically on save.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fieldmap_core::MappingState;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fieldmap-storage";

type StateDocument = BTreeMap<String, MappingState>;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("state store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state document {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding mapping state: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StateStoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub key: String,
    pub digest: String,
    pub entries: usize,
    /// The stored state already had this digest; nothing was written.
    pub unchanged: bool,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// A key that was never saved loads as an empty state.
    async fn load(&self, key: &str) -> Result<MappingState, StateStoreError>;

    async fn save(&self, key: &str, state: &MappingState) -> Result<SaveOutcome, StateStoreError>;

    async fn keys(&self) -> Result<Vec<String>, StateStoreError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable digest of a state; key order is fixed by the underlying `BTreeMap`.
pub fn state_digest(state: &MappingState) -> Result<String, StateStoreError> {
    Ok(sha256_hex(&serde_json::to_vec(state)?))
}

#[derive(Debug)]
pub struct JsonFileStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn read_document(&self) -> Result<StateDocument, StateStoreError> {
        let exists = fs::try_exists(&self.path)
            .await
            .map_err(|e| StateStoreError::io(&self.path, e))?;
        if !exists {
            return Ok(StateDocument::new());
        }
        let bytes = fs::read(&self.path)
            .await
            .map_err(|e| StateStoreError::io(&self.path, e))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(StateDocument::new());
        }
        serde_json::from_slice(&bytes).map_err(|source| StateStoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Write via a temp file in the same directory and an atomic rename.
    async fn write_document(&self, document: &StateDocument) -> Result<(), StateStoreError> {
        let bytes = serde_json::to_vec_pretty(document)?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| StateStoreError::io(&parent, e))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StateStoreError::io(&temp_path, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| StateStoreError::io(&temp_path, e))?;
        file.flush()
            .await
            .map_err(|e| StateStoreError::io(&temp_path, e))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StateStoreError::io(&self.path, err));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn load(&self, key: &str) -> Result<MappingState, StateStoreError> {
        let mut document = self.read_document().await?;
        Ok(document.remove(key).unwrap_or_default())
    }

    async fn save(&self, key: &str, state: &MappingState) -> Result<SaveOutcome, StateStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        let digest = state_digest(state)?;

        let unchanged = match document.get(key) {
            Some(stored) => state_digest(stored)? == digest,
            None => false,
        };
        if !unchanged {
            document.insert(key.to_string(), state.clone());
            self.write_document(&document).await?;
        }
        debug!(key, path = %self.path.display(), %digest, unchanged, "saved mapping state");

        Ok(SaveOutcome {
            key: key.to_string(),
            digest,
            entries: state.len(),
            unchanged,
        })
    }

    async fn keys(&self) -> Result<Vec<String>, StateStoreError> {
        Ok(self.read_document().await?.into_keys().collect())
    }
}

/// Process-local store, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    document: Mutex<StateDocument>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(key: impl Into<String>, state: MappingState) -> Self {
        let mut document = StateDocument::new();
        document.insert(key.into(), state);
        Self {
            document: Mutex::new(document),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &str) -> Result<MappingState, StateStoreError> {
        Ok(self.document.lock().await.get(key).cloned().unwrap_or_default())
    }

    async fn save(&self, key: &str, state: &MappingState) -> Result<SaveOutcome, StateStoreError> {
        let digest = state_digest(state)?;
        let mut document = self.document.lock().await;
        let unchanged = document.get(key) == Some(state);
        if !unchanged {
            document.insert(key.to_string(), state.clone());
        }
        Ok(SaveOutcome {
            key: key.to_string(),
            digest,
            entries: state.len(),
            unchanged,
        })
    }

    async fn keys(&self) -> Result<Vec<String>, StateStoreError> {
        Ok(self.document.lock().await.keys().cloned().collect())
    }
}
