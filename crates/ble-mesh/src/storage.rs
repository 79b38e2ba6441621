//! Persisted-state store for sequence numbers and replay protection

use crate::error::{MeshError, MeshResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Key of the IV Index and sequence reservations
pub const SEQUENCE_KEY: &str = "sequence";

/// Key of the replay protection list
pub const REPLAY_KEY: &str = "replay";

/// Trait for the engine's durable key-value storage
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the value stored under `key`, if any
    async fn load(&self, key: &str) -> MeshResult<Option<Vec<u8>>>;

    /// Store `data` under `key`, replacing the previous value
    async fn store(&self, key: &str, data: &[u8]) -> MeshResult<()>;
}

/// Load and deserialize a JSON value.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> MeshResult<Option<T>> {
    match store.load(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Serialize and store a JSON value.
pub async fn store_json<T: Serialize + Sync>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
) -> MeshResult<()> {
    let bytes = serde_json::to_vec(value)?;
    store.store(key, &bytes).await
}

/// Volatile storage for tests and short-lived engines
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, key: &str) -> MeshResult<Option<Vec<u8>>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn store(&self, key: &str, data: &[u8]) -> MeshResult<()> {
        self.data.write().await.insert(key.to_string(), data.to_vec());
        Ok(())
    }
}

/// One JSON file per key inside a directory
///
/// Writes go to a temporary file that is renamed over the target, so a crash
/// leaves either the old or the new value.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    directory: PathBuf,
}

impl FileStateStore {
    pub async fn new(directory: impl AsRef<Path>) -> MeshResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&directory).await?;
        Ok(Self { directory })
    }

    fn path(&self, key: &str) -> MeshResult<PathBuf> {
        let valid = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
        if key.is_empty() || !key.chars().all(valid) {
            return Err(MeshError::Storage(format!("invalid storage key {:?}", key)));
        }
        Ok(self.directory.join(format!("{}.json", key)))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, key: &str) -> MeshResult<Option<Vec<u8>>> {
        let path = self.path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn store(&self, key: &str, data: &[u8]) -> MeshResult<()> {
        let path = self.path(key)?;
        let temporary = path.with_extension("json.tmp");
        tokio::fs::write(&temporary, data).await?;
        tokio::fs::rename(&temporary, &path).await?;
        debug!("Persisted {} ({} bytes)", key, data.len());
        Ok(())
    }
}
