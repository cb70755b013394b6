//! Document persistence.
//!
//! The server stores one [`Changeset`] per document: the full authoritative
//! state. A client stores a [`ClientSave`]: its mirror of the server state
//! plus the local edits the server has not acknowledged yet.
//!
//! On-disk layout of [`FileStore`]:
//! ```text
//! <dir>/
//!   <doc_id>.doc       server state   ─┐ JSON, LZ4 block format
//!   <doc_id>.client    client save    ─┘ with prepended size
//! ```
//! Writes go to a `.tmp` sibling first and are renamed into place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use canopy_core::Changeset;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("decompression error: {0}")]
    Compression(#[from] lz4_flex::block::DecompressError),
    #[error("invalid document id {0:?}")]
    InvalidDocId(String),
}

/// What a client keeps across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSave {
    pub base: Changeset,
    pub changes: Changeset,
}

#[async_trait]
pub trait ServerDocPersistence: Send + Sync {
    async fn load(&self, doc_id: &str) -> Result<Option<Changeset>, PersistenceError>;
    async fn save(&self, doc_id: &str, state: &Changeset) -> Result<(), PersistenceError>;
}

#[async_trait]
pub trait ClientDocPersistence: Send + Sync {
    async fn load(&self, doc_id: &str) -> Result<Option<ClientSave>, PersistenceError>;
    async fn save(&self, doc_id: &str, save: &ClientSave) -> Result<(), PersistenceError>;
}

/// Volatile server store.
#[derive(Debug, Default)]
pub struct InMemoryServerPersistence {
    docs: RwLock<HashMap<String, Changeset>>,
}

impl InMemoryServerPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with documents.
    pub fn with_docs<I>(docs: I) -> Self
    where
        I: IntoIterator<Item = (String, Changeset)>,
    {
        Self {
            docs: RwLock::new(docs.into_iter().collect()),
        }
    }
}

#[async_trait]
impl ServerDocPersistence for InMemoryServerPersistence {
    async fn load(&self, doc_id: &str) -> Result<Option<Changeset>, PersistenceError> {
        Ok(self.docs.read().await.get(doc_id).cloned())
    }

    async fn save(&self, doc_id: &str, state: &Changeset) -> Result<(), PersistenceError> {
        self.docs.write().await.insert(doc_id.to_string(), state.clone());
        Ok(())
    }
}

/// Volatile client store.
#[derive(Debug, Default)]
pub struct InMemoryClientPersistence {
    docs: RwLock<HashMap<String, ClientSave>>,
}

impl InMemoryClientPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientDocPersistence for InMemoryClientPersistence {
    async fn load(&self, doc_id: &str) -> Result<Option<ClientSave>, PersistenceError> {
        Ok(self.docs.read().await.get(doc_id).cloned())
    }

    async fn save(&self, doc_id: &str, save: &ClientSave) -> Result<(), PersistenceError> {
        self.docs.write().await.insert(doc_id.to_string(), save.clone());
        Ok(())
    }
}

/// Directory of compressed JSON snapshots, usable from either side.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

const SERVER_EXT: &str = "doc";
const CLIENT_EXT: &str = "client";

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        log::info!("file store opened at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, doc_id: &str, ext: &str) -> Result<PathBuf, PersistenceError> {
        let valid = !doc_id.is_empty()
            && !doc_id.starts_with('.')
            && doc_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(PersistenceError::InvalidDocId(doc_id.to_string()));
        }
        Ok(self.dir.join(format!("{doc_id}.{ext}")))
    }

    async fn read<T: for<'de> Deserialize<'de>>(&self, path: PathBuf) -> Result<Option<T>, PersistenceError> {
        let compressed = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let json = lz4_flex::decompress_size_prepended(&compressed)?;
        Ok(Some(serde_json::from_slice(&json)?))
    }

    async fn write<T: Serialize>(&self, path: PathBuf, value: &T) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec(value)?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, &compressed).await?;
        tokio::fs::rename(&tmp, &path).await?;

        log::debug!(
            "wrote {} ({} bytes, {} compressed)",
            path.display(),
            json.len(),
            compressed.len()
        );
        Ok(())
    }
}

#[async_trait]
impl ServerDocPersistence for FileStore {
    async fn load(&self, doc_id: &str) -> Result<Option<Changeset>, PersistenceError> {
        self.read(self.path_for(doc_id, SERVER_EXT)?).await
    }

    async fn save(&self, doc_id: &str, state: &Changeset) -> Result<(), PersistenceError> {
        self.write(self.path_for(doc_id, SERVER_EXT)?, state).await
    }
}

#[async_trait]
impl ClientDocPersistence for FileStore {
    async fn load(&self, doc_id: &str) -> Result<Option<ClientSave>, PersistenceError> {
        self.read(self.path_for(doc_id, CLIENT_EXT)?).await
    }

    async fn save(&self, doc_id: &str, save: &ClientSave) -> Result<(), PersistenceError> {
        self.write(self.path_for(doc_id, CLIENT_EXT)?, save).await
    }
}
