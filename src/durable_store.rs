//! Durable key-value storage used to persist snapshots and sticky values across restarts.
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::PathBuf,
    sync::Mutex,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};

use crate::{Result, UserIdentity};

const KEY_PREFIX: &str = "statsig";

/// Blob storage keyed by string. Implementations must be safe to share between tasks.
///
/// Failures are reported but callers in this crate treat them as non-fatal.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read a blob. Returns `Ok(None)` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a blob, replacing any previous value.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Delete a blob. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every blob in the store.
    async fn delete_all(&self) -> Result<()>;
}

pub(crate) fn snapshot_key(user: &UserIdentity) -> String {
    format!("{KEY_PREFIX}.cache.{}", user.stable_key())
}

pub(crate) fn sticky_user_key(user: &UserIdentity) -> String {
    format!("{KEY_PREFIX}.sticky_user.{}", user.stable_key())
}

pub(crate) fn sticky_device_key(device_id: &str) -> String {
    format!("{KEY_PREFIX}.sticky_device.{device_id}")
}

/// Process-local store. Contents are lost when the last handle is dropped.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> InMemoryStore {
        InMemoryStore::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("thread holding in-memory store lock should not panic")
            .len()
    }

    /// Returns `true` if no blob is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .lock()
            .expect("thread holding in-memory store lock should not panic");
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .expect("thread holding in-memory store lock should not panic");
        entries.insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .expect("thread holding in-memory store lock should not panic");
        entries.remove(key);
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .expect("thread holding in-memory store lock should not panic");
        entries.clear();
        Ok(())
    }
}

/// Store that keeps one file per key inside `directory`.
///
/// File names are the URL-safe base64 encoding of the key's SHA-256 digest, so any key, however
/// long, maps to a valid file name of fixed length.
#[derive(Debug, Clone)]
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `directory`. The directory is created lazily on first write.
    pub fn new(directory: impl Into<PathBuf>) -> FileStore {
        FileStore {
            directory: directory.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.directory
            .join(URL_SAFE_NO_PAD.encode(Sha256::digest(key.as_bytes())))
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory).await?;
        tokio::fs::write(self.path_for(key), value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    async fn delete_all(&self) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}
