//! Tenant-scoped key-value storage
//!
//! The vault persists each account record as one opaque value under a
//! `(tenant, key)` pair. A backend must make `put` atomic from the
//! caller's point of view: a concurrent reader sees either the old or
//! the new value, never a partial write.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Error, Result};

/// Storage collaborator.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Value stored under `key`, or `None` if absent.
    async fn get(&self, tenant: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, tenant: &str, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`. Returns whether a value was present.
    async fn delete(&self, tenant: &str, key: &str) -> Result<bool>;
}

/// In-memory backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Storage("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get(&self, tenant: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .lock()?
            .get(&(tenant.to_string(), key.to_string()))
            .cloned())
    }

    async fn put(&self, tenant: &str, key: &str, value: Vec<u8>) -> Result<()> {
        self.lock()?
            .insert((tenant.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, tenant: &str, key: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .remove(&(tenant.to_string(), key.to_string()))
            .is_some())
    }
}

/// Filesystem backend: one file per value under
/// `<root>/<tenant>/<key>.json`.
///
/// Tenant and key are base64url-encoded into path components so that
/// arbitrary names cannot escape the root. Writes go to a temporary
/// file unique to the writer that is then renamed over the target.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tenant_dir(&self, tenant: &str) -> PathBuf {
        self.root.join(URL_SAFE_NO_PAD.encode(tenant))
    }

    fn path_for(&self, tenant: &str, key: &str) -> PathBuf {
        self.tenant_dir(tenant)
            .join(format!("{}.json", URL_SAFE_NO_PAD.encode(key)))
    }
}

#[async_trait]
impl Storage for FileStore {
    async fn get(&self, tenant: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(tenant, key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("read {}: {e}", path.display()))),
        }
    }

    async fn put(&self, tenant: &str, key: &str, value: Vec<u8>) -> Result<()> {
        let dir = self.tenant_dir(tenant);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Storage(format!("create {}: {e}", dir.display())))?;

        let path = self.path_for(tenant, key);
        let target = path.clone();
        // One temp file per writer, in the target directory.
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = NamedTempFile::new_in(&dir)
                .map_err(|e| Error::Storage(format!("temp file in {}: {e}", dir.display())))?;
            tmp.write_all(&value)
                .and_then(|()| tmp.as_file().sync_all())
                .map_err(|e| Error::Storage(format!("write {}: {e}", tmp.path().display())))?;
            tmp.persist(&target)
                .map_err(|e| Error::Storage(format!("rename to {}: {}", target.display(), e.error)))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Storage(format!("store task failed: {e}")))??;

        debug!(path = %path.display(), "Stored value");
        Ok(())
    }

    async fn delete(&self, tenant: &str, key: &str) -> Result<bool> {
        let path = self.path_for(tenant, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Storage(format!("remove {}: {e}", path.display()))),
        }
    }
}
