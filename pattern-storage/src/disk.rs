//! Local-disk blob backend.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::{BlobPath, BlobStore, StorageError, StorageResult};

/// Blobs stored as files under a base directory. Writes go to a temporary
/// sibling first and are renamed into place.
#[derive(Debug)]
pub struct DiskBlobStore {
    base: PathBuf,
    backend: &'static str,
    temp_seq: AtomicU64,
}

impl DiskBlobStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self::named(base, "disk")
    }

    /// Disk store reporting a different backend name, used when a local
    /// directory stands in for the cloud bucket.
    pub fn named(base: impl Into<PathBuf>, backend: &'static str) -> Self {
        Self {
            base: base.into(),
            backend,
            temp_seq: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn file_path(&self, path: &BlobPath) -> PathBuf {
        self.base.join(&path.dir).join(&path.name)
    }

    fn io_error(operation: &'static str, path: &Path, source: std::io::Error) -> StorageError {
        StorageError::Io {
            operation,
            path: path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    fn backend(&self) -> &'static str {
        self.backend
    }

    async fn get(&self, path: &BlobPath) -> StorageResult<Vec<u8>> {
        let file = self.file_path(path);
        match fs::read(&file).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::NotFound {
                backend: self.backend,
                path: path.to_string(),
            }),
            Err(err) => Err(Self::io_error("read", &file, err)),
        }
    }

    async fn create(&self, path: &BlobPath, bytes: Vec<u8>) -> StorageResult<()> {
        let dir = self.base.join(&path.dir);
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| Self::io_error("create dir", &dir, err))?;

        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        let temp = dir.join(format!(".{}.{}-{seq}.tmp", path.name, std::process::id()));
        let file = dir.join(&path.name);
        fs::write(&temp, &bytes)
            .await
            .map_err(|err| Self::io_error("write", &temp, err))?;
        if let Err(err) = fs::rename(&temp, &file).await {
            let _ = fs::remove_file(&temp).await;
            return Err(Self::io_error("rename", &file, err));
        }
        debug!(backend = self.backend, path = %path, bytes = bytes.len(), "blob written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::new(dir.path());
        let path = BlobPath::new("projects/1/models/2", "event_info.txt");

        store.create(&path, b"first".to_vec()).await.unwrap();
        store.create(&path, b"second".to_vec()).await.unwrap();
        assert_eq!(store.get(&path).await.unwrap(), b"second");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("projects/1/models/2"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskBlobStore::named(dir.path(), "cloud");
        let err = store.get(&BlobPath::new("nope", "x.txt")).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { backend: "cloud", .. }));
    }
}
