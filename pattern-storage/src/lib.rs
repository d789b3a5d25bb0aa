//! Storage tiers for mined patterns.
//!
//! Blobs live on local disk and in a cloud bucket behind the same
//! [`BlobStore`] interface. [`PatternStore`] layers bounded in-memory caches
//! over both and reads through memory, then disk, then cloud.

#![warn(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo
)]
#![deny(clippy::unwrap_in_result, clippy::panic_in_result_fn)]

pub mod cloud;
pub mod codec;
pub mod disk;
pub mod layout;
pub mod source;
pub mod tiered;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use cloud::CloudBlobStore;
pub use disk::DiskBlobStore;
pub use layout::BlobPath;
pub use source::StoreCatalogSource;
pub use tiered::{CacheConfig, PatternStore, StoreCacheStats};

/// Errors surfaced by blob backends and the tiered store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend has no blob at this path.
    #[error("{backend} has no blob at {path}")]
    NotFound { backend: &'static str, path: String },
    /// Neither disk nor cloud holds the blob.
    #[error("no storage tier holds {0}")]
    CacheChainExhausted(String),
    /// A stored blob does not decode.
    #[error("corrupt blob {path} at line {line}: {reason}")]
    Decode {
        path: String,
        /// 1-based line of the bad record.
        line: usize,
        reason: String,
    },
    /// A value could not be serialized for writing.
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{operation} {path} failed: {source}")]
    Io {
        operation: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// Transport failure or unexpected status from the cloud backend.
    #[error("cloud request {url} failed: {reason}")]
    Http { url: String, reason: String },
}

impl StorageError {
    /// Whether the error only means the blob is absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::CacheChainExhausted(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Named blobs addressed by directory and file name.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Short backend name used in logs and errors.
    fn backend(&self) -> &'static str;

    /// Read a whole blob. Absent blobs are [`StorageError::NotFound`].
    async fn get(&self, path: &BlobPath) -> StorageResult<Vec<u8>>;

    /// Create or replace a blob.
    async fn create(&self, path: &BlobPath, bytes: Vec<u8>) -> StorageResult<()>;
}

pub type DynBlobStore = Arc<dyn BlobStore>;
