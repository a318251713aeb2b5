//! Artifact storage backends for conda-store.
//!
//! Builds produce byte blobs (lockfiles, logs, archives, installers) that are
//! persisted outside the database, addressed by opaque string keys. The
//! [`Storage`] trait is the whole contract; exactly one implementation is
//! active per process, selected by configuration at startup.

use std::path::Path;

use async_trait::async_trait;

mod local;
mod s3;

pub use local::{LocalStorage, LocalStorageConfig};
pub use s3::{S3Storage, S3StorageConfig};

/// Errors surfaced by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No blob is stored under the requested key.
    #[error("artifact '{key}' not found")]
    NotFound { key: String },

    /// The configured S3 bucket is absent or unreachable. Fatal at startup.
    #[error("s3 bucket '{bucket}' does not exist or is not reachable")]
    BucketMissing {
        bucket: String,
        #[source]
        source: opendal::Error,
    },

    #[error(transparent)]
    Backend(#[from] opendal::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The storage contract: blob in, blob out, keyed by opaque strings.
///
/// `set` and `fset` are atomic per key: a concurrent `get` observes either
/// the previous blob or the complete new one, never a torn write. Keys of
/// non-log artifacts are write-once by convention; the database unique guard
/// on artifact rows enforces that, not the backend.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stores a blob of bytes under `key`.
    async fn set(&self, key: &str, value: Vec<u8>, content_type: &str)
        -> Result<(), StorageError>;

    /// Uploads the file at `path` under `key`.
    async fn fset(&self, key: &str, path: &Path, content_type: &str) -> Result<(), StorageError>;

    /// Retrieves the blob stored under `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Returns a URL under which users can fetch the blob stored under `key`.
    async fn get_url(&self, key: &str) -> Result<String, StorageError>;

    /// Removes the blob stored under `key`. Removing an absent key is not an
    /// error; log keys are deleted once per registered artifact row.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}
