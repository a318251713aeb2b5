use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{Storage, StorageError};

/// Configuration of the local filesystem backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStorageConfig {
    /// Directory holding the binary blobs of conda-store artifacts.
    pub storage_path: PathBuf,
    /// Unauthenticated URL where artifacts in the storage path are served
    /// from.
    pub storage_url: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("conda-store-state/storage"),
            storage_url: "http://localhost:8080/storage".to_string(),
        }
    }
}

/// Stores artifacts as plain files below a storage directory. `get_url`
/// assumes something else (the API server, a reverse proxy) serves that
/// directory at `storage_url`.
#[derive(Debug)]
pub struct LocalStorage {
    config: LocalStorageConfig,
}

impl LocalStorage {
    pub fn new(config: LocalStorageConfig) -> Self {
        Self { config }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.config.storage_path.join(key)
    }

    /// Writes into a temporary sibling and renames it into place, so readers
    /// never observe a torn blob.
    async fn write_atomic(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let destination = self.path_for(key);
        let parent = destination
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.storage_path.clone());
        fs_err::tokio::create_dir_all(&parent).await?;

        let (file, temp_path) = tempfile::NamedTempFile::new_in(&parent)?.into_parts();
        drop(file);
        fs_err::tokio::write(&temp_path, value).await?;
        fs_err::tokio::rename(&temp_path, &destination).await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), StorageError> {
        tracing::debug!(key, "storing artifact in local storage");
        self.write_atomic(key, value).await
    }

    async fn fset(&self, key: &str, path: &Path, _content_type: &str) -> Result<(), StorageError> {
        tracing::debug!(key, path = %path.display(), "copying file into local storage");
        let contents = fs_err::tokio::read(path).await?;
        self.write_atomic(key, contents).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        match fs_err::tokio::read(self.path_for(key)).await {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_url(&self, key: &str) -> Result<String, StorageError> {
        Ok(format!(
            "{}/{}",
            self.config.storage_url.trim_end_matches('/'),
            key
        ))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match fs_err::tokio::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            // Multiple artifact rows can point at the same key (log files);
            // later deletes find the blob already gone.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn storage(dir: &tempfile::TempDir) -> LocalStorage {
        LocalStorage::new(LocalStorageConfig {
            storage_path: dir.path().to_path_buf(),
            storage_url: "http://conda-store.example.com/storage/".to_string(),
        })
    }

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        storage
            .set("lockfile/a.json", b"{}".to_vec(), "application/json")
            .await
            .unwrap();
        assert_eq!(storage.get("lockfile/a.json").await.unwrap(), b"{}");

        storage.delete("lockfile/a.json").await.unwrap();
        assert_matches!(
            storage.get("lockfile/a.json").await,
            Err(StorageError::NotFound { .. })
        );

        // deleting twice is fine
        storage.delete("lockfile/a.json").await.unwrap();
    }

    #[tokio::test]
    async fn fset_replaces_content_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let storage = std::sync::Arc::new(storage(&dir));

        let source_a = scratch.path().join("a");
        let source_b = scratch.path().join("b");
        fs_err::write(&source_a, vec![b'a'; 64 * 1024]).unwrap();
        fs_err::write(&source_b, vec![b'b'; 64 * 1024]).unwrap();

        storage.fset("archive/env.tar.gz", &source_a, "application/gzip").await.unwrap();

        let reader = {
            let storage = storage.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    let contents = storage.get("archive/env.tar.gz").await.unwrap();
                    assert!(
                        contents.iter().all(|b| *b == b'a') || contents.iter().all(|b| *b == b'b'),
                        "observed a torn write"
                    );
                }
            })
        };

        for i in 0..10 {
            let source = if i % 2 == 0 { &source_b } else { &source_a };
            storage.fset("archive/env.tar.gz", source, "application/gzip").await.unwrap();
        }
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn url_joins_key_onto_storage_url() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        assert_eq!(
            storage.get_url("logs/build-1.log").await.unwrap(),
            "http://conda-store.example.com/storage/logs/build-1.log"
        );
    }
}
