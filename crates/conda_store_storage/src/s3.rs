use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use opendal::layers::RetryLayer;
use opendal::services::S3Config;
use opendal::{Configurator, ErrorKind, Operator};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::{Storage, StorageError};

const PRESIGNED_URL_EXPIRY: Duration = Duration::from_secs(3600);
const UPLOAD_CHUNK_BYTES: usize = 8 * 1024 * 1024;

/// Configuration of the S3 compatible backend.
///
/// Two endpoints are configured: the internal one carries all server to
/// bucket I/O, the external one is only used to presign URLs handed out to
/// users (with minio in a container the two differ).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3StorageConfig {
    /// Endpoint conda-store itself uses to get/set blobs, e.g. `minio:9000`.
    pub internal_endpoint: String,
    /// Endpoint users fetch blobs from, e.g. `localhost:9000`.
    pub external_endpoint: String,
    /// Access key for the bucket; when unset the SDK credential chain of the
    /// environment applies.
    pub access_key: Option<String>,
    /// Secret key for the bucket.
    pub secret_key: Option<String>,
    /// Region of the bucket.
    pub region: String,
    /// Name of the bucket.
    pub bucket_name: String,
    /// Use TLS towards the internal endpoint.
    pub internal_secure: bool,
    /// Use TLS towards the external endpoint.
    pub external_secure: bool,
}

impl Default for S3StorageConfig {
    fn default() -> Self {
        Self {
            internal_endpoint: String::new(),
            external_endpoint: String::new(),
            access_key: None,
            secret_key: None,
            region: "us-east-1".to_string(),
            bucket_name: "conda-store".to_string(),
            internal_secure: true,
            external_secure: true,
        }
    }
}

impl S3StorageConfig {
    fn operator(&self, endpoint: &str, secure: bool) -> Result<Operator, StorageError> {
        let scheme = if secure { "https" } else { "http" };
        let mut s3_config = S3Config::default();
        s3_config.bucket = self.bucket_name.clone();
        s3_config.region = Some(self.region.clone());
        s3_config.endpoint = Some(format!("{scheme}://{endpoint}"));
        s3_config.access_key_id = self.access_key.clone();
        s3_config.secret_access_key = self.secret_key.clone();
        // minio style deployments address buckets by path
        s3_config.enable_virtual_host_style = false;

        let builder = s3_config.into_builder();
        Ok(Operator::new(builder)?.layer(RetryLayer::new()).finish())
    }
}

/// Stores artifacts in an S3 compatible bucket, presigning `get_url` against
/// the external endpoint.
pub struct S3Storage {
    config: S3StorageConfig,
    internal: Operator,
    external: Operator,
}

impl S3Storage {
    /// Builds the two operators and verifies the bucket exists. A missing
    /// bucket is fatal to startup.
    pub async fn connect(config: S3StorageConfig) -> Result<Self, StorageError> {
        tracing::debug!(
            internal_endpoint = %config.internal_endpoint,
            region = %config.region,
            bucket = %config.bucket_name,
            "setting up s3 storage"
        );
        let internal = config.operator(&config.internal_endpoint, config.internal_secure)?;
        let external = config.operator(&config.external_endpoint, config.external_secure)?;

        if let Err(source) = internal.check().await {
            return Err(StorageError::BucketMissing {
                bucket: config.bucket_name.clone(),
                source,
            });
        }

        Ok(Self {
            config,
            internal,
            external,
        })
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn set(&self, key: &str, value: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        tracing::debug!(key, bucket = %self.config.bucket_name, "storing artifact in s3");
        self.internal
            .write_with(key, value)
            .content_type(content_type)
            .await?;
        Ok(())
    }

    async fn fset(&self, key: &str, path: &Path, content_type: &str) -> Result<(), StorageError> {
        tracing::debug!(key, path = %path.display(), "uploading file to s3");
        let mut file = fs_err::tokio::File::open(path).await?;
        let mut writer = self
            .internal
            .writer_with(key)
            .content_type(content_type)
            .await?;

        let mut chunk = vec![0u8; UPLOAD_CHUNK_BYTES];
        loop {
            let read = file.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            writer.write(chunk[..read].to_vec()).await?;
        }
        writer.close().await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        match self.internal.read(key).await {
            Ok(buffer) => Ok(buffer.to_vec()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_url(&self, key: &str) -> Result<String, StorageError> {
        let request = self.external.presign_read(key, PRESIGNED_URL_EXPIRY).await?;
        Ok(request.uri().to_string())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.internal.delete(key).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
