use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// Content type of every rendered preview.
pub const PREVIEW_CONTENT_TYPE: &str = "application/pdf";

/// Deterministic object key of the rendered preview for a file.
pub fn artifact_key(file_id: Uuid) -> String {
    format!("previews/{}.pdf", file_id)
}

/// Byte-level object storage used for source documents and rendered previews.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self { bucket })
    }
}

fn check_status(key: &str, status: u16) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        other => Err(StorageError::Status {
            key: key.to_string(),
            status: other,
        }),
    }
}

#[async_trait]
impl ObjectStorage for R2Client {
    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        check_status(key, response.status_code())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await?;
        check_status(key, response.status_code())?;
        Ok(response.to_vec())
    }
}

/// Object storage held in process memory.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .map(|(_, content_type)| content_type.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(key)
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), (data.to_vec(), content_type.to_string()));
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Unexpected storage status {status} for {key}")]
    Status { key: String, status: u16 },

    #[error("Storage configuration error: {0}")]
    Config(String),
}
