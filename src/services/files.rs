use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::models::file::FileRecord;

/// Lookup of files owned by the file subsystem.
#[async_trait]
pub trait FileCatalog: Send + Sync {
    async fn find(&self, file_id: Uuid) -> Result<Option<FileRecord>, CatalogError>;
}

/// Fixed set of files held in memory.
#[derive(Default)]
pub struct MemoryFileCatalog {
    files: RwLock<HashMap<Uuid, FileRecord>>,
}

impl MemoryFileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: FileRecord) {
        self.files
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(record.id, record);
    }
}

#[async_trait]
impl FileCatalog for MemoryFileCatalog {
    async fn find(&self, file_id: Uuid) -> Result<Option<FileRecord>, CatalogError> {
        Ok(self
            .files
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&file_id)
            .cloned())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("File catalog unavailable: {0}")]
    Backend(String),
}
