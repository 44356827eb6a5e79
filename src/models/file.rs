use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored file as seen by the preview pipeline. Owned by the file subsystem;
/// the pipeline only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct FileRecord {
    pub id: Uuid,
    pub name: String,
    /// Object key of the original upload.
    pub storage_key: String,
    pub mime_type: Option<String>,
}
