use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{JobStatus, PreviewJob};

/// Job state returned by the convert, status and retry endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub file_id: Uuid,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the job was stored but the work queue had no room; the retry
    /// sweep admits it later.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub queue_full: bool,
}

impl From<PreviewJob> for JobResponse {
    fn from(job: PreviewJob) -> Self {
        Self {
            job_id: job.id,
            file_id: job.file_id,
            status: job.status,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            last_error: job.last_error,
            next_retry_at: job.next_retry_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            created_at: job.created_at,
            updated_at: job.updated_at,
            queue_full: false,
        }
    }
}

/// A freshly minted preview link.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    /// Relative URL suitable for an iframe `src`.
    pub url: String,
}

/// Query string of the preview proxy.
#[derive(Debug, Deserialize, Validate)]
pub struct PreviewQuery {
    #[garde(skip)]
    pub file_id: Uuid,

    #[garde(length(min = 1, max = 1024))]
    pub token: String,
}
