use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of a preview job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Pending and processing jobs hold the single-flight slot for their file.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

/// A preview-generation job for one file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviewJob {
    pub id: Uuid,
    pub file_id: Uuid,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub requested_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PreviewJob {
    /// A fresh pending job with an untouched attempt budget.
    pub fn new(file_id: Uuid, requested_by: Option<String>, max_attempts: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            file_id,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
            next_retry_at: None,
            started_at: None,
            completed_at: None,
            requested_by,
            created_at: now,
            updated_at: now,
        }
    }

    /// Failed with no automatic retry left.
    pub fn is_exhausted(&self) -> bool {
        self.status == JobStatus::Failed && self.attempts >= self.max_attempts
    }

    /// Failed with attempts left and a scheduled automatic retry.
    pub fn is_awaiting_retry(&self) -> bool {
        self.status == JobStatus::Failed
            && self.attempts < self.max_attempts
            && self.next_retry_at.is_some()
    }

    /// Pending, processing, or failed but coming back on its own. A file has
    /// at most one such job.
    pub fn is_in_flight(&self) -> bool {
        self.status.is_active() || self.is_awaiting_retry()
    }

    /// Failed, attempts remain, and the backoff delay has elapsed.
    pub fn is_due_for_retry(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Failed
            && self.attempts < self.max_attempts
            && self.next_retry_at.is_some_and(|at| at <= now)
    }
}
