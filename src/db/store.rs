use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::job::PreviewJob;

/// Error text recorded when the lease on a processing job runs out.
pub const LEASE_EXPIRED_ERROR: &str = "processing lease expired";

/// Durable record of preview jobs.
///
/// Every transition is a compare-and-set on the current status: methods that
/// return `Option` yield `None` when the row was not in the expected state,
/// so a worker's terminal update can never clobber a concurrent manual retry
/// or lease reap.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Return the in-flight job for `file_id` (see
    /// [`PreviewJob::is_in_flight`]), or insert a pending one. The flag is
    /// `true` when a new row was created.
    async fn create_or_get_active(
        &self,
        file_id: Uuid,
        requested_by: Option<&str>,
        max_attempts: i32,
    ) -> Result<(PreviewJob, bool), StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<PreviewJob>, StoreError>;

    /// Most recently created job for a file.
    async fn latest_for_file(&self, file_id: Uuid) -> Result<Option<PreviewJob>, StoreError>;

    /// `Pending → Processing`, counting a new attempt.
    async fn claim(&self, job_id: Uuid, now: DateTime<Utc>)
        -> Result<Option<PreviewJob>, StoreError>;

    /// `Processing → Completed`, clearing any previous error.
    async fn complete(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<PreviewJob>, StoreError>;

    /// `Processing → Failed`. `next_retry_at` is `None` for a terminal failure.
    async fn record_failure(
        &self,
        job_id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<Option<PreviewJob>, StoreError>;

    /// Manual retry: `Failed → Pending` with a fresh attempt budget. Refused
    /// while another job for the same file is pending or processing.
    async fn reset_for_retry(&self, job_id: Uuid) -> Result<Option<PreviewJob>, StoreError>;

    /// Move transient failures whose backoff elapsed back to `Pending`,
    /// skipping files that already have a pending or processing job.
    async fn requeue_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PreviewJob>, StoreError>;

    /// Pending jobs, oldest first.
    async fn pending(&self, limit: i64) -> Result<Vec<PreviewJob>, StoreError>;

    /// Fail processing jobs started before `cutoff`. Jobs with attempts left
    /// become due at `now`; the rest fail terminally.
    async fn reap_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<PreviewJob>, StoreError>;

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError>;

    /// Connectivity probe for health checks.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt job row: {0}")]
    Corrupt(String),
}
