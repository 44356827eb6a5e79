use std::sync::Arc;
use uuid::Uuid;

use crate::db::store::StoreError;
use crate::models::job::{JobStatus, PreviewJob};
use crate::services::files::CatalogError;
use crate::services::pipeline::Dependencies;
use crate::services::queue::{JobQueue, QueueError};
use crate::services::replay::ReplayError;
use crate::services::storage::{artifact_key, StorageError, PREVIEW_CONTENT_TYPE};
use crate::services::token::{MintedToken, TokenError};

/// Result of a convert or manual-retry request.
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub job: PreviewJob,
    /// `false` when an already active job was returned.
    pub created: bool,
    /// The job is stored but the queue had no room; the sweep admits it later.
    pub queue_full: bool,
}

/// Rendered preview bytes ready to stream.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

/// Request-facing operations of the preview subsystem.
#[derive(Clone)]
pub struct PreviewService {
    deps: Dependencies,
    queue: Arc<JobQueue>,
    max_attempts: i32,
}

impl PreviewService {
    pub fn new(deps: Dependencies, queue: Arc<JobQueue>, max_attempts: i32) -> Self {
        Self {
            deps,
            queue,
            max_attempts,
        }
    }

    /// Create (or return the active) preview job for a file and try to queue it.
    pub async fn enqueue(
        &self,
        file_id: Uuid,
        requested_by: Option<&str>,
    ) -> Result<EnqueueOutcome, PreviewError> {
        if self.deps.files.find(file_id).await?.is_none() {
            return Err(PreviewError::FileNotFound(file_id));
        }

        let (job, created) = self
            .deps
            .store
            .create_or_get_active(file_id, requested_by, self.max_attempts)
            .await?;

        if !created {
            tracing::debug!(job_id = %job.id, file_id = %file_id, "Returning active preview job");
            return Ok(EnqueueOutcome {
                job,
                created,
                queue_full: false,
            });
        }

        metrics::counter!("preview_jobs_enqueued_total").increment(1);
        let queue_full = self.admit(&job);
        tracing::info!(
            job_id = %job.id,
            file_id = %file_id,
            queue_full,
            "Preview job created"
        );
        Ok(EnqueueOutcome {
            job,
            created,
            queue_full,
        })
    }

    /// Latest job for a file, if any.
    pub async fn status(&self, file_id: Uuid) -> Result<Option<PreviewJob>, PreviewError> {
        Ok(self.deps.store.latest_for_file(file_id).await?)
    }

    /// Manual retry of a failed job: fresh attempt budget, no backoff wait.
    pub async fn retry(&self, file_id: Uuid) -> Result<EnqueueOutcome, PreviewError> {
        let latest = self
            .deps
            .store
            .latest_for_file(file_id)
            .await?
            .ok_or(PreviewError::NoJob(file_id))?;

        if latest.status != JobStatus::Failed {
            return Err(PreviewError::NotRetryable(latest.status));
        }

        let job = match self.deps.store.reset_for_retry(latest.id).await? {
            Some(job) => job,
            None => {
                // Lost a race with the sweep or another retry.
                let status = self
                    .deps
                    .store
                    .get(latest.id)
                    .await?
                    .map_or(latest.status, |job| job.status);
                return Err(PreviewError::NotRetryable(status));
            }
        };

        let queue_full = self.admit(&job);
        tracing::info!(job_id = %job.id, file_id = %file_id, queue_full, "Manual retry requested");
        Ok(EnqueueOutcome {
            job,
            created: false,
            queue_full,
        })
    }

    /// Mint a single-use preview token for a file whose latest job completed.
    pub async fn issue_token(&self, file_id: Uuid) -> Result<MintedToken, PreviewError> {
        let latest = self.deps.store.latest_for_file(file_id).await?;
        match latest.as_ref().map(|job| job.status) {
            Some(JobStatus::Completed) => {}
            status => return Err(PreviewError::NotReady(status)),
        }

        let minted = self.deps.tokens.mint(file_id)?;
        metrics::counter!("preview_tokens_issued_total").increment(1);
        tracing::debug!(file_id = %file_id, expires_at = minted.claims.expires_at, "Preview token issued");
        Ok(minted)
    }

    /// Exchange a token for the rendered preview.
    ///
    /// Order matters: signature and expiry, then file binding, then the
    /// single-use check. A token is only burned once it is known to be genuine
    /// and aimed at this file.
    pub async fn open_preview(&self, file_id: Uuid, token: &str) -> Result<Artifact, AccessDenied> {
        let claims = self.deps.tokens.validate(token)?;

        if claims.file_id != file_id {
            return Err(AccessDenied::FileMismatch);
        }

        let fresh = self
            .deps
            .replay
            .check_and_consume(&claims.nonce, claims.expires_at())
            .await?;
        if !fresh {
            return Err(AccessDenied::Replayed);
        }

        let bytes = self.deps.storage.download(&artifact_key(file_id)).await?;
        Ok(Artifact {
            bytes,
            content_type: PREVIEW_CONTENT_TYPE,
        })
    }

    /// Returns `true` when the queue was full.
    fn admit(&self, job: &PreviewJob) -> bool {
        match self.queue.try_admit(job.id) {
            Ok(_) => false,
            Err(QueueError::Full) => {
                metrics::counter!("preview_queue_full_total").increment(1);
                tracing::warn!(job_id = %job.id, "Job queue full, deferring to retry sweep");
                true
            }
            Err(QueueError::Closed) => {
                tracing::warn!(job_id = %job.id, "Job queue closed, deferring to retry sweep");
                true
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("File {0} not found")]
    FileNotFound(Uuid),

    #[error("No preview job for file {0}")]
    NoJob(Uuid),

    #[error("Only failed jobs can be retried (job is {0})")]
    NotRetryable(JobStatus),

    #[error("Preview is not ready")]
    NotReady(Option<JobStatus>),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),
}

/// Why a preview request was refused. Logged server-side only; callers always
/// see the same unauthorized response.
#[derive(Debug, thiserror::Error)]
pub enum AccessDenied {
    #[error("invalid token: {0}")]
    Token(#[from] TokenError),

    #[error("token was issued for a different file")]
    FileMismatch,

    #[error("token already used")]
    Replayed,

    #[error("replay store unavailable: {0}")]
    ReplayStore(#[from] ReplayError),

    #[error("artifact unavailable: {0}")]
    Artifact(#[from] StorageError),
}

impl AccessDenied {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            AccessDenied::Token(TokenError::Expired) => "expired",
            AccessDenied::Token(TokenError::Tampered) => "tampered",
            AccessDenied::Token(_) => "malformed",
            AccessDenied::FileMismatch => "file_mismatch",
            AccessDenied::Replayed => "replayed",
            AccessDenied::ReplayStore(_) => "replay_store",
            AccessDenied::Artifact(_) => "artifact",
        }
    }
}
