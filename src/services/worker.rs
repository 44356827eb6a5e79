use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::job::PreviewJob;
use crate::services::converter::ConversionError;
use crate::services::files::CatalogError;
use crate::services::pipeline::Dependencies;
use crate::services::queue::JobQueue;
use crate::services::retry::RetryPolicy;
use crate::services::storage::{artifact_key, StorageError, PREVIEW_CONTENT_TYPE};

/// Drives one job at a time through `Pending → Processing → Completed/Failed`.
pub struct Worker {
    deps: Dependencies,
    queue: Arc<JobQueue>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
}

impl Worker {
    pub fn new(
        deps: Dependencies,
        queue: Arc<JobQueue>,
        retry: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            deps,
            queue,
            retry,
            attempt_timeout,
        }
    }

    /// Start `count` workers sharing this worker's queue.
    pub fn spawn_pool(
        self: Arc<Self>,
        count: usize,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker_id| {
                let worker = Arc::clone(&self);
                let cancel = cancel.clone();
                tokio::spawn(async move { worker.run(worker_id, cancel).await })
            })
            .collect()
    }

    async fn run(&self, worker_id: usize, cancel: CancellationToken) {
        tracing::debug!(worker_id, "Worker started");
        loop {
            let job_id = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.queue.dequeue() => match next {
                    Some(job_id) => job_id,
                    None => break,
                },
            };
            self.process(job_id).await;
        }
        tracing::debug!(worker_id, "Worker stopped");
    }

    /// Claim and run one attempt of a job, recording the outcome in the store.
    ///
    /// Returns the job's state after this call, or `None` when the job could
    /// not be claimed (already taken, not pending) or the store is unreachable.
    /// Never propagates per-job errors.
    pub async fn process(&self, job_id: Uuid) -> Option<PreviewJob> {
        let job = match self.deps.store.claim(job_id, Utc::now()).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::debug!(job_id = %job_id, "Job no longer pending, skipping");
                return None;
            }
            Err(e) => {
                // The row stays pending; the sweep re-admits it.
                tracing::error!(job_id = %job_id, error = %e, "Failed to claim job");
                return None;
            }
        };

        tracing::info!(
            job_id = %job.id,
            file_id = %job.file_id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Processing preview job"
        );

        let start = Instant::now();
        let outcome = match tokio::time::timeout(self.attempt_timeout, self.attempt(&job)).await {
            Ok(result) => result,
            Err(_) => Err(AttemptError::TimedOut(self.attempt_timeout)),
        };
        let elapsed = start.elapsed();
        metrics::histogram!("preview_conversion_seconds").record(elapsed.as_secs_f64());

        match outcome {
            Ok(artifact_bytes) => self.finish(&job, artifact_bytes, elapsed).await,
            Err(e) => self.fail(&job, &e).await,
        }
    }

    async fn attempt(&self, job: &PreviewJob) -> Result<usize, AttemptError> {
        let file = self
            .deps
            .files
            .find(job.file_id)
            .await?
            .ok_or(AttemptError::FileMissing(job.file_id))?;

        tracing::debug!(job_id = %job.id, storage_key = %file.storage_key, "Downloading source");
        let source = self.deps.storage.download(&file.storage_key).await?;

        tracing::debug!(job_id = %job.id, source_bytes = source.len(), "Calling conversion service");
        let artifact = self.deps.converter.convert(&file.name, source).await?;

        self.deps
            .storage
            .upload(&artifact_key(job.file_id), &artifact, PREVIEW_CONTENT_TYPE)
            .await?;
        Ok(artifact.len())
    }

    async fn finish(
        &self,
        job: &PreviewJob,
        artifact_bytes: usize,
        elapsed: Duration,
    ) -> Option<PreviewJob> {
        match self.deps.store.complete(job.id, Utc::now()).await {
            Ok(Some(done)) => {
                metrics::counter!("preview_jobs_completed_total").increment(1);
                tracing::info!(
                    job_id = %done.id,
                    file_id = %done.file_id,
                    attempts = done.attempts,
                    artifact_bytes,
                    duration_ms = elapsed.as_millis() as u64,
                    "Preview job completed"
                );
                Some(done)
            }
            Ok(None) => {
                tracing::warn!(
                    job_id = %job.id,
                    "Job left processing state before completion was recorded"
                );
                self.current(job.id).await
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to record completion");
                None
            }
        }
    }

    async fn fail(&self, job: &PreviewJob, error: &AttemptError) -> Option<PreviewJob> {
        let terminal = job.attempts >= job.max_attempts;
        let next_retry_at = (!terminal).then(|| self.retry.next_retry_at(job.attempts, Utc::now()));
        let message = error.to_string();

        metrics::counter!("preview_jobs_failed_total", "terminal" => terminal.to_string())
            .increment(1);

        match self.deps.store.record_failure(job.id, &message, next_retry_at).await {
            Ok(Some(failed)) => {
                if terminal {
                    tracing::warn!(
                        job_id = %failed.id,
                        file_id = %failed.file_id,
                        attempts = failed.attempts,
                        error = %message,
                        "Preview job failed after max attempts"
                    );
                } else {
                    tracing::info!(
                        job_id = %failed.id,
                        file_id = %failed.file_id,
                        attempts = failed.attempts,
                        next_retry_at = ?failed.next_retry_at,
                        error = %message,
                        "Preview attempt failed, retry scheduled"
                    );
                }
                Some(failed)
            }
            Ok(None) => {
                tracing::warn!(
                    job_id = %job.id,
                    "Job left processing state before failure was recorded"
                );
                self.current(job.id).await
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to record failure");
                None
            }
        }
    }

    async fn current(&self, job_id: Uuid) -> Option<PreviewJob> {
        self.deps.store.get(job_id).await.ok().flatten()
    }
}

/// Why a single attempt failed. Every variant counts against the attempt budget.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("File {0} no longer exists")]
    FileMissing(Uuid),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    #[error("Attempt timed out after {0:?}")]
    TimedOut(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryJobStore;
    use crate::db::store::JobStore;
    use crate::models::job::JobStatus;
    use crate::models::file::FileRecord;
    use crate::services::converter::Converter;
    use crate::services::files::MemoryFileCatalog;
    use crate::services::replay::ReplayGuard;
    use crate::services::storage::{MemoryStorage, ObjectStorage};
    use crate::services::token::TokenIssuer;
    use async_trait::async_trait;

    struct SlowConverter;

    #[async_trait]
    impl Converter for SlowConverter {
        async fn convert(&self, _: &str, _: Vec<u8>) -> Result<Vec<u8>, ConversionError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(b"%PDF".to_vec())
        }
    }

    struct EchoConverter;

    #[async_trait]
    impl Converter for EchoConverter {
        async fn convert(&self, _: &str, source: Vec<u8>) -> Result<Vec<u8>, ConversionError> {
            Ok([b"%PDF-".as_slice(), source.as_slice()].concat())
        }
    }

    async fn fixture(
        converter: Arc<dyn Converter>,
        timeout: Duration,
    ) -> (Worker, Arc<MemoryJobStore>, Arc<MemoryStorage>, Uuid) {
        let store = Arc::new(MemoryJobStore::new());
        let files = Arc::new(MemoryFileCatalog::new());
        let storage = Arc::new(MemoryStorage::new());
        let file_id = Uuid::new_v4();
        files.insert(FileRecord {
            id: file_id,
            name: "report.docx".to_string(),
            storage_key: "uploads/report.docx".to_string(),
            mime_type: None,
        });
        storage
            .upload("uploads/report.docx", b"doc", "application/octet-stream")
            .await
            .unwrap();

        let deps = Dependencies {
            store: store.clone(),
            files,
            storage: storage.clone(),
            converter,
            tokens: Arc::new(TokenIssuer::new(&[1u8; 32]).unwrap()),
            replay: Arc::new(ReplayGuard::new()),
        };
        let worker = Worker::new(deps, Arc::new(JobQueue::new(4)), RetryPolicy::default(), timeout);
        (worker, store, storage, file_id)
    }

    #[tokio::test]
    async fn successful_attempt_writes_artifact() {
        let (worker, store, storage, file_id) =
            fixture(Arc::new(EchoConverter), Duration::from_secs(5)).await;
        let (job, _) = store.create_or_get_active(file_id, None, 3).await.unwrap();

        let done = worker.process(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.attempts, 1);
        assert!(done.completed_at.is_some());
        assert_eq!(
            storage.download(&artifact_key(file_id)).await.unwrap(),
            b"%PDF-doc"
        );
        assert_eq!(
            storage.content_type(&artifact_key(file_id)).as_deref(),
            Some(PREVIEW_CONTENT_TYPE)
        );
    }

    #[tokio::test]
    async fn timeout_counts_as_failed_attempt() {
        let (worker, store, _, file_id) =
            fixture(Arc::new(SlowConverter), Duration::from_millis(20)).await;
        let (job, _) = store.create_or_get_active(file_id, None, 3).await.unwrap();

        let before = Utc::now();
        let failed = worker.process(job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert!(failed.last_error.unwrap().contains("timed out"));

        let wait = failed.next_retry_at.unwrap() - before;
        assert!(wait >= chrono::Duration::seconds(30));
        assert!(wait < chrono::Duration::seconds(31));
    }

    #[tokio::test]
    async fn missing_file_fails_the_attempt() {
        let (worker, store, _, _) = fixture(Arc::new(EchoConverter), Duration::from_secs(5)).await;
        let (job, _) = store.create_or_get_active(Uuid::new_v4(), None, 1).await.unwrap();

        let failed = worker.process(job.id).await.unwrap();
        assert!(failed.is_exhausted());
        assert!(failed.next_retry_at.is_none());
        assert!(failed.last_error.unwrap().contains("no longer exists"));
    }

    #[tokio::test]
    async fn non_pending_job_is_skipped() {
        let (worker, store, _, file_id) =
            fixture(Arc::new(EchoConverter), Duration::from_secs(5)).await;
        let (job, _) = store.create_or_get_active(file_id, None, 3).await.unwrap();
        store.claim(job.id, Utc::now()).await.unwrap();

        assert!(worker.process(job.id).await.is_none());
        assert!(worker.process(Uuid::new_v4()).await.is_none());
    }
}
