//! In-process job store used by tests and single-node development runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::db::store::{JobStore, StatusCounts, StoreError, LEASE_EXPIRED_ERROR};
use crate::models::job::{JobStatus, PreviewJob};

/// Mutex-guarded map of jobs. Each method runs its whole read-modify-write
/// under one lock acquisition, which gives the same per-row compare-and-set
/// semantics as the conditional updates of the Postgres store.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, PreviewJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a row as-is. Lets tests stage arbitrary states.
    pub fn put(&self, job: PreviewJob) {
        self.lock().insert(job.id, job);
    }

    pub fn all(&self) -> Vec<PreviewJob> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, PreviewJob>> {
        // A panic while holding the lock cannot leave a half-written row.
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a job other than `except` holds the active slot for `file_id`.
    fn slot_taken(jobs: &HashMap<Uuid, PreviewJob>, file_id: Uuid, except: Uuid) -> bool {
        jobs.values()
            .any(|job| job.id != except && job.file_id == file_id && job.status.is_active())
    }

    fn transition<F>(&self, job_id: Uuid, from: JobStatus, apply: F) -> Option<PreviewJob>
    where
        F: FnOnce(&mut PreviewJob),
    {
        let mut jobs = self.lock();
        let job = jobs.get_mut(&job_id)?;
        if job.status != from {
            return None;
        }
        apply(job);
        job.updated_at = Utc::now();
        Some(job.clone())
    }
}

fn oldest_first(mut jobs: Vec<PreviewJob>, limit: i64) -> Vec<PreviewJob> {
    jobs.sort_by_key(|job| job.created_at);
    jobs.truncate(usize::try_from(limit).unwrap_or(0));
    jobs
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_or_get_active(
        &self,
        file_id: Uuid,
        requested_by: Option<&str>,
        max_attempts: i32,
    ) -> Result<(PreviewJob, bool), StoreError> {
        let mut jobs = self.lock();
        if let Some(in_flight) = jobs
            .values()
            .find(|job| job.file_id == file_id && job.is_in_flight())
        {
            return Ok((in_flight.clone(), false));
        }

        let job = PreviewJob::new(file_id, requested_by.map(str::to_string), max_attempts);
        jobs.insert(job.id, job.clone());
        Ok((job, true))
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<PreviewJob>, StoreError> {
        Ok(self.lock().get(&job_id).cloned())
    }

    async fn latest_for_file(&self, file_id: Uuid) -> Result<Option<PreviewJob>, StoreError> {
        Ok(self
            .lock()
            .values()
            .filter(|job| job.file_id == file_id)
            .max_by_key(|job| job.created_at)
            .cloned())
    }

    async fn claim(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<PreviewJob>, StoreError> {
        Ok(self.transition(job_id, JobStatus::Pending, |job| {
            job.status = JobStatus::Processing;
            job.attempts += 1;
            job.started_at = Some(now);
            job.next_retry_at = None;
        }))
    }

    async fn complete(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<PreviewJob>, StoreError> {
        Ok(self.transition(job_id, JobStatus::Processing, |job| {
            job.status = JobStatus::Completed;
            job.completed_at = Some(now);
            job.last_error = None;
            job.next_retry_at = None;
        }))
    }

    async fn record_failure(
        &self,
        job_id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<Option<PreviewJob>, StoreError> {
        Ok(self.transition(job_id, JobStatus::Processing, |job| {
            job.status = JobStatus::Failed;
            job.last_error = Some(error.to_string());
            job.next_retry_at = next_retry_at;
        }))
    }

    async fn reset_for_retry(&self, job_id: Uuid) -> Result<Option<PreviewJob>, StoreError> {
        let mut jobs = self.lock();
        let Some(file_id) = jobs.get(&job_id).map(|job| job.file_id) else {
            return Ok(None);
        };
        if Self::slot_taken(&jobs, file_id, job_id) {
            return Ok(None);
        }
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Failed {
            return Ok(None);
        }
        job.status = JobStatus::Pending;
        job.attempts = 0;
        job.last_error = None;
        job.next_retry_at = None;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn requeue_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PreviewJob>, StoreError> {
        let mut jobs = self.lock();
        let due: Vec<PreviewJob> = jobs
            .values()
            .filter(|job| job.is_due_for_retry(now))
            .cloned()
            .collect();

        let mut requeued = Vec::new();
        for candidate in oldest_first(due, limit) {
            if Self::slot_taken(&jobs, candidate.file_id, candidate.id) {
                continue;
            }
            if let Some(job) = jobs.get_mut(&candidate.id) {
                job.status = JobStatus::Pending;
                job.next_retry_at = None;
                job.updated_at = now;
                requeued.push(job.clone());
            }
        }
        Ok(requeued)
    }

    async fn pending(&self, limit: i64) -> Result<Vec<PreviewJob>, StoreError> {
        let pending = self
            .lock()
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .cloned()
            .collect();
        Ok(oldest_first(pending, limit))
    }

    async fn reap_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<PreviewJob>, StoreError> {
        let mut reaped = Vec::new();
        for job in self.lock().values_mut() {
            let stale = job.status == JobStatus::Processing
                && job.started_at.is_some_and(|started| started < cutoff);
            if !stale {
                continue;
            }
            job.status = JobStatus::Failed;
            job.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
            job.next_retry_at = (job.attempts < job.max_attempts).then_some(now);
            job.updated_at = now;
            reaped.push(job.clone());
        }
        Ok(reaped)
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let mut counts = StatusCounts::default();
        for job in self.lock().values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
