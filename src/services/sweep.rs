use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::store::{JobStore, StoreError};
use crate::services::queue::{Admission, JobQueue, QueueError};

/// Rows examined per pass and per category.
const SWEEP_BATCH: i64 = 500;

/// What one sweep pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Processing jobs whose lease ran out.
    pub reaped: usize,
    /// Failed jobs moved back to pending after their backoff.
    pub requeued: usize,
    /// Pending jobs newly placed on the queue.
    pub admitted: usize,
    /// Pending jobs left for a later pass because the queue was full.
    pub deferred: usize,
}

/// Periodic recovery loop: reaps abandoned processing jobs, revives failed
/// jobs whose backoff elapsed, and admits durable pending jobs the queue does
/// not hold.
pub struct RetrySweep {
    store: Arc<dyn JobStore>,
    queue: Arc<JobQueue>,
    stale_after: Duration,
}

impl RetrySweep {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<JobQueue>, stale_after: Duration) -> Self {
        Self {
            store,
            queue,
            stale_after,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        let lease = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let reaped = self.store.reap_stale(now - lease, now).await?;
        for job in &reaped {
            tracing::warn!(
                job_id = %job.id,
                file_id = %job.file_id,
                attempts = job.attempts,
                "Processing lease expired, job marked failed"
            );
        }
        report.reaped = reaped.len();

        // A failed requeue must not hold back admission of pending jobs.
        match self.store.requeue_due(now, SWEEP_BATCH).await {
            Ok(requeued) => report.requeued = requeued.len(),
            Err(e) => tracing::error!(error = %e, "Failed to requeue due jobs"),
        }

        for job in self.store.pending(SWEEP_BATCH).await? {
            match self.queue.try_admit(job.id) {
                Ok(Admission::Admitted) => report.admitted += 1,
                Ok(Admission::AlreadyQueued) => {}
                Err(QueueError::Full) => {
                    report.deferred += 1;
                    break;
                }
                Err(QueueError::Closed) => break,
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                reaped = report.reaped,
                requeued = report.requeued,
                admitted = report.admitted,
                deferred = report.deferred,
                "Retry sweep pass"
            );
        }
        Ok(report)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.run_once().await {
                    tracing::error!(error = %e, "Retry sweep failed");
                }
            }
            tracing::debug!("Retry sweep stopped");
        })
    }
}
