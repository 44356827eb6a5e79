use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Outcome of a successful [`JobQueue::try_admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// The job is already buffered; nothing was added.
    AlreadyQueued,
}

/// Bounded in-process buffer of job ids between the API and the workers.
///
/// Admission never blocks: a full buffer is reported as [`QueueError::Full`]
/// and the job stays durable in the store until the retry sweep admits it.
/// Each buffered id is delivered to exactly one receiver.
pub struct JobQueue {
    sender: mpsc::Sender<Uuid>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Uuid>>,
    admitted: Mutex<HashSet<Uuid>>,
    capacity: usize,
}

impl JobQueue {
    /// # Panics
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be > 0");
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            admitted: Mutex::new(HashSet::new()),
            capacity,
        }
    }

    pub fn try_admit(&self, job_id: Uuid) -> Result<Admission, QueueError> {
        let mut admitted = self.lock_admitted();
        if admitted.contains(&job_id) {
            return Ok(Admission::AlreadyQueued);
        }

        match self.sender.try_send(job_id) {
            Ok(()) => {
                admitted.insert(job_id);
                metrics::gauge!("preview_queue_depth").set(self.depth() as f64);
                Ok(Admission::Admitted)
            }
            Err(TrySendError::Full(_)) => Err(QueueError::Full),
            Err(TrySendError::Closed(_)) => Err(QueueError::Closed),
        }
    }

    /// Wait for the next job id. Concurrent callers each receive distinct ids.
    pub async fn dequeue(&self) -> Option<Uuid> {
        let job_id = self.receiver.lock().await.recv().await?;
        self.lock_admitted().remove(&job_id);
        metrics::gauge!("preview_queue_depth").set(self.depth() as f64);
        Some(job_id)
    }

    /// Number of buffered ids.
    pub fn depth(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_queued(&self, job_id: Uuid) -> bool {
        self.lock_admitted().contains(&job_id)
    }

    fn lock_admitted(&self) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
        self.admitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Job queue is at capacity")]
    Full,

    #[error("Job queue is closed")]
    Closed,
}
