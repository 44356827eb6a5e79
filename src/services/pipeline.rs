use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineSettings;
use crate::db::store::JobStore;
use crate::services::converter::Converter;
use crate::services::files::FileCatalog;
use crate::services::previews::PreviewService;
use crate::services::queue::JobQueue;
use crate::services::replay::{self, ReplayStore};
use crate::services::storage::ObjectStorage;
use crate::services::sweep::RetrySweep;
use crate::services::token::TokenIssuer;
use crate::services::worker::Worker;

/// External collaborators and owned security components of the pipeline.
#[derive(Clone)]
pub struct Dependencies {
    pub store: Arc<dyn JobStore>,
    pub files: Arc<dyn FileCatalog>,
    pub storage: Arc<dyn ObjectStorage>,
    pub converter: Arc<dyn Converter>,
    pub tokens: Arc<TokenIssuer>,
    pub replay: Arc<dyn ReplayStore>,
}

/// Owns the job queue and the background loops (workers, retry sweep,
/// replay-guard cleanup).
///
/// Constructing a pipeline spawns nothing; [`start`](Self::start) launches the
/// loops and [`shutdown`](Self::shutdown) cancels and joins them. Jobs still
/// processing at shutdown are recovered by the processing lease.
pub struct PreviewPipeline {
    deps: Dependencies,
    queue: Arc<JobQueue>,
    settings: PipelineSettings,
    running: Mutex<Option<Running>>,
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PreviewPipeline {
    pub fn new(deps: Dependencies, settings: PipelineSettings) -> Self {
        Self {
            queue: Arc::new(JobQueue::new(settings.queue_capacity)),
            deps,
            settings,
            running: Mutex::new(None),
        }
    }

    /// Handle for request handlers; shares this pipeline's queue.
    pub fn service(&self) -> PreviewService {
        PreviewService::new(
            self.deps.clone(),
            Arc::clone(&self.queue),
            self.settings.max_attempts,
        )
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn queue(&self) -> Arc<JobQueue> {
        Arc::clone(&self.queue)
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Spawn the background loops. Calling it again while running is a no-op;
    /// a stopped pipeline can be started again.
    pub fn start(&self) {
        let mut running = self.lock_running();
        if running.is_some() {
            tracing::warn!("Preview pipeline already running");
            return;
        }
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let worker = Arc::new(Worker::new(
            self.deps.clone(),
            Arc::clone(&self.queue),
            self.settings.retry.clone(),
            self.settings.conversion_timeout,
        ));
        tasks.extend(worker.spawn_pool(self.settings.worker_count, cancel.clone()));

        let sweep = Arc::new(RetrySweep::new(
            Arc::clone(&self.deps.store),
            Arc::clone(&self.queue),
            self.settings.stale_after,
        ));
        tasks.push(sweep.spawn(self.settings.sweep_interval, cancel.clone()));

        tasks.push(replay::spawn_cleanup(
            Arc::clone(&self.deps.replay),
            self.settings.replay_cleanup_interval,
            cancel.clone(),
        ));

        tracing::info!(
            workers = self.settings.worker_count,
            queue_capacity = self.settings.queue_capacity,
            max_attempts = self.settings.max_attempts,
            "Preview pipeline started"
        );
        *running = Some(Running { cancel, tasks });
    }

    /// Stop all loops. In-flight conversions are abandoned, not awaited to
    /// completion; their rows stay `processing` until the lease reaps them.
    pub async fn shutdown(&self) {
        let running = self.lock_running().take();
        let Some(Running { cancel, tasks }) = running else {
            return;
        };
        cancel.cancel();
        for task in tasks {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "Pipeline task panicked");
                }
            }
        }
        tracing::info!("Preview pipeline stopped");
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
