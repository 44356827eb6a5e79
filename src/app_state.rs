use std::sync::Arc;

use crate::db::store::JobStore;
use crate::services::pipeline::PreviewPipeline;
use crate::services::previews::PreviewService;
use crate::services::queue::JobQueue;
use crate::services::replay::RedisReplayStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub previews: PreviewService,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<JobQueue>,
    /// Present when nonces are tracked in Redis; probed by the health check.
    pub redis: Option<Arc<RedisReplayStore>>,
    /// Hint sent with `Retry-After` when a job was deferred by backpressure.
    pub retry_after_secs: u64,
}

impl AppState {
    pub fn new(
        pipeline: &PreviewPipeline,
        store: Arc<dyn JobStore>,
        redis: Option<Arc<RedisReplayStore>>,
    ) -> Self {
        Self {
            previews: pipeline.service(),
            store,
            queue: pipeline.queue(),
            redis,
            retry_after_secs: pipeline.settings().sweep_interval.as_secs().max(1),
        }
    }
}
