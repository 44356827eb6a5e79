//! Shared in-memory harness for pipeline and API tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use preview_service::app_state::AppState;
use preview_service::config::PipelineSettings;
use preview_service::db::memory::MemoryJobStore;
use preview_service::models::file::FileRecord;
use preview_service::services::converter::{ConversionError, Converter};
use preview_service::services::files::MemoryFileCatalog;
use preview_service::services::pipeline::{Dependencies, PreviewPipeline};
use preview_service::services::replay::ReplayGuard;
use preview_service::services::retry::RetryPolicy;
use preview_service::services::storage::{MemoryStorage, ObjectStorage};
use preview_service::services::token::TokenIssuer;

pub const TOKEN_SECRET: [u8; 32] = [42u8; 32];

/// Converter that fails a fixed number of times, then renders a stub PDF.
#[derive(Default)]
pub struct FlakyConverter {
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyConverter {
    pub fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Converter for FlakyConverter {
    async fn convert(&self, _filename: &str, source: Vec<u8>) -> Result<Vec<u8>, ConversionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ConversionError::Status {
                status: 502,
                body: "libreoffice crashed".to_string(),
            });
        }
        Ok([b"%PDF-1.7\n".as_slice(), source.as_slice()].concat())
    }
}

/// Settings tuned for tests: no backoff wait and a fast sweep.
pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        queue_capacity: 16,
        worker_count: 2,
        max_attempts: 3,
        retry: RetryPolicy::new(vec![Duration::ZERO]),
        conversion_timeout: Duration::from_secs(5),
        sweep_interval: Duration::from_millis(20),
        replay_cleanup_interval: Duration::from_secs(60),
        stale_after: Duration::from_secs(60),
    }
}

pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub files: Arc<MemoryFileCatalog>,
    pub storage: Arc<MemoryStorage>,
    pub converter: Arc<FlakyConverter>,
    pub tokens: Arc<TokenIssuer>,
    pub replay: Arc<ReplayGuard>,
    pub pipeline: PreviewPipeline,
}

impl Harness {
    pub fn new(settings: PipelineSettings, converter: FlakyConverter) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let files = Arc::new(MemoryFileCatalog::new());
        let storage = Arc::new(MemoryStorage::new());
        let converter = Arc::new(converter);
        let tokens = Arc::new(TokenIssuer::new(&TOKEN_SECRET).unwrap());
        let replay = Arc::new(ReplayGuard::new());

        let deps = Dependencies {
            store: store.clone(),
            files: files.clone(),
            storage: storage.clone(),
            converter: converter.clone(),
            tokens: tokens.clone(),
            replay: replay.clone(),
        };

        Self {
            pipeline: PreviewPipeline::new(deps, settings),
            store,
            files,
            storage,
            converter,
            tokens,
            replay,
        }
    }

    pub fn state(&self) -> AppState {
        AppState::new(&self.pipeline, self.store.clone(), None)
    }

    /// Register a file and upload its source document.
    pub async fn add_file(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        let storage_key = format!("uploads/{}", id);
        self.storage
            .upload(&storage_key, name.as_bytes(), "application/octet-stream")
            .await
            .unwrap();
        self.files.insert(FileRecord {
            id,
            name: name.to_string(),
            storage_key,
            mime_type: None,
        });
        id
    }
}

/// Poll `check` every 10ms until it returns `Some`, panicking after `timeout`.
pub async fn wait_until<T, F, Fut>(timeout: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            timeout
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
