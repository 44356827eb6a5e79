use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const REDIS_KEY_PREFIX: &str = "preview:nonce:";

/// Records consumed token nonces so each token is accepted at most once.
#[async_trait]
pub trait ReplayStore: Send + Sync {
    /// Atomically check that `nonce` is unseen and mark it consumed.
    /// Returns `false` when the nonce was already consumed.
    async fn check_and_consume(
        &self,
        nonce: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, ReplayError>;

    /// Forget nonces whose tokens have expired. Returns how many were dropped.
    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize, ReplayError> {
        Ok(0)
    }
}

/// Process-local replay guard.
///
/// Does not survive restarts and is not shared between instances; use
/// [`RedisReplayStore`] when the service runs on more than one node.
#[derive(Default)]
pub struct ReplayGuard {
    consumed: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Presence check and insert under one lock acquisition.
    pub fn consume(&self, nonce: &str, expires_at: DateTime<Utc>) -> bool {
        let mut consumed = self.lock();
        if consumed.contains_key(nonce) {
            return false;
        }
        consumed.insert(nonce.to_string(), expires_at);
        true
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut consumed = self.lock();
        let before = consumed.len();
        consumed.retain(|_, expires_at| *expires_at >= now);
        before - consumed.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.consumed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ReplayStore for ReplayGuard {
    async fn check_and_consume(
        &self,
        nonce: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, ReplayError> {
        Ok(self.consume(nonce, expires_at))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, ReplayError> {
        Ok(self.purge_expired_at(now))
    }
}

/// Replay store shared across instances through Redis.
///
/// `SET key 1 NX EXAT <expiry + 1>` is a single atomic command, and Redis
/// expires the key a second after the token, so no cleanup loop is needed.
pub struct RedisReplayStore {
    client: redis::Client,
}

impl RedisReplayStore {
    pub fn new(redis_url: &str) -> Result<Self, ReplayError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), ReplayError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl ReplayStore for RedisReplayStore {
    async fn check_and_consume(
        &self,
        nonce: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, ReplayError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(format!("{}{}", REDIS_KEY_PREFIX, nonce))
            .arg(1)
            .arg("NX")
            .arg("EXAT")
            .arg(expires_at.timestamp().max(0) + 1)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}

/// Periodically purge expired nonces until `cancel` fires.
pub fn spawn_cleanup(
    store: Arc<dyn ReplayStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match store.purge_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "Purged expired token nonces"),
                Err(e) => tracing::warn!(error = %e, "Nonce cleanup failed"),
            }
        }
        tracing::debug!("Replay guard cleanup stopped");
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
