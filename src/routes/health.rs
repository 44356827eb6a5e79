use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::time::Instant;

use crate::app_state::AppState;
use crate::db::store::StatusCounts;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
    pub queue: QueueHealth,
    /// Job counts per status; absent when the store is unreachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<StatusCounts>,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    /// Only reported when replay state lives in Redis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<ComponentHealth>,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct QueueHealth {
    pub depth: usize,
    pub capacity: usize,
}

impl ComponentHealth {
    fn from_probe<E>(started: Instant, result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self {
                status: "ok".to_string(),
                latency_ms: Some(started.elapsed().as_millis() as u64),
            },
            Err(_) => Self {
                status: "error".to_string(),
                latency_ms: None,
            },
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// GET /health: dependency status plus queue and job statistics.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = Instant::now();
    let db_check = ComponentHealth::from_probe(start, state.store.ping().await);

    let redis_check = match &state.redis {
        Some(redis) => {
            let redis_start = Instant::now();
            Some(ComponentHealth::from_probe(
                redis_start,
                redis.health_check().await,
            ))
        }
        None => None,
    };

    let jobs = if db_check.is_ok() {
        match state.store.count_by_status().await {
            Ok(counts) => Some(counts),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to count preview jobs");
                None
            }
        }
    } else {
        None
    };

    let all_healthy = db_check.is_ok() && redis_check.as_ref().map_or(true, ComponentHealth::is_ok);
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database: db_check,
            redis: redis_check,
        },
        queue: QueueHealth {
            depth: state.queue.depth(),
            capacity: state.queue.capacity(),
        },
        jobs,
    };

    (status_code, Json(response))
}
