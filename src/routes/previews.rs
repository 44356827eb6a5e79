use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::preview::{JobResponse, TokenResponse};
use crate::services::previews::{EnqueueOutcome, PreviewError};

/// Header carrying the authenticated user, set by the upstream auth layer.
pub const REQUESTER_HEADER: &str = "x-user-id";

const MAX_REQUESTER_LEN: usize = 256;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for PreviewError {
    fn into_response(self) -> Response {
        let status = match &self {
            PreviewError::FileNotFound(_) | PreviewError::NoJob(_) => StatusCode::NOT_FOUND,
            PreviewError::NotRetryable(_) | PreviewError::NotReady(_) => StatusCode::CONFLICT,
            PreviewError::Store(_) | PreviewError::Catalog(_) | PreviewError::Token(_) => {
                tracing::error!(error = %self, "Preview request failed");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody {
                        error: "internal error".to_string(),
                    }),
                )
                    .into_response();
            }
        };

        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

fn requester(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUESTER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= MAX_REQUESTER_LEN)
        .map(str::to_string)
}

fn outcome_response(state: &AppState, status: StatusCode, outcome: EnqueueOutcome) -> Response {
    let mut body = JobResponse::from(outcome.job);
    body.queue_full = outcome.queue_full;

    if outcome.queue_full {
        let retry_after = state.retry_after_secs.to_string();
        (status, [(header::RETRY_AFTER, retry_after)], Json(body)).into_response()
    } else {
        (status, Json(body)).into_response()
    }
}

/// POST /api/v1/files/{file_id}/preview: request a preview rendering.
pub async fn request_conversion(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, PreviewError> {
    let requested_by = requester(&headers);
    let outcome = state
        .previews
        .enqueue(file_id, requested_by.as_deref())
        .await?;

    let status = if outcome.created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok(outcome_response(&state, status, outcome))
}

/// GET /api/v1/files/{file_id}/preview: latest job state.
pub async fn get_preview_status(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
) -> Result<Json<JobResponse>, PreviewError> {
    let job = state
        .previews
        .status(file_id)
        .await?
        .ok_or(PreviewError::NoJob(file_id))?;
    Ok(Json(job.into()))
}

/// POST /api/v1/files/{file_id}/preview/retry: manual retry of a failed job.
pub async fn retry_preview(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
) -> Result<Response, PreviewError> {
    let outcome = state.previews.retry(file_id).await?;
    Ok(outcome_response(&state, StatusCode::ACCEPTED, outcome))
}

/// POST /api/v1/files/{file_id}/preview/token: mint a single-use preview link.
pub async fn issue_preview_token(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
) -> Result<Json<TokenResponse>, PreviewError> {
    let minted = state.previews.issue_token(file_id).await?;
    let url = format!("/api/v1/preview?file_id={}&token={}", file_id, minted.token);

    Ok(Json(TokenResponse {
        expires_at: minted.claims.expires_at(),
        token: minted.token,
        url,
    }))
}
