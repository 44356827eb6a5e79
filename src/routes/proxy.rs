use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use garde::Validate;

use crate::app_state::AppState;
use crate::models::preview::PreviewQuery;
use crate::services::previews::AccessDenied;

const UNAUTHORIZED_BODY: &str = r#"{"error":"unauthorized"}"#;

/// The one response for every refused preview request, whatever the reason.
fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        UNAUTHORIZED_BODY,
    )
        .into_response()
}

fn deny(reason: &'static str) -> Response {
    metrics::counter!("preview_proxy_denied_total", "reason" => reason).increment(1);
    unauthorized()
}

/// GET /api/v1/preview?file_id=…&token=…: exchange a preview token for the
/// rendered document.
///
/// Credentials travel in the query string so the URL works as an iframe or
/// img `src` without cookies or headers.
pub async fn serve_preview(
    State(state): State<AppState>,
    query: Result<Query<PreviewQuery>, QueryRejection>,
) -> Response {
    let Ok(Query(query)) = query else {
        return deny("bad_request");
    };
    if query.validate().is_err() {
        return deny("bad_request");
    }

    match state.previews.open_preview(query.file_id, &query.token).await {
        Ok(artifact) => {
            let mut response = artifact.bytes.into_response();
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(artifact.content_type),
            );
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
            headers.insert(header::CONTENT_DISPOSITION, HeaderValue::from_static("inline"));
            headers.insert(
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            );
            tracing::debug!(file_id = %query.file_id, "Preview served");
            response
        }
        Err(denied) => {
            match &denied {
                AccessDenied::ReplayStore(_) | AccessDenied::Artifact(_) => {
                    tracing::warn!(file_id = %query.file_id, reason = %denied, "Preview refused");
                }
                _ => {
                    tracing::debug!(file_id = %query.file_id, reason = %denied, "Preview refused");
                }
            }
            deny(denied.reason())
        }
    }
}
