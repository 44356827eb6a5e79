use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Register descriptions for every metric the service emits.
pub fn describe() {
    metrics::describe_counter!(
        "preview_jobs_enqueued_total",
        "Preview jobs created by convert requests"
    );
    metrics::describe_counter!(
        "preview_jobs_completed_total",
        "Preview jobs that produced an artifact"
    );
    metrics::describe_counter!(
        "preview_jobs_failed_total",
        "Failed conversion attempts"
    );
    metrics::describe_counter!(
        "preview_queue_full_total",
        "Jobs deferred to the retry sweep because the queue was full"
    );
    metrics::describe_counter!(
        "preview_tokens_issued_total",
        "Preview access tokens minted"
    );
    metrics::describe_counter!(
        "preview_proxy_denied_total",
        "Preview proxy requests refused, by reason"
    );
    metrics::describe_histogram!(
        "preview_conversion_seconds",
        "Duration of a single conversion attempt"
    );
    metrics::describe_gauge!(
        "preview_queue_depth",
        "Job ids currently waiting in the in-process queue"
    );
}

/// GET /metrics: Prometheus text exposition.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}
