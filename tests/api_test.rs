//! HTTP surface tests driven through the router with `oneshot`.

mod helpers;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use helpers::*;
use preview_service::config::PipelineSettings;
use preview_service::db::store::JobStore;
use preview_service::models::job::JobStatus;
use preview_service::models::preview::{JobResponse, TokenResponse};
use preview_service::routes;

async fn send(app: &Router, method: Method, uri: &str) -> Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("x-user-id", "user-7")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), 16 * 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

async fn json<T: serde::de::DeserializeOwned>(response: Response) -> T {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn preview_path(file_id: Uuid) -> String {
    format!("/api/v1/files/{}/preview", file_id)
}

async fn completed(harness: &Harness, app: &Router, name: &str) -> Uuid {
    let file_id = harness.add_file(name).await;
    let response = send(app, Method::POST, &preview_path(file_id)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let store = harness.store.clone();
    wait_until(Duration::from_secs(5), || {
        let store = store.clone();
        async move {
            store
                .latest_for_file(file_id)
                .await
                .unwrap()
                .filter(|job| job.status == JobStatus::Completed)
        }
    })
    .await;
    file_id
}

#[tokio::test]
async fn convert_then_status_round_trip() {
    let harness = Harness::new(fast_settings(), FlakyConverter::default());
    let app = routes::router(harness.state());
    let file_id = harness.add_file("q3.docx").await;

    let missing = send(&app, Method::GET, &preview_path(file_id)).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let created = send(&app, Method::POST, &preview_path(file_id)).await;
    assert_eq!(created.status(), StatusCode::ACCEPTED);
    let created: JobResponse = json(created).await;
    assert_eq!(created.file_id, file_id);
    assert_eq!(created.status, JobStatus::Pending);
    assert_eq!(created.attempts, 0);
    assert!(!created.queue_full);

    let again = send(&app, Method::POST, &preview_path(file_id)).await;
    assert_eq!(again.status(), StatusCode::OK);
    let again: JobResponse = json(again).await;
    assert_eq!(again.job_id, created.job_id);

    let status = send(&app, Method::GET, &preview_path(file_id)).await;
    assert_eq!(status.status(), StatusCode::OK);
    let status: JobResponse = json(status).await;
    assert_eq!(status.job_id, created.job_id);

    let job = harness.store.get(created.job_id).await.unwrap().unwrap();
    assert_eq!(job.requested_by.as_deref(), Some("user-7"));
}

#[tokio::test]
async fn convert_unknown_file_is_not_found() {
    let harness = Harness::new(fast_settings(), FlakyConverter::default());
    let app = routes::router(harness.state());

    let response = send(&app, Method::POST, &preview_path(Uuid::new_v4())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn full_queue_is_reported_with_retry_after() {
    let settings = PipelineSettings {
        queue_capacity: 1,
        sweep_interval: Duration::from_secs(15),
        ..fast_settings()
    };
    let harness = Harness::new(settings, FlakyConverter::default());
    let app = routes::router(harness.state());

    let first = harness.add_file("one.docx").await;
    let second = harness.add_file("two.docx").await;
    send(&app, Method::POST, &preview_path(first)).await;

    let response = send(&app, Method::POST, &preview_path(second)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()[header::RETRY_AFTER], "15");
    let body: JobResponse = json(response).await;
    assert!(body.queue_full);
    assert_eq!(body.status, JobStatus::Pending);
}

#[tokio::test]
async fn retry_and_token_conflict_on_wrong_state() {
    let harness = Harness::new(fast_settings(), FlakyConverter::default());
    let app = routes::router(harness.state());
    let file_id = harness.add_file("x.docx").await;

    let no_job = send(&app, Method::POST, &format!("{}/retry", preview_path(file_id))).await;
    assert_eq!(no_job.status(), StatusCode::NOT_FOUND);

    send(&app, Method::POST, &preview_path(file_id)).await;

    let retry = send(&app, Method::POST, &format!("{}/retry", preview_path(file_id))).await;
    assert_eq!(retry.status(), StatusCode::CONFLICT);

    let token = send(&app, Method::POST, &format!("{}/token", preview_path(file_id))).await;
    assert_eq!(token.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn manual_retry_of_exhausted_job_is_accepted() {
    let settings = PipelineSettings {
        max_attempts: 1,
        ..fast_settings()
    };
    let harness = Harness::new(settings, FlakyConverter::failing(1));
    harness.pipeline.start();
    let app = routes::router(harness.state());
    let file_id = harness.add_file("broken.docx").await;
    send(&app, Method::POST, &preview_path(file_id)).await;

    let store = harness.store.clone();
    wait_until(Duration::from_secs(5), || {
        let store = store.clone();
        async move {
            store
                .latest_for_file(file_id)
                .await
                .unwrap()
                .filter(|job| job.status == JobStatus::Failed)
        }
    })
    .await;

    let response = send(&app, Method::POST, &format!("{}/retry", preview_path(file_id))).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: JobResponse = json(response).await;
    assert_eq!(body.status, JobStatus::Pending);
    assert_eq!(body.attempts, 0);

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn token_link_serves_pdf_exactly_once() {
    let harness = Harness::new(fast_settings(), FlakyConverter::default());
    harness.pipeline.start();
    let app = routes::router(harness.state());
    let file_id = completed(&harness, &app, "final.docx").await;

    let response = send(&app, Method::POST, &format!("{}/token", preview_path(file_id))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let minted: TokenResponse = json(response).await;
    assert!(minted.url.starts_with("/api/v1/preview?file_id="));
    assert!(minted.url.contains(&minted.token));

    let served = send(&app, Method::GET, &minted.url).await;
    assert_eq!(served.status(), StatusCode::OK);
    assert_eq!(served.headers()[header::CONTENT_TYPE], "application/pdf");
    assert_eq!(served.headers()[header::CACHE_CONTROL], "no-store");
    assert!(body_bytes(served).await.starts_with(b"%PDF-"));

    let replayed = send(&app, Method::GET, &minted.url).await;
    assert_eq!(replayed.status(), StatusCode::UNAUTHORIZED);

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn every_proxy_refusal_looks_the_same() {
    let harness = Harness::new(fast_settings(), FlakyConverter::default());
    harness.pipeline.start();
    let app = routes::router(harness.state());
    let file_a = completed(&harness, &app, "a.docx").await;
    let file_b = completed(&harness, &app, "b.docx").await;

    let minted = harness.pipeline.service().issue_token(file_a).await.unwrap();
    let expired = harness
        .tokens
        .mint_at(file_a, chrono::Utc::now() - chrono::Duration::hours(2))
        .unwrap();

    let refusals = [
        format!("/api/v1/preview?file_id={}&token={}", file_b, minted.token),
        format!("/api/v1/preview?file_id={}&token={}", file_a, expired.token),
        format!("/api/v1/preview?file_id={}&token=garbage", file_a),
        format!("/api/v1/preview?file_id={}&token=", file_a),
        format!("/api/v1/preview?file_id=not-a-uuid&token={}", minted.token),
        "/api/v1/preview".to_string(),
    ];

    let mut bodies = Vec::new();
    for uri in &refusals {
        let response = send(&app, Method::GET, uri).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        bodies.push(body_bytes(response).await);
    }
    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));

    // The mismatched attempt did not burn the token.
    let ok = send(
        &app,
        Method::GET,
        &format!("/api/v1/preview?file_id={}&token={}", file_a, minted.token),
    )
    .await;
    assert_eq!(ok.status(), StatusCode::OK);

    harness.pipeline.shutdown().await;
}

#[tokio::test]
async fn health_reports_queue_and_job_counts() {
    let harness = Harness::new(fast_settings(), FlakyConverter::default());
    let app = routes::router(harness.state());
    let file_id = harness.add_file("h.docx").await;
    send(&app, Method::POST, &preview_path(file_id)).await;

    let response = send(&app, Method::GET, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["database"]["status"], "ok");
    assert!(body["checks"].get("redis").is_none());
    assert_eq!(body["queue"]["depth"], 1);
    assert_eq!(body["queue"]["capacity"], 16);
    assert_eq!(body["jobs"]["pending"], 1);
}
