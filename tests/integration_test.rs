use chrono::{Duration, Utc};
use preview_service::{
    db::{self, queries::PgJobStore, store::JobStore},
    models::job::JobStatus,
};
use uuid::Uuid;

async fn store() -> PgJobStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = db::init_pool(&url).await.expect("Failed to connect to database");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    PgJobStore::new(pool)
}

/// Integration test: job lifecycle against PostgreSQL
///
/// Covers single-flight creation, claim, failure with backoff, requeue,
/// completion and manual retry on the `preview_jobs` table.
///
/// Note: This requires a running PostgreSQL instance configured via
/// DATABASE_URL.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_job_lifecycle() {
    let store = store().await;
    store.ping().await.expect("Database ping failed");
    let file_id = Uuid::new_v4();

    // 1. Single-flight creation
    let (job, created) = store
        .create_or_get_active(file_id, Some("test-user"), 2)
        .await
        .expect("Failed to create job");
    assert!(created);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.requested_by.as_deref(), Some("test-user"));

    let (same, created) = store
        .create_or_get_active(file_id, None, 2)
        .await
        .expect("Failed to fetch active job");
    assert!(!created);
    assert_eq!(same.id, job.id);

    // 2. Claim is exclusive
    let now = Utc::now();
    let claimed = store
        .claim(job.id, now)
        .await
        .expect("Failed to claim")
        .expect("Pending job not claimed");
    assert_eq!(claimed.status, JobStatus::Processing);
    assert_eq!(claimed.attempts, 1);
    assert!(store.claim(job.id, now).await.unwrap().is_none());

    // 3. Failure with a due retry, then requeue
    let failed = store
        .record_failure(job.id, "conversion failed", Some(now - Duration::seconds(1)))
        .await
        .expect("Failed to record failure")
        .expect("Processing job not failed");
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("conversion failed"));

    let requeued = store
        .requeue_due(Utc::now(), 100)
        .await
        .expect("Failed to requeue");
    assert!(requeued.iter().any(|j| j.id == job.id));

    // 4. Second attempt completes and clears the error
    store.claim(job.id, Utc::now()).await.unwrap().unwrap();
    let done = store
        .complete(job.id, Utc::now())
        .await
        .expect("Failed to complete")
        .expect("Processing job not completed");
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 2);
    assert!(done.last_error.is_none());

    // 5. A finished job frees the slot for a new one
    let (next, created) = store
        .create_or_get_active(file_id, None, 2)
        .await
        .expect("Failed to create second job");
    assert!(created);
    assert_ne!(next.id, job.id);
    assert_eq!(
        store.latest_for_file(file_id).await.unwrap().unwrap().id,
        next.id
    );

    println!("✅ Job lifecycle passed");
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_concurrent_create_is_single_flight() {
    let store = store().await;
    let file_id = Uuid::new_v4();

    let results = futures::future::join_all(
        (0..8).map(|_| store.create_or_get_active(file_id, None, 3)),
    )
    .await;

    let jobs: Vec<_> = results
        .into_iter()
        .map(|r| r.expect("create_or_get_active failed"))
        .collect();
    assert_eq!(jobs.iter().filter(|(_, created)| *created).count(), 1);
    assert!(jobs.windows(2).all(|w| w[0].0.id == w[1].0.id));
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_stale_processing_is_reaped() {
    let store = store().await;
    let file_id = Uuid::new_v4();
    let (job, _) = store.create_or_get_active(file_id, None, 3).await.unwrap();

    let long_ago = Utc::now() - Duration::hours(3);
    store.claim(job.id, long_ago).await.unwrap().unwrap();

    let reaped = store
        .reap_stale(Utc::now() - Duration::hours(1), Utc::now())
        .await
        .expect("Failed to reap");
    let mine = reaped
        .iter()
        .find(|j| j.id == job.id)
        .expect("Stale job not reaped");
    assert_eq!(mine.status, JobStatus::Failed);
    assert!(mine.next_retry_at.is_some());

    let counts = store.count_by_status().await.expect("Failed to count");
    assert!(counts.failed >= 1);
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_one_active_job_per_file_across_backoff() {
    let store = store().await;
    let file_id = Uuid::new_v4();
    let now = Utc::now();

    let (first, _) = store.create_or_get_active(file_id, None, 3).await.unwrap();
    store.claim(first.id, now).await.unwrap().unwrap();
    store
        .record_failure(first.id, "502", Some(now - Duration::seconds(1)))
        .await
        .unwrap()
        .unwrap();

    // Convert during backoff returns the scheduled job instead of a new row.
    let (again, created) = store.create_or_get_active(file_id, None, 3).await.unwrap();
    assert!(!created);
    assert_eq!(again.id, first.id);

    let requeued = store.requeue_due(Utc::now(), 100).await.expect("Failed to requeue");
    assert!(requeued.iter().any(|j| j.id == first.id));
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_requeue_skips_file_with_active_job() {
    let store = store().await;
    let file_id = Uuid::new_v4();
    let now = Utc::now();

    // An exhausted row revived by hand while a fresh job holds the slot.
    let (old, _) = store.create_or_get_active(file_id, None, 1).await.unwrap();
    store.claim(old.id, now).await.unwrap().unwrap();
    store.record_failure(old.id, "boom", None).await.unwrap().unwrap();
    let (fresh, created) = store.create_or_get_active(file_id, None, 1).await.unwrap();
    assert!(created);

    assert!(store.reset_for_retry(old.id).await.unwrap().is_none());

    // A due retry for the same file waits while the fresh job is active.
    let (other_file, _) = store.create_or_get_active(Uuid::new_v4(), None, 3).await.unwrap();
    store.claim(other_file.id, now).await.unwrap().unwrap();
    store
        .record_failure(other_file.id, "502", Some(now - Duration::seconds(1)))
        .await
        .unwrap()
        .unwrap();
    let requeued = store
        .requeue_due(Utc::now(), 1000)
        .await
        .expect("requeue must not fail on an occupied file");
    assert!(requeued.iter().all(|j| j.file_id != file_id));
    assert!(requeued.iter().any(|j| j.id == other_file.id));
    assert_eq!(
        store.get(fresh.id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );
}
