use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::db::store::{JobStore, StatusCounts, StoreError, LEASE_EXPIRED_ERROR};
use crate::models::file::FileRecord;
use crate::models::job::{JobStatus, PreviewJob};
use crate::services::files::{CatalogError, FileCatalog};

const JOB_COLUMNS: &str = "id, file_id, status, attempts, max_attempts, last_error, next_retry_at, \
     started_at, completed_at, requested_by, created_at, updated_at";

fn job_from_row(row: &PgRow) -> Result<PreviewJob, StoreError> {
    let status_str: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status_str)
        .map_err(|_| StoreError::Corrupt(format!("unknown job status '{}'", status_str)))?;

    Ok(PreviewJob {
        id: row.try_get("id")?,
        file_id: row.try_get("file_id")?,
        status,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        last_error: row.try_get("last_error")?,
        next_retry_at: row.try_get("next_retry_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        requested_by: row.try_get("requested_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn jobs_from_rows(rows: Vec<PgRow>) -> Result<Vec<PreviewJob>, StoreError> {
    rows.iter().map(job_from_row).collect()
}

/// Postgres-backed job store over the `preview_jobs` table.
///
/// Single-flight per file is enforced by the partial unique index
/// `preview_jobs_active_file`; every transition is a conditional `UPDATE`.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Active job for the file, or a failed one waiting on its backoff.
    async fn find_in_flight(&self, file_id: Uuid) -> Result<Option<PreviewJob>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM preview_jobs \
             WHERE file_id = $1 \
               AND (status IN ('pending', 'processing') \
                    OR (status = 'failed' AND attempts < max_attempts \
                        AND next_retry_at IS NOT NULL)) \
             ORDER BY created_at DESC LIMIT 1"
        );
        self.fetch_job(sqlx::query(&sql).bind(file_id)).await
    }

    async fn fetch_job(
        &self,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Option<PreviewJob>, StoreError> {
        let row = query.fetch_optional(&self.pool).await?;
        row.as_ref().map(job_from_row).transpose()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_or_get_active(
        &self,
        file_id: Uuid,
        requested_by: Option<&str>,
        max_attempts: i32,
    ) -> Result<(PreviewJob, bool), StoreError> {
        let insert = format!(
            r#"
            INSERT INTO preview_jobs (id, file_id, status, attempts, max_attempts, requested_by)
            VALUES ($1, $2, 'pending', 0, $3, $4)
            ON CONFLICT (file_id) WHERE status IN ('pending', 'processing') DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        );

        if let Some(in_flight) = self.find_in_flight(file_id).await? {
            return Ok((in_flight, false));
        }

        // The active row can finish between a lost insert and the follow-up
        // read, in which case the slot is free again and the insert is retried.
        for _ in 0..3 {
            let inserted = sqlx::query(&insert)
                .bind(Uuid::new_v4())
                .bind(file_id)
                .bind(max_attempts)
                .bind(requested_by)
                .fetch_optional(&self.pool)
                .await?;

            if let Some(row) = inserted {
                return Ok((job_from_row(&row)?, true));
            }
            if let Some(active) = self.find_in_flight(file_id).await? {
                return Ok((active, false));
            }
        }

        Err(StoreError::Corrupt(format!(
            "could not settle active job for file {}",
            file_id
        )))
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<PreviewJob>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM preview_jobs WHERE id = $1");
        self.fetch_job(sqlx::query(&sql).bind(job_id)).await
    }

    async fn latest_for_file(&self, file_id: Uuid) -> Result<Option<PreviewJob>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM preview_jobs WHERE file_id = $1 \
             ORDER BY created_at DESC LIMIT 1"
        );
        self.fetch_job(sqlx::query(&sql).bind(file_id)).await
    }

    async fn claim(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<PreviewJob>, StoreError> {
        let sql = format!(
            r#"
            UPDATE preview_jobs
            SET status = 'processing',
                attempts = attempts + 1,
                started_at = $2,
                next_retry_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.fetch_job(sqlx::query(&sql).bind(job_id).bind(now)).await
    }

    async fn complete(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<PreviewJob>, StoreError> {
        let sql = format!(
            r#"
            UPDATE preview_jobs
            SET status = 'completed',
                completed_at = $2,
                last_error = NULL,
                next_retry_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.fetch_job(sqlx::query(&sql).bind(job_id).bind(now)).await
    }

    async fn record_failure(
        &self,
        job_id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<Option<PreviewJob>, StoreError> {
        let sql = format!(
            r#"
            UPDATE preview_jobs
            SET status = 'failed',
                last_error = $2,
                next_retry_at = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.fetch_job(
            sqlx::query(&sql)
                .bind(job_id)
                .bind(error)
                .bind(next_retry_at),
        )
        .await
    }

    async fn reset_for_retry(&self, job_id: Uuid) -> Result<Option<PreviewJob>, StoreError> {
        let sql = format!(
            r#"
            UPDATE preview_jobs
            SET status = 'pending',
                attempts = 0,
                last_error = NULL,
                next_retry_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
              AND NOT EXISTS (
                  SELECT 1 FROM preview_jobs active
                  WHERE active.file_id = preview_jobs.file_id
                    AND active.status IN ('pending', 'processing')
              )
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.fetch_job(sqlx::query(&sql).bind(job_id)).await
    }

    async fn requeue_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PreviewJob>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE preview_jobs
            SET status = 'pending',
                next_retry_at = NULL,
                updated_at = NOW()
            WHERE id IN (
                SELECT due.id FROM preview_jobs due
                WHERE due.status = 'failed'
                  AND due.attempts < due.max_attempts
                  AND due.next_retry_at <= $1
                  AND NOT EXISTS (
                      SELECT 1 FROM preview_jobs active
                      WHERE active.file_id = due.file_id
                        AND active.status IN ('pending', 'processing')
                  )
                ORDER BY due.next_retry_at ASC
                LIMIT $2
                FOR UPDATE OF due SKIP LOCKED
            )
            AND status = 'failed'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        jobs_from_rows(rows)
    }

    async fn pending(&self, limit: i64) -> Result<Vec<PreviewJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM preview_jobs WHERE status = 'pending' \
             ORDER BY created_at ASC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        jobs_from_rows(rows)
    }

    async fn reap_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<PreviewJob>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE preview_jobs
            SET status = 'failed',
                last_error = $3,
                next_retry_at = CASE WHEN attempts < max_attempts THEN $2 ELSE NULL END,
                updated_at = NOW()
            WHERE status = 'processing' AND started_at < $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(cutoff)
        .bind(now)
        .bind(LEASE_EXPIRED_ERROR)
        .fetch_all(&self.pool)
        .await?;

        jobs_from_rows(rows)
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM preview_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match JobStatus::from_str(&status) {
                Ok(JobStatus::Pending) => counts.pending = n,
                Ok(JobStatus::Processing) => counts.processing = n,
                Ok(JobStatus::Completed) => counts.completed = n,
                Ok(JobStatus::Failed) => counts.failed = n,
                Err(_) => {
                    return Err(StoreError::Corrupt(format!("unknown job status '{}'", status)))
                }
            }
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Read-only view of the file subsystem's `files` table.
#[derive(Clone)]
pub struct PgFileCatalog {
    pool: PgPool,
}

impl PgFileCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileCatalog for PgFileCatalog {
    async fn find(&self, file_id: Uuid) -> Result<Option<FileRecord>, CatalogError> {
        let record = sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT id, name, storage_key, mime_type
            FROM files
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CatalogError::Backend(e.to_string()))?;

        Ok(record)
    }
}
