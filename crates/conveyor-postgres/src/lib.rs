//! PostgreSQL implementation of the `conveyor-core` job engine traits.
//!
//! # Features
//!
//! - Compare-and-set status transitions (`UPDATE ... WHERE id = $1 AND
//!   status = $2`), so concurrent pollers cannot double-dispatch a job
//!   (§4.4, §9: "Single-owner dispatch").
//! - [`PgJobStore::claim_next_pending`] claims atomically in one statement:
//!   a `FOR UPDATE SKIP LOCKED` CTE picks the row, an outer `UPDATE`
//!   transitions it to `processing` before it's ever visible to another
//!   poller, so two concurrent batch pollers never walk away with the same
//!   row. The reference intake path claims by id via `update_status`'s
//!   compare-and-set instead.
//! - A hard rate-limit ceiling: the admission check and the increment are
//!   folded into one conditional `INSERT ... ON CONFLICT ... DO UPDATE
//!   ... WHERE count < $rate_max`, so `count` never exceeds `rate_max`
//!   (the stricter of the two options spec §4.2 allows; see `DESIGN.md`).
//!
//! # Schema
//!
//! See `migrations/0001_jobs_and_rate_windows.sql` for the `jobs` and
//! `rate_windows` tables this crate reads and writes (spec §6).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use conveyor_core::{
    AdmitDecision, CleanupCounts, CleanupOptions, Job, JobStatus, JobStore, ListFilters,
    QueueStats, RateLimiter, StatusPatch, StoreError,
};

fn store_err(e: sqlx::Error) -> StoreError {
    StoreError(anyhow::anyhow!(e))
}

fn row_to_job(row: sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    let status_str: String = row.try_get("status").map_err(store_err)?;
    let status = JobStatus::from_db_str(&status_str)
        .ok_or_else(|| StoreError(anyhow::anyhow!("unknown job status in row: {status_str}")))?;
    Ok(Job {
        id: row.try_get("id").map_err(store_err)?,
        job_type: row.try_get("job_type").map_err(store_err)?,
        payload: row.try_get("payload").map_err(store_err)?,
        status,
        priority: row.try_get("priority").map_err(store_err)?,
        attempts: row.try_get("attempts").map_err(store_err)?,
        max_attempts: row.try_get("max_attempts").map_err(store_err)?,
        next_retry_at: row.try_get("next_retry_at").map_err(store_err)?,
        started_at: row.try_get("started_at").map_err(store_err)?,
        completed_at: row.try_get("completed_at").map_err(store_err)?,
        result: row.try_get("result").map_err(store_err)?,
        error: row.try_get("error").map_err(store_err)?,
        principal_id: row.try_get("principal_id").map_err(store_err)?,
        created_at: row.try_get("created_at").map_err(store_err)?,
        updated_at: row.try_get("updated_at").map_err(store_err)?,
    })
}

/// `JobStore` backed by a `jobs` table, one row per job.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: Job) -> Result<Job, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, payload, status, priority, attempts, max_attempts,
                next_retry_at, started_at, completed_at, result, error,
                principal_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.status.as_db_str())
        .bind(job.priority)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.next_retry_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.result)
        .bind(&job.error)
        .bind(job.principal_id)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        row_to_job(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(row_to_job).transpose()
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected_status: Option<JobStatus>,
        new_status: JobStatus,
        patch: StatusPatch,
    ) -> Result<bool, StoreError> {
        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new("UPDATE jobs SET status = ");
        qb.push_bind(new_status.as_db_str());
        qb.push(", updated_at = NOW()");

        if let Some(attempts) = patch.attempts {
            qb.push(", attempts = ").push_bind(attempts);
        }
        if let Some(started_at) = patch.started_at {
            qb.push(", started_at = ").push_bind(started_at);
        }
        if let Some(completed_at) = patch.completed_at {
            qb.push(", completed_at = ").push_bind(completed_at);
        }
        if let Some(result) = patch.result {
            qb.push(", result = ").push_bind(result);
        }
        if let Some(error) = patch.error {
            qb.push(", error = ").push_bind(error);
        }
        if let Some(next_retry_at) = patch.next_retry_at {
            qb.push(", next_retry_at = ").push_bind(next_retry_at);
        }

        qb.push(" WHERE id = ").push_bind(id);
        if let Some(expected) = expected_status {
            qb.push(" AND status = ").push_bind(expected.as_db_str());
        }

        let result = qb.build().execute(&self.pool).await.map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, principal: Uuid, filters: ListFilters) -> Result<Vec<Job>, StoreError> {
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("SELECT * FROM jobs WHERE principal_id = ");
        qb.push_bind(principal);

        if let Some(job_type) = &filters.job_type {
            qb.push(" AND job_type = ").push_bind(job_type.clone());
        }
        if let Some(status) = filters.status {
            qb.push(" AND status = ").push_bind(status.as_db_str());
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filters.limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(store_err)?;
        rows.into_iter().map(row_to_job).collect()
    }

    async fn claim_next_pending(&self, principal: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM jobs
                WHERE principal_id = $1
                  AND status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= NOW())
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'processing',
                attempts = attempts + 1,
                started_at = NOW(),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM claimable)
            RETURNING *
            "#,
        )
        .bind(principal)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(row_to_job).transpose()
    }

    async fn reset_stale(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                next_retry_at = NOW(),
                updated_at = NOW()
            WHERE status = 'processing'
              AND started_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        let reset = result.rows_affected();
        if reset > 0 {
            debug!(reset, "reaper reset stale processing jobs");
        }
        Ok(reset)
    }

    async fn cleanup(&self, options: CleanupOptions) -> Result<CleanupCounts, StoreError> {
        let now = Utc::now();
        let completed_cutoff = now - options.completed_max_age;
        let failed_cutoff = now - options.failed_max_age;
        let window_cutoff = now - options.window_max_age;

        let completed_deleted = self
            .delete_or_count_terminal(JobStatus::Completed, completed_cutoff, options)
            .await?;
        let failed_deleted = self
            .delete_or_count_terminal(JobStatus::Failed, failed_cutoff, options)
            .await?;

        let windows_deleted = if options.dry_run {
            sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM rate_windows WHERE window_start < $1",
            )
            .bind(window_cutoff)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)? as u64
        } else {
            sqlx::query("DELETE FROM rate_windows WHERE window_start < $1")
                .bind(window_cutoff)
                .execute(&self.pool)
                .await
                .map_err(store_err)?
                .rows_affected()
        };

        Ok(CleanupCounts {
            completed_deleted,
            failed_deleted,
            windows_deleted,
        })
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending')    AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed')  AS completed,
                COUNT(*) FILTER (WHERE status = 'failed')     AS failed,
                MIN(completed_at) FILTER (WHERE status = 'completed') AS oldest_completed_at,
                MIN(completed_at) FILTER (WHERE status = 'failed')    AS oldest_failed_at
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(QueueStats {
            pending: row.try_get("pending").map_err(store_err)?,
            processing: row.try_get("processing").map_err(store_err)?,
            completed: row.try_get("completed").map_err(store_err)?,
            failed: row.try_get("failed").map_err(store_err)?,
            oldest_completed_at: row.try_get("oldest_completed_at").map_err(store_err)?,
            oldest_failed_at: row.try_get("oldest_failed_at").map_err(store_err)?,
        })
    }
}

impl PgJobStore {
    /// Shared by `cleanup`'s two terminal-status branches: deletes (or, in
    /// dry-run mode, counts) up to `options.batch_size` rows of `status`
    /// whose `completed_at` predates `cutoff`. Never touches `pending` or
    /// `processing` rows — the status filter makes that structurally
    /// impossible (§4.8's invariant).
    async fn delete_or_count_terminal(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
        options: CleanupOptions,
    ) -> Result<u64, StoreError> {
        if options.dry_run {
            let count: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM (
                    SELECT id FROM jobs
                    WHERE status = $1 AND completed_at < $2
                    LIMIT $3
                ) AS capped
                "#,
            )
            .bind(status.as_db_str())
            .bind(cutoff)
            .bind(options.batch_size as i64)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
            Ok(count as u64)
        } else {
            let result = sqlx::query(
                r#"
                DELETE FROM jobs
                WHERE id IN (
                    SELECT id FROM jobs
                    WHERE status = $1 AND completed_at < $2
                    LIMIT $3
                )
                "#,
            )
            .bind(status.as_db_str())
            .bind(cutoff)
            .bind(options.batch_size as i64)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
            Ok(result.rows_affected())
        }
    }
}

/// `RateLimiter` backed by the `rate_windows` table, with the hard-ceiling
/// upsert from this crate's module doc (spec §4.2's Redesign Flag).
#[derive(Clone)]
pub struct PgRateLimiter {
    pool: PgPool,
    rate_max: u32,
}

impl PgRateLimiter {
    pub fn new(pool: PgPool, rate_max: u32) -> Self {
        Self { pool, rate_max }
    }
}

#[async_trait]
impl RateLimiter for PgRateLimiter {
    async fn check_and_maybe_admit(
        &self,
        principal: Uuid,
        job_type: &str,
    ) -> Result<AdmitDecision, StoreError> {
        let now = Utc::now();
        let window_start = conveyor_core::floor_to_hour(now);
        let reset_at = window_start + chrono::Duration::hours(1);

        let row = sqlx::query(
            r#"
            INSERT INTO rate_windows (principal_id, job_type, window_start, count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (principal_id, job_type, window_start) DO UPDATE
                SET count = rate_windows.count + 1
                WHERE rate_windows.count < $4
            RETURNING count
            "#,
        )
        .bind(principal)
        .bind(job_type)
        .bind(window_start)
        .bind(self.rate_max as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        match row {
            Some(row) => {
                let count: i64 = row.try_get("count").map_err(store_err)?;
                Ok(AdmitDecision {
                    admitted: true,
                    remaining: (self.rate_max as i64 - count).max(0) as u32,
                    reset_at,
                })
            }
            None => {
                warn!(principal = %principal, job_type, "rate limit denied, window at ceiling");
                Ok(AdmitDecision {
                    admitted: false,
                    remaining: 0,
                    reset_at,
                })
            }
        }
    }
}
