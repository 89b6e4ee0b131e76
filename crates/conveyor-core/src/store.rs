//! `JobStore` and `RateLimiter`: the only two traits an implementer needs
//! to provide a storage backend. Both are policy-light — the store
//! decides nothing about retry counts or admission thresholds beyond
//! what it's told; that policy lives in `Dispatcher` and `Intake`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Job, JobStatus};

/// Patchable fields for `update_status`. `None` means "leave unchanged".
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub attempts: Option<i32>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub result: Option<Option<Value>>,
    pub error: Option<Option<String>>,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
}

/// Filters accepted by `list` (§4.1).
#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    pub job_type: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: u32,
}

/// Row counts returned by `cleanup` (§4.8), one field per eligible
/// category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupCounts {
    pub completed_deleted: u64,
    pub failed_deleted: u64,
    pub windows_deleted: u64,
}

/// Options for `cleanup` (§4.8). Defaults match `Config::default()`'s
/// retention values via `CleanupOptions::from_config`.
#[derive(Debug, Clone, Copy)]
pub struct CleanupOptions {
    pub completed_max_age: chrono::Duration,
    pub failed_max_age: chrono::Duration,
    pub window_max_age: chrono::Duration,
    pub batch_size: u32,
    pub dry_run: bool,
}

impl CleanupOptions {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            completed_max_age: chrono::Duration::from_std(config.completed_retention)
                .expect("retention fits in chrono::Duration"),
            failed_max_age: chrono::Duration::from_std(config.failed_retention)
                .expect("retention fits in chrono::Duration"),
            window_max_age: chrono::Duration::from_std(config.window_retention)
                .expect("retention fits in chrono::Duration"),
            batch_size: config.default_gc_batch,
            dry_run: false,
        }
    }
}

/// Per-status counts and the oldest terminal timestamp in each, the
/// corrected replacement for the source's unfinished 0/1-per-bucket stats
/// (§9 Open Question).
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub oldest_completed_at: Option<DateTime<Utc>>,
    pub oldest_failed_at: Option<DateTime<Utc>>,
}

/// Durable persistence of jobs (§4.1). Every method is a single
/// transactional statement or explicit transaction — no operation here
/// retries internally; storage failures propagate to the caller.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending row. Fails on id collision.
    async fn create(&self, job: Job) -> Result<Job, StoreError>;

    /// Fetch a job by id, or `Ok(None)` if it doesn't exist.
    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Conditionally transition a job's status and patch fields in one
    /// statement. `expected_status`, when set, makes the write a
    /// compare-and-set: the transition only applies if the row's current
    /// status matches. Returns `true` iff a row was affected — callers
    /// use this to detect "someone else already claimed/finished this
    /// job" (§4.4, §9: "Single-owner dispatch").
    async fn update_status(
        &self,
        id: Uuid,
        expected_status: Option<JobStatus>,
        new_status: JobStatus,
        patch: StatusPatch,
    ) -> Result<bool, StoreError>;

    /// Jobs matching `{type?, status?}` for one principal, newest first,
    /// bounded by `filters.limit` (the caller is responsible for capping
    /// it at `Config::max_list_limit` before calling).
    async fn list(&self, principal: Uuid, filters: ListFilters) -> Result<Vec<Job>, StoreError>;

    /// The highest-priority pending, eligible job for a principal,
    /// ordered by priority desc then `created_at` asc. Used by batch
    /// pollers; the reference intake path claims by id instead (§4.1).
    async fn claim_next_pending(&self, principal: Uuid) -> Result<Option<Job>, StoreError>;

    /// Reset every `processing` job whose `started_at` predates
    /// `older_than` back to `pending` with `next_retry_at = now`.
    /// Returns the number of rows reset. Safe to call concurrently: each
    /// call is one bulk update, so two overlapping calls reset a given
    /// stale row at most once between them.
    async fn reset_stale(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete terminal jobs older than their category's threshold and
    /// rate windows strictly in the past. Never touches `pending` or
    /// `processing` rows.
    async fn cleanup(&self, options: CleanupOptions) -> Result<CleanupCounts, StoreError>;

    /// True aggregate counts per status plus the oldest terminal
    /// timestamp in each, replacing the source's unfinished stats.
    async fn stats(&self) -> Result<QueueStats, StoreError>;
}

/// Outcome of a rate-limit admission check (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmitDecision {
    pub admitted: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Decides whether a `(principal, job_type)` pair may enqueue another job
/// this hour, and accounts the admission atomically (§4.2).
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Check admission and, if admitted, increment the window's counter
    /// in the same call. Implementations that want a hard ceiling fold
    /// the check into the increment as one conditional write (the
    /// Redesign Flag this engine takes, see `DESIGN.md`); implementations
    /// that tolerate the source's documented race may separate read and
    /// upsert internally, but must still return a decision consistent
    /// with what was actually persisted.
    async fn check_and_maybe_admit(
        &self,
        principal: Uuid,
        job_type: &str,
    ) -> Result<AdmitDecision, StoreError>;
}
