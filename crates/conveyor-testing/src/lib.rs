//! In-memory `JobStore` and `RateLimiter` for testing `conveyor-core`
//! engine logic (dispatcher, intake, cascade) without a Postgres instance.
//!
//! Mirrors the teacher corpus's `TestJobManager` pattern: jobs live in a
//! `RwLock<HashMap<Uuid, Job>>` inspectable directly by tests, with the
//! same poison-recovery idiom (`unwrap_or_else(|e| e.into_inner())`)
//! rather than panicking a whole test suite over one poisoned lock.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::{
    floor_to_hour, AdmitDecision, CleanupCounts, CleanupOptions, Job, JobStatus, JobStore,
    ListFilters, QueueStats, RateLimiter, RateWindow, StatusPatch, StoreError,
};
use uuid::Uuid;

/// An in-memory `JobStore`. Not safe to share across process boundaries;
/// exists purely for tests.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job row directly, bypassing admission — for test setup
    /// (e.g. seeding a `processing` job with a `started_at` in the past to
    /// exercise the reaper).
    pub fn seed(&self, job: Job) {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id, job);
    }

    /// Snapshot every job currently stored, for assertions.
    pub fn all(&self) -> Vec<Job> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn apply_patch(job: &mut Job, new_status: JobStatus, patch: StatusPatch) {
        job.status = new_status;
        if let Some(attempts) = patch.attempts {
            job.attempts = attempts;
        }
        if let Some(started_at) = patch.started_at {
            job.started_at = started_at;
        }
        if let Some(completed_at) = patch.completed_at {
            job.completed_at = completed_at;
        }
        if let Some(result) = patch.result {
            job.result = result;
        }
        if let Some(error) = patch.error {
            job.error = error;
        }
        if let Some(next_retry_at) = patch.next_retry_at {
            job.next_retry_at = next_retry_at;
        }
        job.updated_at = Utc::now();
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if jobs.contains_key(&job.id) {
            return Err(StoreError(anyhow::anyhow!("job {} already exists", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected_status: Option<JobStatus>,
        new_status: JobStatus,
        patch: StatusPatch,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if let Some(expected) = expected_status {
            if job.status != expected {
                return Ok(false);
            }
        }
        Self::apply_patch(job, new_status, patch);
        Ok(true)
    }

    async fn list(&self, principal: Uuid, filters: ListFilters) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| j.principal_id == principal)
            .filter(|j| filters.job_type.as_deref().map(|t| t == j.job_type).unwrap_or(true))
            .filter(|j| filters.status.map(|s| s == j.status).unwrap_or(true))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(filters.limit.max(1) as usize);
        Ok(matching)
    }

    async fn claim_next_pending(&self, principal: Uuid) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let best_id = jobs
            .values()
            .filter(|j| j.principal_id == principal && j.can_dispatch(now))
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            })
            .map(|j| j.id);
        let Some(id) = best_id else {
            return Ok(None);
        };
        let job = jobs.get_mut(&id).expect("id came from this map");
        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn reset_stale(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let mut reset = 0u64;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Processing
                && job.started_at.map(|t| t < older_than).unwrap_or(false)
            {
                job.status = JobStatus::Pending;
                job.next_retry_at = Some(now);
                job.updated_at = now;
                reset += 1;
            }
        }
        Ok(reset)
    }

    /// `windows_deleted` is always 0 here: this store only owns job rows.
    /// `InMemoryRateLimiter` keeps its own counters and has no GC of its
    /// own to call — Postgres backs both tables from the same pool, this
    /// split testing double does not.
    async fn cleanup(&self, options: CleanupOptions) -> Result<CleanupCounts, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let mut counts = CleanupCounts::default();
        let mut to_delete = Vec::new();
        for job in jobs.values() {
            match job.status {
                JobStatus::Completed => {
                    if let Some(completed_at) = job.completed_at {
                        if now - completed_at > options.completed_max_age {
                            to_delete.push(job.id);
                            counts.completed_deleted += 1;
                        }
                    }
                }
                JobStatus::Failed => {
                    if let Some(completed_at) = job.completed_at {
                        if now - completed_at > options.failed_max_age {
                            to_delete.push(job.id);
                            counts.failed_deleted += 1;
                        }
                    }
                }
                _ => {}
            }
            if to_delete.len() as u32 >= options.batch_size {
                break;
            }
        }
        if !options.dry_run {
            for id in to_delete {
                jobs.remove(&id);
            }
        }
        Ok(counts)
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut stats = QueueStats::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => {
                    stats.completed += 1;
                    if let Some(completed_at) = job.completed_at {
                        stats.oldest_completed_at = Some(
                            stats
                                .oldest_completed_at
                                .map_or(completed_at, |t| t.min(completed_at)),
                        );
                    }
                }
                JobStatus::Failed => {
                    stats.failed += 1;
                    if let Some(completed_at) = job.completed_at {
                        stats.oldest_failed_at = Some(
                            stats
                                .oldest_failed_at
                                .map_or(completed_at, |t| t.min(completed_at)),
                        );
                    }
                }
            }
        }
        Ok(stats)
    }
}

/// An in-memory `RateLimiter`, hard-ceiling variant (matches
/// `conveyor-postgres::PgRateLimiter`'s resolution of §4.2's Open
/// Question): the check and the increment happen under one lock, so
/// `count` never exceeds `rate_max`.
pub struct InMemoryRateLimiter {
    rate_max: u32,
    windows: RwLock<HashMap<(Uuid, String, DateTime<Utc>), RateWindow>>,
}

impl InMemoryRateLimiter {
    /// `window_size` is accepted for symmetry with `Config` but the window
    /// boundary itself is always floor-to-hour (§3, §4.2) — there is no
    /// configurable window width in this engine, only the named constant.
    pub fn new(rate_max: u32, _window_size: std::time::Duration) -> Self {
        Self {
            rate_max,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &conveyor_core::Config) -> Self {
        Self::new(config.rate_max, config.window_size)
    }

    /// Directly read the counter for a window, for test assertions.
    pub fn count_for(&self, principal: Uuid, job_type: &str, window_start: DateTime<Utc>) -> u32 {
        self.windows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(principal, job_type.to_string(), window_start))
            .map(|w| w.count as u32)
            .unwrap_or(0)
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check_and_maybe_admit(
        &self,
        principal: Uuid,
        job_type: &str,
    ) -> Result<AdmitDecision, StoreError> {
        let now = Utc::now();
        let window_start = floor_to_hour(now);
        let reset_at = window_start + chrono::Duration::hours(1);
        let key = (principal, job_type.to_string(), window_start);

        let mut windows = self.windows.write().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(key).or_insert_with(|| RateWindow {
            principal_id: principal,
            job_type: job_type.to_string(),
            window_start,
            count: 0,
        });
        if window.count as u32 >= self.rate_max {
            return Ok(AdmitDecision {
                admitted: false,
                remaining: 0,
                reset_at,
            });
        }
        window.count += 1;
        Ok(AdmitDecision {
            admitted: true,
            remaining: self.rate_max - window.count as u32,
            reset_at,
        })
    }
}

/// A `flashcard_generation`-shaped job for a fresh principal, matching the
/// engine's reference deployment's default job type (§1). Useful as a
/// starting point for dispatcher/intake tests that don't care about the
/// exact payload shape.
pub fn sample_job(principal: Uuid) -> Job {
    Job::new(
        "flashcard_generation",
        serde_json::json!({"messageId": "m1", "content": "hello"}),
        principal,
        0,
        3,
    )
}

/// Same as [`sample_job`] but with an explicit type, for cascade/registry
/// tests that need more than one job type in play.
pub fn sample_job_of_type(job_type: &str, principal: Uuid) -> Job {
    Job::new(job_type, serde_json::json!({}), principal, 0, 3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::JobStatus;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = InMemoryJobStore::new();
        let job = sample_job(Uuid::new_v4());
        let created = store.create(job.clone()).await.unwrap();
        let fetched = store.get(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let store = InMemoryJobStore::new();
        let job = sample_job(Uuid::new_v4());
        store.create(job.clone()).await.unwrap();
        assert!(store.create(job).await.is_err());
    }

    #[tokio::test]
    async fn update_status_cas_only_one_winner() {
        let store = InMemoryJobStore::new();
        let job = store.create(sample_job(Uuid::new_v4())).await.unwrap();

        let first = store
            .update_status(
                job.id,
                Some(JobStatus::Pending),
                JobStatus::Processing,
                StatusPatch::default(),
            )
            .await
            .unwrap();
        let second = store
            .update_status(
                job.id,
                Some(JobStatus::Pending),
                JobStatus::Processing,
                StatusPatch::default(),
            )
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn reset_stale_only_touches_old_processing_jobs() {
        let store = InMemoryJobStore::new();
        let mut job = sample_job(Uuid::new_v4());
        job.status = JobStatus::Processing;
        job.started_at = Some(Utc::now() - chrono::Duration::minutes(10));
        store.seed(job.clone());

        let reset = store
            .reset_stale(Utc::now() - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(reset, 1);

        let reloaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Pending);
        assert!(reloaded.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn claim_next_pending_prefers_higher_priority() {
        let store = InMemoryJobStore::new();
        let principal = Uuid::new_v4();
        let mut low = sample_job(principal);
        low.priority = 0;
        let mut high = sample_job(principal);
        high.priority = 5;
        store.create(low).await.unwrap();
        store.create(high.clone()).await.unwrap();

        let claimed = store.claim_next_pending(principal).await.unwrap().unwrap();
        assert_eq!(claimed.id, high.id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.started_at.is_some());
    }

    #[tokio::test]
    async fn claim_next_pending_skips_jobs_with_future_retry() {
        let store = InMemoryJobStore::new();
        let principal = Uuid::new_v4();
        let mut job = sample_job(principal);
        job.next_retry_at = Some(Utc::now() + chrono::Duration::minutes(5));
        store.create(job).await.unwrap();

        assert!(store.claim_next_pending(principal).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rate_limiter_denies_at_ceiling() {
        let limiter = InMemoryRateLimiter::new(2, std::time::Duration::from_secs(3600));
        let principal = Uuid::new_v4();
        let first = limiter
            .check_and_maybe_admit(principal, "flashcard_generation")
            .await
            .unwrap();
        let second = limiter
            .check_and_maybe_admit(principal, "flashcard_generation")
            .await
            .unwrap();
        let third = limiter
            .check_and_maybe_admit(principal, "flashcard_generation")
            .await
            .unwrap();

        assert!(first.admitted);
        assert!(second.admitted);
        assert!(!third.admitted);
        assert_eq!(third.remaining, 0);
    }

    #[tokio::test]
    async fn rate_limiter_is_a_hard_ceiling_never_overshoots() {
        let limiter = InMemoryRateLimiter::new(1, std::time::Duration::from_secs(3600));
        let principal = Uuid::new_v4();
        let mut admitted = 0;
        for _ in 0..10 {
            let decision = limiter
                .check_and_maybe_admit(principal, "tree_generation")
                .await
                .unwrap();
            if decision.admitted {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    /// `count_for` reads back the same `RateWindow` the limiter wrote,
    /// keyed by the exact floor-to-hour `window_start` admission used.
    #[tokio::test]
    async fn count_for_reflects_admitted_count_for_the_current_window() {
        let limiter = InMemoryRateLimiter::new(5, std::time::Duration::from_secs(3600));
        let principal = Uuid::new_v4();
        let window_start = floor_to_hour(Utc::now());

        assert_eq!(limiter.count_for(principal, "flashcard_generation", window_start), 0);

        limiter
            .check_and_maybe_admit(principal, "flashcard_generation")
            .await
            .unwrap();
        limiter
            .check_and_maybe_admit(principal, "flashcard_generation")
            .await
            .unwrap();

        assert_eq!(limiter.count_for(principal, "flashcard_generation", window_start), 2);
        // A different job type under the same principal gets its own window.
        assert_eq!(limiter.count_for(principal, "tree_generation", window_start), 0);
    }

    /// `sample_job_of_type` fixtures a cascade-shaped scenario: a parent of
    /// one type and children of another, listed independently by `list`'s
    /// `job_type` filter.
    #[tokio::test]
    async fn sample_job_of_type_fixtures_a_cascade_scenario() {
        let store = InMemoryJobStore::new();
        let principal = Uuid::new_v4();
        let parent = sample_job_of_type("tree_generation", principal);
        let child = sample_job_of_type("flashcard_generation", principal);
        store.create(parent.clone()).await.unwrap();
        store.create(child.clone()).await.unwrap();

        let trees = store
            .list(
                principal,
                ListFilters {
                    job_type: Some("tree_generation".into()),
                    status: None,
                    limit: 10,
                },
            )
            .await
            .unwrap();
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0].id, parent.id);

        let flashcards = store
            .list(
                principal,
                ListFilters {
                    job_type: Some("flashcard_generation".into()),
                    status: None,
                    limit: 10,
                },
            )
            .await
            .unwrap();
        assert_eq!(flashcards.len(), 1);
        assert_eq!(flashcards[0].id, child.id);
    }
}
