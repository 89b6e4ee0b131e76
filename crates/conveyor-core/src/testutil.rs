//! Minimal in-crate test doubles for `dispatcher`/`intake` unit tests.
//!
//! `conveyor-testing`'s `InMemoryJobStore`/`InMemoryRateLimiter` can't be
//! used here: that crate depends on `conveyor-core`, so pulling it in as a
//! dev-dependency would be a cycle. These doubles are deliberately smaller
//! (no poison-recovery ceremony, no fixtures) since they only need to
//! support this crate's own state-machine tests.

#![cfg(test)]

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{Job, JobStatus};
use crate::store::{
    AdmitDecision, CleanupCounts, CleanupOptions, JobStore, ListFilters, QueueStats, RateLimiter,
    StatusPatch,
};
use crate::error::StoreError;

#[derive(Default)]
pub(crate) struct FakeStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl FakeStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get_sync(&self, id: Uuid) -> Job {
        self.jobs.lock().unwrap().get(&id).cloned().unwrap()
    }

    pub(crate) fn seed(&self, job: Job) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for FakeStore {
    async fn create(&self, job: Job) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(StoreError(anyhow::anyhow!("duplicate id")));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected_status: Option<JobStatus>,
        new_status: JobStatus,
        patch: StatusPatch,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        if let Some(expected) = expected_status {
            if job.status != expected {
                return Ok(false);
            }
        }
        job.status = new_status;
        if let Some(v) = patch.attempts {
            job.attempts = v;
        }
        if let Some(v) = patch.started_at {
            job.started_at = v;
        }
        if let Some(v) = patch.completed_at {
            job.completed_at = v;
        }
        if let Some(v) = patch.result {
            job.result = v;
        }
        if let Some(v) = patch.error {
            job.error = v;
        }
        if let Some(v) = patch.next_retry_at {
            job.next_retry_at = v;
        }
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn list(&self, principal: Uuid, filters: ListFilters) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().unwrap();
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| j.principal_id == principal)
            .filter(|j| {
                filters
                    .job_type
                    .as_deref()
                    .map(|t| t == j.job_type)
                    .unwrap_or(true)
            })
            .filter(|j| filters.status.map(|s| s == j.status).unwrap_or(true))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(filters.limit.max(1) as usize);
        Ok(matching)
    }

    async fn claim_next_pending(&self, principal: Uuid) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();
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
        let job = jobs.get_mut(&id).unwrap();
        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.started_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn reset_stale(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();
        let mut reset = 0u64;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Processing
                && job.started_at.map(|t| t < older_than).unwrap_or(false)
            {
                job.status = JobStatus::Pending;
                job.next_retry_at = Some(now);
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn cleanup(&self, _options: CleanupOptions) -> Result<CleanupCounts, StoreError> {
        Ok(CleanupCounts::default())
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        Ok(QueueStats::default())
    }
}

/// Admits up to `ceiling` calls per `(principal, job_type)` pair, no
/// hour-window bucketing — dispatcher/intake tests don't need real wall
/// clock window semantics, only "is this call admitted".
pub(crate) struct FakeRateLimiter {
    ceiling: u32,
    counts: Mutex<HashMap<(Uuid, String), u32>>,
}

impl FakeRateLimiter {
    pub(crate) fn with_ceiling(ceiling: u32) -> Self {
        Self {
            ceiling,
            counts: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RateLimiter for FakeRateLimiter {
    async fn check_and_maybe_admit(
        &self,
        principal: Uuid,
        job_type: &str,
    ) -> Result<AdmitDecision, StoreError> {
        let mut counts = self.counts.lock().unwrap();
        let key = (principal, job_type.to_string());
        let count = counts.entry(key).or_insert(0);
        let reset_at = Utc::now() + chrono::Duration::hours(1);
        if *count >= self.ceiling {
            return Ok(AdmitDecision {
                admitted: false,
                remaining: 0,
                reset_at,
            });
        }
        *count += 1;
        Ok(AdmitDecision {
            admitted: true,
            remaining: self.ceiling.saturating_sub(*count),
            reset_at,
        })
    }
}
