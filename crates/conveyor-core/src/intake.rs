//! The intake API (§4.6): `enqueue`, `status`, `retry`, `list`. This is
//! the surface `conveyor-http` wraps in HTTP handlers, and the surface a
//! handler's cascade calls reduce to under the hood.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::cascade::{Cascade, CascadeOutcome};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::IntakeError;
use crate::model::{Job, JobStatus};
use crate::registry::SharedRegistry;
use crate::store::{JobStore, ListFilters, RateLimiter};

/// Validate and persist one job admission. Shared by `Intake::enqueue`
/// and `Intake::retry` (§4.6 step 4 of `retry` is "enqueue a fresh job"),
/// and by `CascadeHandle::enqueue_child` so cascades go through the exact
/// same admission path a top-level enqueue does.
async fn do_enqueue<S: JobStore, R: RateLimiter>(
    store: &S,
    rate_limiter: &R,
    registry: &crate::registry::HandlerRegistry,
    config: &Config,
    principal: Uuid,
    job_type: &str,
    payload: Value,
    priority: i32,
) -> Result<Job, IntakeError> {
    if !registry.is_registered(job_type) {
        return Err(IntakeError::Validation(format!(
            "unknown job type: {job_type}"
        )));
    }
    if !payload.is_object() {
        return Err(IntakeError::Validation(
            "payload must be a JSON object".into(),
        ));
    }

    let decision = rate_limiter
        .check_and_maybe_admit(principal, job_type)
        .await
        .map_err(|e| IntakeError::Internal(e.0))?;
    if !decision.admitted {
        let millis_remaining = (decision.reset_at - Utc::now())
            .num_milliseconds()
            .max(0);
        // ceil((reset_at - now) / 1s), per §4.2.
        let retry_after_seconds = millis_remaining.div_ceil(1000) as u64;
        return Err(IntakeError::RateLimited {
            retry_after_seconds,
        });
    }

    let max_attempts = registry
        .max_attempts_override(job_type)
        .map(|n| n as i32)
        .unwrap_or(config.default_max_attempts as i32);

    let job = Job::new(job_type, payload, principal, priority, max_attempts);
    store.create(job).await.map_err(|e| IntakeError::Internal(e.0))
}

/// The cascade capability handed to running handlers. Shares the same
/// store/rate-limiter/registry/config as its owning `Intake`, but cannot
/// reach `status`/`retry`/`list` — only `enqueue_child`.
pub struct CascadeHandle<S: JobStore, R: RateLimiter> {
    store: Arc<S>,
    rate_limiter: Arc<R>,
    registry: SharedRegistry,
    config: Config,
}

#[async_trait]
impl<S: JobStore, R: RateLimiter> Cascade for CascadeHandle<S, R> {
    async fn enqueue_child(
        &self,
        principal: Uuid,
        job_type: &str,
        payload: Value,
        priority: i32,
    ) -> CascadeOutcome {
        match do_enqueue(
            self.store.as_ref(),
            self.rate_limiter.as_ref(),
            &self.registry,
            &self.config,
            principal,
            job_type,
            payload,
            priority,
        )
        .await
        {
            Ok(job) => CascadeOutcome::Enqueued(job),
            Err(IntakeError::RateLimited {
                retry_after_seconds,
            }) => {
                warn!(
                    principal = %principal,
                    job_type,
                    "cascade enqueue rate-limited, child skipped"
                );
                CascadeOutcome::RateLimited {
                    retry_after_seconds,
                }
            }
            Err(e) => {
                warn!(principal = %principal, job_type, error = %e, "cascade enqueue rejected");
                CascadeOutcome::Rejected(e.to_string())
            }
        }
    }
}

/// The intake API over a concrete `JobStore` + `RateLimiter` pair.
pub struct Intake<S: JobStore, R: RateLimiter> {
    store: Arc<S>,
    rate_limiter: Arc<R>,
    registry: SharedRegistry,
    config: Config,
    dispatcher: Dispatcher<S>,
}

impl<S: JobStore + 'static, R: RateLimiter + 'static> Intake<S, R> {
    pub fn new(
        store: Arc<S>,
        rate_limiter: Arc<R>,
        registry: SharedRegistry,
        config: Config,
    ) -> Self {
        let cascade: Arc<dyn Cascade> = Arc::new(CascadeHandle {
            store: store.clone(),
            rate_limiter: rate_limiter.clone(),
            registry: registry.clone(),
            config,
        });
        let dispatcher = Dispatcher::new(store.clone(), registry.clone(), cascade, config);
        Self {
            store,
            rate_limiter,
            registry,
            config,
            dispatcher,
        }
    }

    /// §4.6 `enqueue`.
    pub async fn enqueue(
        &self,
        principal: Uuid,
        job_type: &str,
        payload: Value,
        priority: Option<i32>,
    ) -> Result<Job, IntakeError> {
        do_enqueue(
            self.store.as_ref(),
            self.rate_limiter.as_ref(),
            &self.registry,
            &self.config,
            principal,
            job_type,
            payload,
            priority.unwrap_or(0),
        )
        .await
    }

    /// §4.6 `status`: reap stale leases, fetch the row, and if it's
    /// eligible spawn dispatch in the background before returning the
    /// current snapshot. Reap is ordered before read so the status
    /// response never shows a torn view of a job the reaper was about to
    /// reset (§9's second Open Question).
    pub async fn status(&self, principal: Uuid, id: Uuid) -> Result<Job, IntakeError>
    where
        S: 'static,
    {
        self.store
            .reset_stale(Utc::now() - chrono::Duration::from_std(self.config.lease_timeout).unwrap())
            .await
            .map_err(|e| IntakeError::Internal(e.0))?;

        let job = self
            .store
            .get(id)
            .await
            .map_err(|e| IntakeError::Internal(e.0))?
            .filter(|j| j.principal_id == principal)
            .ok_or(IntakeError::NotFound)?;

        if job.can_dispatch(Utc::now()) {
            let dispatcher = self.dispatcher.clone();
            let job_id = job.id;
            tokio::spawn(async move {
                if let Err(e) = dispatcher.process(job_id).await {
                    warn!(job_id = %job_id, error = %e, "background dispatch failed");
                }
            });
        }

        Ok(job)
    }

    /// §4.6 `retry`: re-enqueue a failed job's type/payload/priority.
    /// The original row is left untouched.
    pub async fn retry(&self, principal: Uuid, id: Uuid) -> Result<Job, IntakeError> {
        let original = self
            .store
            .get(id)
            .await
            .map_err(|e| IntakeError::Internal(e.0))?
            .filter(|j| j.principal_id == principal)
            .ok_or(IntakeError::NotFound)?;

        if original.status != JobStatus::Failed {
            return Err(IntakeError::InvalidState);
        }

        do_enqueue(
            self.store.as_ref(),
            self.rate_limiter.as_ref(),
            &self.registry,
            &self.config,
            principal,
            &original.job_type,
            original.payload,
            original.priority,
        )
        .await
    }

    /// §4.6 `list`: newest first, capped at `Config::max_list_limit`.
    pub async fn list(
        &self,
        principal: Uuid,
        mut filters: ListFilters,
    ) -> Result<Vec<Job>, IntakeError> {
        if filters.limit == 0 {
            filters.limit = self.config.default_list_limit;
        }
        filters.limit = filters.limit.min(self.config.max_list_limit);
        self.store
            .list(principal, filters)
            .await
            .map_err(|e| IntakeError::Internal(e.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerRegistry;
    use crate::store::StatusPatch;
    use crate::testutil::{FakeRateLimiter, FakeStore};
    use std::time::Duration as StdDuration;

    fn intake_with(
        registry: HandlerRegistry,
        rate_ceiling: u32,
    ) -> Intake<FakeStore, FakeRateLimiter> {
        Intake::new(
            Arc::new(FakeStore::new()),
            Arc::new(FakeRateLimiter::with_ceiling(rate_ceiling)),
            Arc::new(registry),
            Config::default(),
        )
    }

    fn echo_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register("flashcard_generation", |payload, _job, _cascade| async move {
            Ok(payload)
        });
        registry
    }

    #[tokio::test]
    async fn enqueue_rejects_unknown_type() {
        let intake = intake_with(HandlerRegistry::new(), 20);
        let err = intake
            .enqueue(Uuid::new_v4(), "nope", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::Validation(_)));
    }

    #[tokio::test]
    async fn enqueue_rejects_non_object_payload() {
        let intake = intake_with(echo_registry(), 20);
        let err = intake
            .enqueue(
                Uuid::new_v4(),
                "flashcard_generation",
                serde_json::json!("not an object"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::Validation(_)));
    }

    /// S3: the 21st-equivalent admission in a maxed-out window is denied
    /// with a `retry_after` and creates no row.
    #[tokio::test]
    async fn enqueue_denied_once_rate_ceiling_reached() {
        let intake = intake_with(echo_registry(), 1);
        let principal = Uuid::new_v4();

        let first = intake
            .enqueue(principal, "flashcard_generation", serde_json::json!({}), None)
            .await
            .unwrap();
        let second = intake
            .enqueue(principal, "flashcard_generation", serde_json::json!({}), None)
            .await;

        assert_eq!(first.status, JobStatus::Pending);
        match second {
            Err(IntakeError::RateLimited { .. }) => {}
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    /// §4.6 `status`: a pending, eligible job triggers a background
    /// dispatch and the caller sees the pre-dispatch snapshot immediately
    /// (it does not block on the handler running).
    #[tokio::test]
    async fn status_on_eligible_job_returns_snapshot_without_blocking() {
        let intake = intake_with(echo_registry(), 20);
        let principal = Uuid::new_v4();
        let job = intake
            .enqueue(
                principal,
                "flashcard_generation",
                serde_json::json!({"k": "v"}),
                None,
            )
            .await
            .unwrap();

        let snapshot = intake.status(principal, job.id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Pending);
    }

    /// Cross-principal access to a real id returns not-found, not
    /// forbidden, to avoid existence disclosure (§4.6 step 2, §7).
    #[tokio::test]
    async fn status_for_wrong_principal_is_not_found() {
        let intake = intake_with(echo_registry(), 20);
        let owner = Uuid::new_v4();
        let job = intake
            .enqueue(owner, "flashcard_generation", serde_json::json!({}), None)
            .await
            .unwrap();

        let err = intake
            .status(Uuid::new_v4(), job.id)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::NotFound));
    }

    /// §4.6 `retry`: only a `failed` job can be retried; a fresh row is
    /// created with the same type/payload/priority and the original is
    /// left untouched.
    #[tokio::test]
    async fn retry_rejects_non_failed_job() {
        let intake = intake_with(echo_registry(), 20);
        let principal = Uuid::new_v4();
        let job = intake
            .enqueue(principal, "flashcard_generation", serde_json::json!({}), None)
            .await
            .unwrap();

        let err = intake.retry(principal, job.id).await.unwrap_err();
        assert!(matches!(err, IntakeError::InvalidState));
    }

    #[tokio::test]
    async fn retry_of_failed_job_creates_fresh_pending_row() {
        let intake = intake_with(echo_registry(), 20);
        let principal = Uuid::new_v4();
        let original = intake
            .enqueue(
                principal,
                "flashcard_generation",
                serde_json::json!({"messageId": "m1"}),
                Some(5),
            )
            .await
            .unwrap();

        intake
            .store
            .update_status(
                original.id,
                None,
                JobStatus::Failed,
                StatusPatch {
                    error: Some(Some("upstream 503".into())),
                    completed_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let retried = intake.retry(principal, original.id).await.unwrap();
        assert_ne!(retried.id, original.id);
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.attempts, 0);
        assert_eq!(retried.priority, 5);
        assert_eq!(retried.payload, original.payload);

        let original_reloaded = intake.store.get(original.id).await.unwrap().unwrap();
        assert_eq!(original_reloaded.status, JobStatus::Failed);
    }

    /// §4.5/§9 "reap-then-read": a job stuck in `processing` past the
    /// lease timeout is reset to `pending` by the very `status` call that
    /// observes it, and that same call spawns a fresh dispatch attempt.
    #[tokio::test]
    async fn status_reaps_stale_processing_job_before_returning() {
        let intake = intake_with(echo_registry(), 20);
        let principal = Uuid::new_v4();

        let mut stale = crate::model::Job::new(
            "flashcard_generation",
            serde_json::json!({}),
            principal,
            0,
            3,
        );
        stale.status = JobStatus::Processing;
        stale.attempts = 1;
        stale.started_at = Some(Utc::now() - StdDuration::from_secs(6 * 60));
        intake.store.create(stale.clone()).await.unwrap();

        let snapshot = intake.status(principal, stale.id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Pending);
        assert!(snapshot.next_retry_at.is_some());
    }

    /// §4.7 cascade: a handler that enqueues a child through its
    /// `CascadeHandle` produces a second, independently rate-limited row
    /// for the same principal.
    #[tokio::test]
    async fn cascade_handle_enqueues_a_child_job() {
        let mut registry = HandlerRegistry::new();
        registry.register("tree_generation", |_payload, job, cascade| async move {
            let outcome = cascade
                .enqueue_child(
                    job.principal_id,
                    "flashcard_generation",
                    serde_json::json!({"leaf": 1}),
                    0,
                )
                .await;
            Ok(serde_json::json!({"cascade": format!("{outcome:?}")}))
        });
        let intake = intake_with(registry, 20);
        let principal = Uuid::new_v4();

        let parent = intake
            .enqueue(principal, "tree_generation", serde_json::json!({}), None)
            .await
            .unwrap();

        // Drive the dispatch synchronously so the cascade has run by the
        // time we assert, instead of racing the `tokio::spawn` inside
        // `status`.
        intake.dispatcher.process(parent.id).await.unwrap();

        let children = intake
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
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].payload, serde_json::json!({"leaf": 1}));

        let parent_reloaded = intake.store.get(parent.id).await.unwrap().unwrap();
        assert_eq!(parent_reloaded.status, JobStatus::Completed);
    }

    /// `list` never returns more than `Config::max_list_limit`, even if
    /// the caller asks for more (§8 boundary).
    #[tokio::test]
    async fn list_caps_at_max_list_limit() {
        let intake = intake_with(echo_registry(), 20);
        let principal = Uuid::new_v4();
        for _ in 0..3 {
            intake
                .enqueue(principal, "flashcard_generation", serde_json::json!({}), None)
                .await
                .unwrap();
        }

        let jobs = intake
            .list(
                principal,
                ListFilters {
                    job_type: None,
                    status: None,
                    limit: 150,
                },
            )
            .await
            .unwrap();
        assert!(jobs.len() <= Config::default().max_list_limit as usize);
    }
}
