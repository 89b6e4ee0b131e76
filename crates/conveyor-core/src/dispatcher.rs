//! The dispatcher state machine (§4.4).
//!
//! `Dispatcher::process` is the only place a job's status moves. It is
//! meant to run detached from the request that triggered it (`tokio::spawn`
//! at the call site) — `process` itself just awaits to completion and
//! logs; it never blocks a caller on a handler's I/O.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;
use tracing::{debug, info, warn};

use crate::backoff::backoff;
use crate::cascade::Cascade;
use crate::config::Config;
use crate::error::{FailureKind, StoreError};
use crate::model::JobStatus;
use crate::registry::SharedRegistry;
use crate::store::{JobStore, StatusPatch};

/// Drives one job through `pending -> processing -> completed | failed |
/// pending(retry)`.
pub struct Dispatcher<S: JobStore> {
    store: Arc<S>,
    registry: SharedRegistry,
    cascade: Arc<dyn Cascade>,
    config: Config,
}

impl<S: JobStore> Dispatcher<S> {
    pub fn new(
        store: Arc<S>,
        registry: SharedRegistry,
        cascade: Arc<dyn Cascade>,
        config: Config,
    ) -> Self {
        Self {
            store,
            registry,
            cascade,
            config,
        }
    }

    /// Execute one dispatch attempt for `job_id`.
    ///
    /// Returns `Ok(())` whether or not a handler actually ran — finding
    /// that another poller already claimed the row (the compare-and-set
    /// in step 1 affecting zero rows) is not an error, it's the expected
    /// outcome of concurrent dispatch (§9: "Single-owner dispatch").
    pub async fn process(&self, job_id: Uuid) -> Result<(), StoreError> {
        let Some(job) = self.store.get(job_id).await? else {
            warn!(job_id = %job_id, "dispatch requested for missing job");
            return Ok(());
        };

        if job.status != JobStatus::Pending {
            debug!(job_id = %job_id, status = ?job.status, "job not pending, skipping dispatch");
            return Ok(());
        }

        let pre_increment_attempts = job.attempts;
        let new_attempts = pre_increment_attempts + 1;
        let now = Utc::now();

        // Step 1: conditional transition to `processing`. Only one
        // concurrent caller can win this compare-and-set.
        let claimed = self
            .store
            .update_status(
                job_id,
                Some(JobStatus::Pending),
                JobStatus::Processing,
                StatusPatch {
                    attempts: Some(new_attempts),
                    started_at: Some(Some(now)),
                    ..Default::default()
                },
            )
            .await?;

        if !claimed {
            debug!(job_id = %job_id, "lost the claim race, another poller is handling it");
            return Ok(());
        }

        info!(job_id = %job_id, job_type = %job.job_type, attempt = new_attempts, "job dispatch started");

        // Step 2/3: resolve handler and invoke it. `HandlerRegistry::dispatch`
        // itself reports unknown types as a permanent failure.
        let max_attempts = self
            .registry
            .max_attempts_override(&job.job_type)
            .map(|n| n as i32)
            .unwrap_or(job.max_attempts);

        let outcome = self.registry.dispatch(job.clone(), self.cascade.clone()).await;

        match outcome {
            Ok(result) => {
                info!(job_id = %job_id, job_type = %job.job_type, "job completed");
                self.store
                    .update_status(
                        job_id,
                        Some(JobStatus::Processing),
                        JobStatus::Completed,
                        StatusPatch {
                            result: Some(Some(result)),
                            completed_at: Some(Some(Utc::now())),
                            error: Some(None),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            Err(failure) => {
                let exhausted = new_attempts >= max_attempts;
                let terminal = exhausted || failure.kind == FailureKind::NonRetryable;

                if terminal {
                    warn!(
                        job_id = %job_id,
                        job_type = %job.job_type,
                        attempt = new_attempts,
                        error = %failure.message,
                        "job failed terminally"
                    );
                    self.store
                        .update_status(
                            job_id,
                            Some(JobStatus::Processing),
                            JobStatus::Failed,
                            StatusPatch {
                                error: Some(Some(failure.message)),
                                completed_at: Some(Some(Utc::now())),
                                ..Default::default()
                            },
                        )
                        .await?;
                } else {
                    let delay = backoff(pre_increment_attempts as u32, &self.config);
                    let next_retry_at = Utc::now() + delay;
                    warn!(
                        job_id = %job_id,
                        job_type = %job.job_type,
                        attempt = new_attempts,
                        error = %failure.message,
                        retry_in_seconds = delay.num_seconds(),
                        "job failed, scheduling retry"
                    );
                    self.store
                        .update_status(
                            job_id,
                            Some(JobStatus::Processing),
                            JobStatus::Pending,
                            StatusPatch {
                                error: Some(Some(failure.message)),
                                next_retry_at: Some(Some(next_retry_at)),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
            }
        }

        Ok(())
    }
}

impl<S: JobStore> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            cascade: self.cascade.clone(),
            config: self.config,
        }
    }
}
