//! The cascade coordinator (§4.7): the capability handed to a running
//! handler so it can enqueue child jobs without being handed the full
//! intake surface (no `list`, no `retry`, no reading other principals'
//! jobs).

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::model::Job;

/// What happened when a handler tried to enqueue a child job.
///
/// Deliberately not a `Result`: cascade enqueues are fire-and-forget by
/// design (§4.7) — a denial is logged and skipped, never propagated as a
/// failure of the parent job. Giving handlers an `Err` to (mis)propagate
/// would invite accidentally failing an otherwise-successful parent.
#[derive(Debug, Clone)]
pub enum CascadeOutcome {
    Enqueued(Job),
    RateLimited { retry_after_seconds: u64 },
    Rejected(String),
}

/// Capability for enqueuing child jobs from inside a handler.
#[async_trait]
pub trait Cascade: Send + Sync {
    /// Enqueue one child job of `job_type` under the same principal as
    /// the parent. Logged and swallowed on denial; never fails the
    /// caller.
    async fn enqueue_child(
        &self,
        principal: Uuid,
        job_type: &str,
        payload: Value,
        priority: i32,
    ) -> CascadeOutcome;
}
