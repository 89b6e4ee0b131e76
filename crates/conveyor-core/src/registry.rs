//! The handler registry (§4.3): a process-wide map from job-type tag to
//! handler function, populated once at startup and read-only thereafter.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::cascade::Cascade;
use crate::error::HandlerFailure;
use crate::model::Job;

/// Type-erased async handler: takes the job's raw payload, a snapshot of
/// the job row, and the cascade handle it may use to enqueue children
/// (§4.7). Returns the result value or a classified failure.
type BoxedHandler = Box<
    dyn Fn(
            Value,
            Job,
            Arc<dyn Cascade>,
        ) -> Pin<Box<dyn Future<Output = Result<Value, HandlerFailure>> + Send>>
        + Send
        + Sync,
>;

/// Per-type retry budget override; `None` falls back to
/// `Config::default_max_attempts`.
struct Registration {
    handler: BoxedHandler,
    max_attempts: Option<u32>,
}

/// Maps `job_type` strings to handlers. Handlers are arbitrary
/// user-supplied async functions: the engine does not care what they do
/// (network I/O, store reads, nothing), only what they return.
#[derive(Default)]
pub struct HandlerRegistry {
    registrations: HashMap<String, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            registrations: HashMap::new(),
        }
    }

    /// Register a handler for `job_type`. The closure receives the raw
    /// JSON payload (schema validation is the handler's job, not the
    /// engine's — §3), a snapshot of the job row, and a cascade handle
    /// for enqueuing children.
    pub fn register<F, Fut>(&mut self, job_type: impl Into<String>, handler: F)
    where
        F: Fn(Value, Job, Arc<dyn Cascade>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerFailure>> + Send + 'static,
    {
        let boxed: BoxedHandler =
            Box::new(move |payload, job, cascade| Box::pin(handler(payload, job, cascade)));
        self.registrations.insert(
            job_type.into(),
            Registration {
                handler: boxed,
                max_attempts: None,
            },
        );
    }

    /// Register a handler with a type-specific `max_attempts`, overriding
    /// `Config::default_max_attempts` for this job type only.
    pub fn register_with_max_attempts<F, Fut>(
        &mut self,
        job_type: impl Into<String>,
        max_attempts: u32,
        handler: F,
    ) where
        F: Fn(Value, Job, Arc<dyn Cascade>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerFailure>> + Send + 'static,
    {
        let boxed: BoxedHandler =
            Box::new(move |payload, job, cascade| Box::pin(handler(payload, job, cascade)));
        self.registrations.insert(
            job_type.into(),
            Registration {
                handler: boxed,
                max_attempts: Some(max_attempts),
            },
        );
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.registrations.contains_key(job_type)
    }

    /// The retry budget for `job_type`, if a type-specific override was
    /// registered.
    pub fn max_attempts_override(&self, job_type: &str) -> Option<u32> {
        self.registrations.get(job_type).and_then(|r| r.max_attempts)
    }

    /// Invoke the handler registered for `job.job_type`. Returns
    /// `Err(HandlerFailure::permanent(..))` when the type is unknown —
    /// §4.4 step 2: "unknown type is a fatal (non-retryable) error".
    pub async fn dispatch(
        &self,
        job: Job,
        cascade: Arc<dyn Cascade>,
    ) -> Result<Value, HandlerFailure> {
        let registration = self.registrations.get(&job.job_type).ok_or_else(|| {
            HandlerFailure::permanent(format!("unknown job type: {}", job.job_type))
        })?;
        let payload = job.payload.clone();
        (registration.handler)(payload, job, cascade).await
    }
}

/// Thread-safe handle, shared between the dispatcher and anything that
/// spawns it.
pub type SharedRegistry = Arc<HandlerRegistry>;
