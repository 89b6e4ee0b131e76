//! Minimal end-to-end run of the job engine against the in-memory store:
//! register two handlers, enqueue a few jobs, and poll until they settle.

use std::sync::Arc;
use std::time::Duration;

use conveyor_core::{Cascade, Config, HandlerFailure, HandlerRegistry, Intake, Job, JobStatus};
use conveyor_testing::{InMemoryJobStore, InMemoryRateLimiter};
use uuid::Uuid;

async fn greeting(
    payload: serde_json::Value,
    _job: Job,
    _cascade: Arc<dyn Cascade>,
) -> Result<serde_json::Value, HandlerFailure> {
    let name = payload
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("world");
    Ok(serde_json::json!({ "greeting": format!("hello, {name}") }))
}

/// Fails on its first attempt and succeeds on every later one, to show
/// the backoff-and-retry path rather than only the happy path.
async fn flaky_once(
    payload: serde_json::Value,
    job: Job,
    _cascade: Arc<dyn Cascade>,
) -> Result<serde_json::Value, HandlerFailure> {
    if job.attempts == 0 {
        return Err(HandlerFailure::retryable("simulated transient failure"));
    }
    Ok(payload)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::default();
    let store = Arc::new(InMemoryJobStore::new());
    let rate_limiter = Arc::new(InMemoryRateLimiter::from_config(&config));

    let mut registry = HandlerRegistry::new();
    registry.register("greeting", greeting);
    registry.register("flaky_once", flaky_once);
    let registry = Arc::new(registry);

    let intake = Intake::new(store, rate_limiter, registry, config);

    let principal = Uuid::new_v4();
    let greeting_job = intake
        .enqueue(principal, "greeting", serde_json::json!({"name": "conveyor"}), None)
        .await?;
    let flaky_job = intake
        .enqueue(principal, "flaky_once", serde_json::json!({"attempt": 1}), None)
        .await?;

    tracing::info!(job_id = %greeting_job.id, "enqueued greeting job");
    tracing::info!(job_id = %flaky_job.id, "enqueued flaky job");

    // `status` triggers dispatch as a side effect when a job is eligible;
    // poll both jobs until they reach a terminal state.
    for job_id in [greeting_job.id, flaky_job.id] {
        loop {
            let job = intake.status(principal, job_id).await?;
            if job.status == JobStatus::Completed || job.status == JobStatus::Failed {
                tracing::info!(job_id = %job.id, status = ?job.status, result = ?job.result, "job settled");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    Ok(())
}
