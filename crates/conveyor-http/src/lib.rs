//! Axum HTTP edge over the intake API (§4.6 / §6). This crate wires
//! `Intake<S, R>` to four routes; it does not itself know whether `S`/`R`
//! are backed by Postgres or an in-memory double, so the same router
//! works in `conveyor-http`'s own tests (against `conveyor-testing`) and
//! in `conveyor-postgres`'s production binary.
//!
//! Authentication is explicitly out of scope (§5 Non-goals): the
//! `X-Principal-Id` header stands in for whatever identity layer a real
//! deployment puts in front of this service.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use conveyor_core::{Intake, IntakeError, Job, JobStatus, JobStore, ListFilters, RateLimiter};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Shared state handed to every handler. Cloning is cheap: `Intake` holds
/// only `Arc`s and a `Copy` config internally.
pub struct AppState<S: JobStore, R: RateLimiter> {
    pub intake: Intake<S, R>,
}

/// Build the four-route router described in §6. `state` is wrapped in an
/// `Arc` once here; axum clones the `Arc`, never the state itself.
pub fn router<S, R>(state: AppState<S, R>) -> Router
where
    S: JobStore + 'static,
    R: RateLimiter + 'static,
{
    Router::new()
        .route("/jobs", post(enqueue_job).get(list_jobs))
        .route("/jobs/:id", get(get_job).post(retry_job))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Pull the caller's principal out of `X-Principal-Id`. Missing or
/// malformed header is `IntakeError::Unauthorized`, same as the source's
/// stand-in auth middleware would report.
fn principal_from_headers(headers: &HeaderMap) -> Result<Uuid, IntakeError> {
    headers
        .get("x-principal-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or(IntakeError::Unauthorized)
}

#[derive(Debug, Serialize)]
struct JobResponse {
    job: Job,
}

#[derive(Debug, Serialize)]
struct JobListResponse {
    jobs: Vec<Job>,
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    #[serde(rename = "type")]
    job_type: String,
    payload: serde_json::Value,
    #[serde(default)]
    priority: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    #[serde(rename = "type")]
    job_type: Option<String>,
    status: Option<String>,
    limit: Option<u32>,
}

/// The `{error, code, retry_after?}` envelope from §6.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        let (status, code, retry_after) = match &self {
            IntakeError::Unauthorized => (StatusCode::UNAUTHORIZED, "AUTH_REQUIRED", None),
            IntakeError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", None),
            IntakeError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", None),
            IntakeError::InvalidState => (StatusCode::BAD_REQUEST, "INVALID_STATE", None),
            IntakeError::RateLimited {
                retry_after_seconds,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                Some(*retry_after_seconds),
            ),
            IntakeError::Internal(e) => {
                tracing::error!(error = %e, "intake operation failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", None)
            }
        };
        let body = Json(ErrorResponse {
            error: self.to_string(),
            code,
            retry_after,
        });
        (status, body).into_response()
    }
}

/// `POST /jobs` — §6 row 1.
async fn enqueue_job<S, R>(
    State(state): State<Arc<AppState<S, R>>>,
    headers: HeaderMap,
    Json(req): Json<EnqueueRequest>,
) -> Result<Response, IntakeError>
where
    S: JobStore + 'static,
    R: RateLimiter + 'static,
{
    let principal = principal_from_headers(&headers)?;
    let job = state
        .intake
        .enqueue(principal, &req.job_type, req.payload, req.priority)
        .await?;
    Ok((StatusCode::CREATED, Json(JobResponse { job })).into_response())
}

/// `GET /jobs` — §6 row 2.
async fn list_jobs<S, R>(
    State(state): State<Arc<AppState<S, R>>>,
    headers: HeaderMap,
    Query(q): Query<ListQuery>,
) -> Result<Response, IntakeError>
where
    S: JobStore + 'static,
    R: RateLimiter + 'static,
{
    let principal = principal_from_headers(&headers)?;
    let status = match q.status {
        Some(s) => Some(
            JobStatus::from_db_str(&s)
                .ok_or_else(|| IntakeError::Validation(format!("unknown status: {s}")))?,
        ),
        None => None,
    };
    let filters = ListFilters {
        job_type: q.job_type,
        status,
        limit: q.limit.unwrap_or(0),
    };
    let jobs = state.intake.list(principal, filters).await?;
    Ok((StatusCode::OK, Json(JobListResponse { jobs })).into_response())
}

/// `GET /jobs/{id}` — §6 row 3. May trigger a background dispatch as a
/// side effect of `Intake::status`.
async fn get_job<S, R>(
    State(state): State<Arc<AppState<S, R>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, IntakeError>
where
    S: JobStore + 'static,
    R: RateLimiter + 'static,
{
    let principal = principal_from_headers(&headers)?;
    let job = state.intake.status(principal, id).await?;
    Ok((StatusCode::OK, Json(JobResponse { job })).into_response())
}

/// `POST /jobs/{id}` — §6 row 4: re-enqueue a failed job.
async fn retry_job<S, R>(
    State(state): State<Arc<AppState<S, R>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, IntakeError>
where
    S: JobStore + 'static,
    R: RateLimiter + 'static,
{
    let principal = principal_from_headers(&headers)?;
    let job = state.intake.retry(principal, id).await?;
    Ok((StatusCode::CREATED, Json(JobResponse { job })).into_response())
}
