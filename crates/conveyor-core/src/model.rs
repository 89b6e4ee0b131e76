//! The `Job` and `RateWindow` data model.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a job. Terminal states (`Completed`, `Failed`) are
/// absorbing: no operation in this crate transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// The `job_status` Postgres enum's on-the-wire spelling (see
    /// `conveyor-postgres`'s schema module).
    pub fn as_db_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// A durable unit of work.
///
/// `job_type` is an extensible string tag rather than a closed enum: the
/// engine never matches on it directly (that's the handler registry's
/// job), so new types register without touching this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub principal_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A freshly-admitted job: `pending`, zero attempts, no schedule.
    pub fn new(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        principal_id: Uuid,
        priority: i32,
        max_attempts: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            payload,
            status: JobStatus::Pending,
            priority,
            attempts: 0,
            max_attempts,
            next_retry_at: None,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            principal_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// `can_dispatch` from §4.4: pending, and either no schedule or the
    /// schedule has already elapsed.
    pub fn can_dispatch(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.next_retry_at.map(|t| t <= now).unwrap_or(true)
    }
}

/// A one-hour bucket of rate-limit accounting.
///
/// Composite identity is `(principal_id, job_type, window_start)`;
/// `window_start` is always floor-to-hour, never round-to-nearest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateWindow {
    pub principal_id: Uuid,
    pub job_type: String,
    pub window_start: DateTime<Utc>,
    pub count: i64,
}

/// Floor a timestamp to the start of its hour.
pub fn floor_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive()
        .and_hms_opt(t.time().hour(), 0, 0)
        .expect("hour is always in range")
        .and_utc()
}
