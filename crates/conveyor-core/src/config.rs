//! Tunables for the job engine.
//!
//! Every constant named in the engine's external interface section has a
//! field here; `Config::default()` reproduces those defaults exactly.
//! Edges (e.g. `conveyor-http`) load overrides from the environment and
//! build a `Config` once at startup.

use std::time::Duration;

/// Engine-wide tunables. Cheap to clone; pass by value or behind an `Arc`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// Per-`(principal, job_type, window)` admission ceiling.
    pub rate_max: u32,
    /// Width of a rate-limit window.
    pub window_size: Duration,
    /// How long a `processing` job may hold its lease before the reaper
    /// considers it abandoned.
    pub lease_timeout: Duration,
    /// Retry budget for jobs that don't specify their own.
    pub default_max_attempts: u32,
    /// Base of the exponential backoff curve, in seconds.
    pub backoff_base_seconds: u64,
    /// Upper clip on `backoff(n)`, so a large retry budget can't starve
    /// other jobs behind a multi-hour `next_retry_at`.
    pub backoff_max_seconds: u64,
    /// Retention window for `completed` jobs before GC deletes them.
    pub completed_retention: Duration,
    /// Retention window for `failed` jobs before GC deletes them.
    pub failed_retention: Duration,
    /// Retention window for rate-limit windows before GC deletes them.
    pub window_retention: Duration,
    /// Hard cap on `list`'s caller-supplied limit.
    pub max_list_limit: u32,
    /// `list`'s limit when the caller doesn't supply one.
    pub default_list_limit: u32,
    /// Default GC batch size.
    pub default_gc_batch: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rate_max: 20,
            window_size: Duration::from_secs(3600),
            lease_timeout: Duration::from_secs(5 * 60),
            default_max_attempts: 3,
            backoff_base_seconds: 1,
            backoff_max_seconds: 300,
            completed_retention: Duration::from_secs(24 * 3600),
            failed_retention: Duration::from_secs(72 * 3600),
            window_retention: Duration::from_secs(2 * 3600),
            max_list_limit: 100,
            default_list_limit: 20,
            default_gc_batch: 1000,
        }
    }
}
