//! Periodic background loops for the stale-lease reaper (§4.5) and GC
//! (§4.8). Both are also triggered opportunistically elsewhere (reap on
//! every status poll; cleanup on demand), but §9 notes implementations
//! SHOULD run them on a schedule too so an engine with no poll traffic
//! doesn't accumulate stale leases or unbounded rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::store::{CleanupOptions, JobStore};

/// Spawn a task that calls `reset_stale` on a fixed interval.
pub fn spawn_reap_loop<S: JobStore + 'static>(
    store: Arc<S>,
    lease_timeout: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - chrono::Duration::from_std(lease_timeout).unwrap();
            match store.reset_stale(cutoff).await {
                Ok(0) => {}
                Ok(n) => info!(reset = n, "scheduled reap reset stale jobs"),
                Err(e) => warn!(error = %e, "scheduled reap failed"),
            }
        }
    })
}

/// Spawn a task that calls `cleanup` on a fixed interval.
pub fn spawn_cleanup_loop<S: JobStore + 'static>(
    store: Arc<S>,
    options: CleanupOptions,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match store.cleanup(options).await {
                Ok(counts) => info!(
                    completed_deleted = counts.completed_deleted,
                    failed_deleted = counts.failed_deleted,
                    windows_deleted = counts.windows_deleted,
                    "scheduled cleanup ran"
                ),
                Err(e) => warn!(error = %e, "scheduled cleanup failed"),
            }
        }
    })
}
