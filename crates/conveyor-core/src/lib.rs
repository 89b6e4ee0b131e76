//! # conveyor-core
//!
//! A persistent background job engine: jobs are durably enqueued, dispatched
//! to type-specific handlers, retried with exponential backoff, recovered
//! from crashed workers, and rate-limited per principal.
//!
//! This crate is policy-light and storage-agnostic: it owns the [`Job`]
//! model, the [`JobStore`] and [`RateLimiter`] traits a storage backend must
//! implement, and the engine logic (dispatcher, reaper, intake, cascade)
//! that runs on top of them. `conveyor-postgres` supplies the Postgres-backed
//! implementation; `conveyor-testing` supplies an in-memory one for tests.
//!
//! ## Architecture
//!
//! ```text
//! Intake::enqueue ──► RateLimiter::check_and_maybe_admit ──► JobStore::create
//!
//! Intake::status  ──► JobStore::reset_stale (reap)
//!                 ──► JobStore::get
//!                 ──► spawn(Dispatcher::process)  [if eligible, detached]
//!
//! Dispatcher::process ──► JobStore::update_status(pending -> processing, CAS)
//!                      ──► HandlerRegistry::dispatch
//!                              │
//!                              ├─► success ──► JobStore::update_status(-> completed)
//!                              └─► failure ──► JobStore::update_status(-> failed | pending+backoff)
//!
//! Handler ──► Cascade::enqueue_child ──► Intake::enqueue (fire-and-forget)
//! ```
//!
//! ## Key invariants
//!
//! 1. Terminal states (`completed`, `failed`) are absorbing.
//! 2. `attempts <= max_attempts` at all times.
//! 3. The `pending -> processing` transition is a compare-and-set: only one
//!    concurrent poller wins the race to dispatch a given job.
//! 4. The reaper never rolls back `attempts` — a crash costs one retry
//!    budget, by design (anti-livelock).
//! 5. Cascade enqueue failures are logged and swallowed, never propagated
//!    as a failure of the parent job.

mod backoff;
mod cascade;
mod config;
mod dispatcher;
mod error;
mod intake;
mod model;
mod registry;
mod scheduler;
mod store;
#[cfg(test)]
mod testutil;

pub use backoff::backoff;
pub use cascade::{Cascade, CascadeOutcome};
pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{FailureKind, HandlerFailure, IntakeError, StoreError};
pub use intake::{CascadeHandle, Intake};
pub use model::{floor_to_hour, Job, JobStatus, RateWindow};
pub use registry::{HandlerRegistry, SharedRegistry};
pub use scheduler::{spawn_cleanup_loop, spawn_reap_loop};
pub use store::{
    AdmitDecision, CleanupCounts, CleanupOptions, JobStore, ListFilters, QueueStats, RateLimiter,
    StatusPatch,
};

pub use async_trait::async_trait;
