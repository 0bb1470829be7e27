//! Distributed periodic-job execution and top-N content ranking.
//!
//! This library exposes the internal modules for the binary and integration tests.

pub mod background_jobs;
pub mod config;
pub mod job_store;
pub mod lock;
pub mod ranking;
pub mod server;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use background_jobs::{CronRunner, ExecutorRegistry, Scheduler, SchedulerSettings};
pub use job_store::{JobStore, SqliteJobStore};
pub use lock::{LeaseGuard, LockProvider};
