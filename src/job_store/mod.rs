//! Persistent job table with optimistic-concurrency ownership.
//!
//! Every transition between `Waiting` and `Running` is a conditional update on the
//! row's `version`, so several schedulers (in this process or others sharing the
//! database) can race for the same job and at most one wins per version.

mod models;
mod schema;
mod sqlite_job_store;

pub use models::{next_cron_time, parse_cron, JobRecord, JobStatus, NewJob};
pub use schema::JOBS_VERSIONED_SCHEMAS;
pub use sqlite_job_store::SqliteJobStore;

use anyhow::Result;
use chrono::{DateTime, Utc};

pub trait JobStore: Send + Sync {
    /// Insert a job, or update executor/config/cron of the job with the same name.
    ///
    /// A newly inserted job starts `Waiting` with `next_run_at` set from its cron
    /// expression. Status and version of an existing job are left untouched,
    /// except that a `Waiting` job whose new cron has no future time is paused.
    fn register(&self, job: &NewJob) -> Result<JobRecord>;

    fn get(&self, id: i64) -> Result<Option<JobRecord>>;

    /// Claim one `Waiting` job whose `next_run_at` has passed.
    ///
    /// Returns `None` when nothing is eligible. The returned record is already
    /// `Running` and carries the version that must be handed back to
    /// [`JobStore::release`].
    fn preempt(&self) -> Result<Option<JobRecord>>;

    /// Return a `Running` job to `Waiting` if it still holds `version`.
    ///
    /// `false` means the job was already released or reassigned.
    fn release(&self, id: i64, version: i64) -> Result<bool>;

    /// Refresh `updated_at` to prove the owner is alive.
    fn heartbeat(&self, id: i64) -> Result<()>;

    fn reschedule(&self, id: i64, next_run_at: DateTime<Utc>) -> Result<()>;

    fn pause(&self, id: i64) -> Result<()>;

    /// Move `Running` jobs whose last heartbeat is older than `older_than` back to
    /// `Waiting`, bumping their version so the stale owner's release is rejected.
    fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<usize>;
}
