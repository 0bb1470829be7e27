//! Background job scheduling and execution.
//!
//! Two ways to run work: the [`Scheduler`] claims due rows from the job store and
//! hands them to the [`Executor`] registered under their executor name, while the
//! [`CronRunner`] fires [`PeriodicJob`]s straight from a cron expression on every
//! replica (singleton work such as the ranking job guards itself with a lease).

mod context;
mod cron_runner;
mod job;
pub mod jobs;
mod registry;
mod scheduler;

pub use context::JobContext;
pub use cron_runner::{run_instrumented, CronRunner, PeriodicJob};
pub use job::JobError;
pub use registry::{Executor, ExecutorRegistry, JobFuture};
pub use scheduler::{Scheduler, SchedulerSettings};
