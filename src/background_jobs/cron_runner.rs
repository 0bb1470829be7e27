use super::context::JobContext;
use super::job::JobError;
use crate::job_store::parse_cron;
use crate::server::metrics;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

/// A job fired directly by a cron expression on every replica.
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &JobContext) -> Result<(), JobError>;
}

/// Drives [`PeriodicJob`]s at their cron times and records how each run went.
///
/// Runs of the same job never overlap: the next fire time is computed only
/// after the previous run returned. Errors are logged and counted, never
/// propagated.
#[derive(Default)]
pub struct CronRunner {
    entries: Vec<(String, Schedule, Arc<dyn PeriodicJob>)>,
}

impl CronRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, cron_expression: &str, job: Arc<dyn PeriodicJob>) -> Result<()> {
        let schedule = parse_cron(cron_expression).with_context(|| {
            format!(
                "Invalid cron expression '{}' for {}",
                cron_expression,
                job.name()
            )
        })?;
        self.entries
            .push((cron_expression.to_string(), schedule, job));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        for (expression, schedule, job) in self.entries {
            info!("Scheduling {} with cron '{}'", job.name(), expression);
            tracker.spawn(drive(schedule, job, shutdown.clone()));
        }
        tracker.close();
        tracker.wait().await;
    }
}

async fn drive(schedule: Schedule, job: Arc<dyn PeriodicJob>, shutdown: CancellationToken) {
    loop {
        let Some(next) = schedule.after(&Utc::now()).next() else {
            info!("Cron schedule of {} has no future fire time", job.name());
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let ctx = JobContext::new(shutdown.child_token());
        run_instrumented(job.as_ref(), &ctx).await;
    }
}

/// Run `job` once, recording duration and outcome. Returns whether it succeeded.
pub async fn run_instrumented(job: &dyn PeriodicJob, ctx: &JobContext) -> bool {
    let start_time = Instant::now();
    let result = job.run(ctx).await;
    let elapsed = start_time.elapsed();

    metrics::record_cron_job(job.name(), result.is_ok(), elapsed);
    match result {
        Ok(()) => {
            info!("Cron job {} finished in {:?}", job.name(), elapsed);
            true
        }
        Err(e) => {
            error!("Cron job {} failed after {:?}: {}", job.name(), elapsed, e);
            false
        }
    }
}
