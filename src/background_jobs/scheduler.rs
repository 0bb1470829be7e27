use super::context::JobContext;
use super::job::JobError;
use super::registry::ExecutorRegistry;
use crate::job_store::{JobRecord, JobStore};
use crate::server::metrics;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Upper bound on job bodies running at the same time.
    pub max_concurrent_jobs: usize,
    pub preempt_timeout: Duration,
    /// Pause after a preempt that found nothing (or failed).
    pub poll_interval: Duration,
    /// Random extra pause so idle replicas do not poll in lockstep.
    pub poll_jitter: Duration,
    pub heartbeat_interval: Duration,
    /// Bound on the post-run reschedule and release calls.
    pub release_timeout: Duration,
    /// Running jobs without a heartbeat for this long go back to waiting.
    /// `None` disables reclaiming.
    pub stale_after: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 200,
            preempt_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::from_millis(250),
            heartbeat_interval: Duration::from_secs(10),
            release_timeout: Duration::from_secs(1),
            stale_after: Some(Duration::from_secs(60)),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Claims due jobs from the store and runs them on their executors.
///
/// One admission permit is taken before every preempt and held until the job
/// body returns, so at most `max_concurrent_jobs` bodies run at once no matter
/// how many jobs are due.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    registry: Arc<ExecutorRegistry>,
    limiter: Arc<Semaphore>,
    settings: SchedulerSettings,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<ExecutorRegistry>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            registry,
            limiter: Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1))),
            settings,
            tracker: TaskTracker::new(),
        }
    }

    /// Main scheduler loop. Returns once `shutdown` fires and in-flight jobs
    /// finished or the shutdown grace period ran out.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Starting job scheduler with {} execution slots and executors {:?}",
            self.settings.max_concurrent_jobs,
            self.registry.names()
        );

        // Independent of admission slots
        let mut reclaim_timer = self
            .settings
            .stale_after
            .filter(|period| !period.is_zero())
            .map(|period| {
                let mut timer = tokio::time::interval(period);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                timer
            });
        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = next_reclaim_tick(&mut reclaim_timer) => {
                    self.reclaim_stale_jobs().await;
                    continue;
                }
                permit = Arc::clone(&self.limiter).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.preempt().await {
                Some(job) => self.dispatch(job, permit, &shutdown),
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.idle_delay()) => {}
                    }
                }
            }
        }

        info!("Scheduler received shutdown signal");
        self.shutdown().await;
    }

    fn idle_delay(&self) -> Duration {
        let jitter_ms = self.settings.poll_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        self.settings.poll_interval + jitter
    }

    async fn reclaim_stale_jobs(&self) {
        let Some(stale_after) = self.settings.stale_after else {
            return;
        };
        let cutoff = Utc::now() - chrono::Duration::from_std(stale_after).unwrap_or_default();
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.reclaim_stale(cutoff)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(count)) => warn!("Reclaimed {} running jobs with stale heartbeats", count),
            Ok(Err(e)) => error!("Failed to reclaim stale jobs: {}", e),
            Err(e) => error!("Stale job reclaim task failed: {}", e),
        }
    }

    /// One bounded preempt attempt.
    async fn preempt(&self) -> Option<JobRecord> {
        let store = Arc::clone(&self.store);
        let mut attempt = tokio::task::spawn_blocking(move || store.preempt());

        let outcome = tokio::time::timeout(self.settings.preempt_timeout, &mut attempt).await;
        match outcome {
            Ok(Ok(Ok(Some(job)))) => {
                metrics::record_preempt("acquired");
                Some(job)
            }
            Ok(Ok(Ok(None))) => {
                metrics::record_preempt("empty");
                None
            }
            Ok(Ok(Err(e))) => {
                metrics::record_preempt("error");
                error!("Failed to preempt job: {}", e);
                None
            }
            Ok(Err(e)) => {
                metrics::record_preempt("error");
                error!("Preempt task failed: {}", e);
                None
            }
            Err(_) => {
                metrics::record_preempt("timeout");
                warn!(
                    "Preempt did not finish within {:?}",
                    self.settings.preempt_timeout
                );
                // The blocking call cannot be interrupted; hand back anything it
                // still manages to claim.
                let store = Arc::clone(&self.store);
                self.tracker.spawn(async move {
                    if let Ok(Ok(Some(job))) = attempt.await {
                        let (id, version) = (job.id, job.version);
                        match tokio::task::spawn_blocking(move || store.release(id, version)).await
                        {
                            Ok(Ok(_)) => info!("Released job {} claimed after preempt timeout", id),
                            Ok(Err(e)) => error!("Failed to release late-claimed job {}: {}", id, e),
                            Err(e) => error!("Release task for job {} failed: {}", id, e),
                        }
                    }
                });
                None
            }
        }
    }

    fn dispatch(&self, job: JobRecord, permit: OwnedSemaphorePermit, shutdown: &CancellationToken) {
        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let release_timeout = self.settings.release_timeout;

        info!(
            "Starting job {} ({}) on executor {} (version {})",
            job.id, job.name, job.executor, job.version
        );

        let heartbeat_interval = self.settings.heartbeat_interval;
        let ctx = JobContext::new(shutdown.child_token());

        self.tracker.spawn(async move {
            metrics::job_started();
            let heartbeat_stop = CancellationToken::new();
            let heartbeat = tokio::spawn(heartbeat_loop(
                Arc::clone(&store),
                job.id,
                heartbeat_interval,
                heartbeat_stop.clone(),
            ));

            let start_time = Instant::now();
            let body_job = job.clone();
            let result = tokio::spawn(async move { registry.exec(&ctx, &body_job).await }).await;
            let elapsed = start_time.elapsed();

            drop(permit);
            metrics::job_finished();
            heartbeat_stop.cancel();
            let _ = heartbeat.await;

            let status_label = match result {
                Ok(Ok(())) => {
                    info!("Job {} ({}) completed in {:?}", job.id, job.name, elapsed);
                    "success"
                }
                Ok(Err(JobError::NotFound)) => {
                    error!(
                        "No executor '{}' registered for job {} ({}), skipping this run",
                        job.executor, job.id, job.name
                    );
                    "unregistered"
                }
                Ok(Err(JobError::Cancelled)) => {
                    info!("Job {} ({}) was cancelled after {:?}", job.id, job.name, elapsed);
                    "cancelled"
                }
                Ok(Err(e)) => {
                    error!("Job {} ({}) failed after {:?}: {}", job.id, job.name, elapsed, e);
                    "failed"
                }
                Err(e) => {
                    error!("Job {} ({}) panicked after {:?}: {}", job.id, job.name, elapsed, e);
                    "panic"
                }
            };
            metrics::record_job_execution(&job.executor, status_label, elapsed);

            finish_run(store, job, release_timeout).await;
        });
    }

    async fn shutdown(&self) {
        self.tracker.close();
        if !self.tracker.is_empty() {
            info!("Waiting for {} in-flight jobs to finish", self.tracker.len());
        }
        if tokio::time::timeout(self.settings.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "{} jobs still running after {:?}, leaving them to be reclaimed",
                self.tracker.len(),
                self.settings.shutdown_grace
            );
        }
        info!("Job scheduler stopped");
    }
}

async fn heartbeat_loop(
    store: Arc<dyn JobStore>,
    job_id: i64,
    interval: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let store = Arc::clone(&store);
        match tokio::task::spawn_blocking(move || store.heartbeat(job_id)).await {
            Ok(Ok(())) => debug!("Heartbeat for job {}", job_id),
            Ok(Err(e)) => warn!("Heartbeat for job {} failed: {}", job_id, e),
            Err(e) => warn!("Heartbeat task for job {} failed: {}", job_id, e),
        }
    }
}

async fn next_reclaim_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Post-run bookkeeping: move the job to its next cron time and hand it back,
/// or pause it for good when the schedule has no future time.
///
/// Rescheduling happens before the release so the job is never `Waiting` with
/// a `next_run_at` that is already due. The release is attempted even when the
/// reschedule or pause fails, otherwise the row would stay `Running` with no
/// heartbeat until reclaimed.
async fn finish_run(store: Arc<dyn JobStore>, job: JobRecord, release_timeout: Duration) {
    let (id, name) = (job.id, job.name.clone());
    let bookkeeping = tokio::task::spawn_blocking(move || {
        match job.next_run_after(Utc::now()) {
            Some(next_run_at) => {
                if let Err(e) = store.reschedule(job.id, next_run_at) {
                    error!("Failed to reschedule job {} ({}): {}", job.id, job.name, e);
                }
            }
            None => match store.pause(job.id) {
                Ok(()) => {
                    info!("Job {} ({}) has no future run, paused", job.id, job.name);
                    return;
                }
                Err(e) => error!("Failed to pause job {} ({}): {}", job.id, job.name, e),
            },
        }

        match store.release(job.id, job.version) {
            Ok(true) => debug!("Released job {} ({})", job.id, job.name),
            Ok(false) => info!(
                "Job {} ({}) was already released or reassigned",
                job.id, job.name
            ),
            Err(e) => error!("Failed to release job {} ({}): {}", job.id, job.name, e),
        }
    });

    match tokio::time::timeout(release_timeout, bookkeeping).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Release task for job {} ({}) failed: {}", id, name, e),
        Err(_) => warn!(
            "Releasing job {} ({}) took longer than {:?}",
            id, name, release_timeout
        ),
    }
}
