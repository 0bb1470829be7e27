//! Periodic recomputation of the top-N content ranking.
//!
//! Every replica fires the job on the same cron schedule, but only the holder of
//! the ranking lease computes. Leadership is kept across cycles by the guard's
//! renewal loop, so a healthy leader keeps computing and the others keep
//! skipping until it goes away.

use crate::background_jobs::{
    context::JobContext, cron_runner::PeriodicJob, job::JobError, registry::Executor,
};
use crate::job_store::JobRecord;
use crate::lock::LeaseGuard;
use crate::ranking::{BatchRankingService, RankingError};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const RANKING_JOB_NAME: &str = "ranking";

pub struct RankingJob {
    guard: LeaseGuard,
    service: Arc<BatchRankingService>,
    /// Upper bound for a single computation.
    run_timeout: Duration,
    running: Mutex<()>,
}

impl RankingJob {
    pub fn new(guard: LeaseGuard, service: Arc<BatchRankingService>, run_timeout: Duration) -> Self {
        Self {
            guard,
            service,
            run_timeout,
            running: Mutex::new(()),
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.guard.is_leader().await
    }

    /// Give up leadership so another replica can take over right away.
    pub async fn close(&self) {
        self.guard.close().await;
    }

    async fn refresh(&self, ctx: &JobContext) -> Result<(), JobError> {
        let Ok(_running) = self.running.try_lock() else {
            debug!("Previous ranking run still in progress, skipping trigger");
            return Ok(());
        };

        if !self.guard.ensure_leader(&ctx.cancellation_token).await {
            return Ok(());
        }
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let service = Arc::clone(&self.service);
        let deadline = Instant::now() + self.run_timeout;
        let ranking =
            tokio::task::spawn_blocking(move || service.refresh(Utc::now(), Some(deadline)))
                .await
                .map_err(|e| JobError::ExecutionFailed(format!("Ranking task failed: {}", e)))?
                .map_err(|e| match e {
                    RankingError::DeadlineExceeded => JobError::Timeout,
                    other => JobError::ExecutionFailed(other.to_string()),
                })?;

        info!("Ranking refreshed with {} items", ranking.len());
        Ok(())
    }
}

#[async_trait]
impl PeriodicJob for RankingJob {
    fn name(&self) -> &str {
        RANKING_JOB_NAME
    }

    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        self.refresh(ctx).await
    }
}

/// Lets a `[[jobs]]` entry with `executor = "ranking"` drive the same job through
/// the job store instead of the local cron trigger.
#[async_trait]
impl Executor for RankingJob {
    fn name(&self) -> &str {
        RANKING_JOB_NAME
    }

    async fn exec(&self, ctx: &JobContext, _job: &JobRecord) -> Result<(), JobError> {
        self.refresh(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockProvider, MemoryLockProvider, RetryPolicy};
    use crate::ranking::{
        ContentItem, LocalRankingCache, MockContentSource, MockInteractionSource, RankingCache,
        RankingSettings,
    };
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guard(provider: Arc<dyn LockProvider>) -> LeaseGuard {
        LeaseGuard::new(
            provider,
            "lock:cron_job:ranking",
            Duration::from_secs(5),
            RetryPolicy::fixed_interval(Duration::from_millis(10)),
            Duration::from_millis(50),
        )
    }

    fn items() -> Vec<ContentItem> {
        let now = Utc::now();
        (1..=3)
            .map(|id| ContentItem {
                id,
                title: format!("article {id}"),
                updated_at: now,
            })
            .collect()
    }

    fn service(cache: Arc<LocalRankingCache>, expected_pages: usize) -> Arc<BatchRankingService> {
        let mut content = MockContentSource::new();
        content
            .expect_list()
            .times(expected_pages)
            .returning(|_, _, _| Ok(items()));
        let mut interactions = MockInteractionSource::new();
        interactions
            .expect_like_counts()
            .returning(|_, ids| Ok(ids.iter().map(|&id| (id, id * 10)).collect::<HashMap<_, _>>()));

        let settings = RankingSettings {
            top_n: 3,
            batch_size: 10,
            ..RankingSettings::default()
        };
        Arc::new(BatchRankingService::new(
            Arc::new(content),
            Arc::new(interactions),
            cache,
            settings,
        ))
    }

    #[tokio::test]
    async fn test_leader_publishes_ranking() {
        let provider: Arc<dyn LockProvider> = Arc::new(MemoryLockProvider::new());
        let cache = Arc::new(LocalRankingCache::new(Duration::from_secs(60)));
        let job = RankingJob::new(
            guard(provider),
            service(cache.clone(), 1),
            Duration::from_secs(5),
        );

        job.run(&JobContext::default()).await.unwrap();

        assert!(job.is_leader().await);
        let ranking = cache.get().unwrap().unwrap();
        assert_eq!(ranking.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 2, 1]);
        job.close().await;
        assert!(!job.is_leader().await);
    }

    #[tokio::test]
    async fn test_follower_skips_while_other_replica_leads() {
        let provider: Arc<dyn LockProvider> = Arc::new(MemoryLockProvider::new());
        let leader_cache = Arc::new(LocalRankingCache::new(Duration::from_secs(60)));
        let follower_cache = Arc::new(LocalRankingCache::new(Duration::from_secs(60)));
        let leader = RankingJob::new(
            guard(provider.clone()),
            service(leader_cache, 1),
            Duration::from_secs(5),
        );
        let follower = RankingJob::new(
            guard(provider),
            service(follower_cache.clone(), 0),
            Duration::from_secs(5),
        );

        leader.run(&JobContext::default()).await.unwrap();
        follower.run(&JobContext::default()).await.unwrap();

        assert!(!follower.is_leader().await);
        assert!(follower_cache.get().unwrap().is_none());

        // Failover once the leader steps down
        leader.close().await;
        assert!(follower.guard.ensure_leader(&Default::default()).await);
        follower.close().await;
    }

    #[tokio::test]
    async fn test_expired_deadline_maps_to_timeout() {
        let provider: Arc<dyn LockProvider> = Arc::new(MemoryLockProvider::new());
        let cache = Arc::new(LocalRankingCache::new(Duration::from_secs(60)));
        let job = RankingJob::new(guard(provider), service(cache.clone(), 0), Duration::ZERO);

        let result = job.run(&JobContext::default()).await;
        assert!(matches!(result, Err(JobError::Timeout)));
        assert!(cache.get().unwrap().is_none());
        job.close().await;
    }

    struct SlowSource {
        calls: Arc<AtomicUsize>,
    }

    impl crate::ranking::ContentSource for SlowSource {
        fn list(
            &self,
            _offset: usize,
            _limit: usize,
            _as_of: chrono::DateTime<Utc>,
        ) -> anyhow::Result<Vec<ContentItem>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let service = Arc::new(BatchRankingService::new(
            Arc::new(SlowSource {
                calls: calls.clone(),
            }),
            Arc::new(MockInteractionSource::new()),
            Arc::new(LocalRankingCache::new(Duration::from_secs(60))),
            RankingSettings::default(),
        ));
        let provider: Arc<dyn LockProvider> = Arc::new(MemoryLockProvider::new());
        let job = Arc::new(RankingJob::new(
            guard(provider),
            service,
            Duration::from_secs(5),
        ));

        let first = {
            let job = job.clone();
            tokio::spawn(async move { job.run(&JobContext::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        job.run(&JobContext::default()).await.unwrap();

        first.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        job.close().await;
    }

    #[tokio::test]
    async fn test_runs_as_registered_executor() {
        let provider: Arc<dyn LockProvider> = Arc::new(MemoryLockProvider::new());
        let cache = Arc::new(LocalRankingCache::new(Duration::from_secs(60)));
        let job = Arc::new(RankingJob::new(
            guard(provider),
            service(cache.clone(), 1),
            Duration::from_secs(5),
        ));

        let registry = crate::background_jobs::ExecutorRegistry::new();
        registry.register(job.clone());
        assert_eq!(registry.names(), vec![RANKING_JOB_NAME.to_string()]);

        let now = Utc::now();
        let record = JobRecord {
            id: 1,
            name: "ranking-refresh".to_string(),
            executor: RANKING_JOB_NAME.to_string(),
            config: String::new(),
            cron_expression: "0 */3 * * * *".to_string(),
            status: crate::job_store::JobStatus::Running,
            version: 1,
            next_run_at: now,
            updated_at: now,
            created_at: now,
        };
        registry.exec(&JobContext::default(), &record).await.unwrap();
        assert_eq!(cache.get().unwrap().unwrap().len(), 3);
        job.close().await;
    }
}
