//! End-to-end tests for the ranking job
//!
//! Replicas read the same content database, compete for the ranking lease in
//! the shared jobs database and publish through a local cache backed by the
//! shared SQLite cache.

mod common;

use chrono::Duration as ChronoDuration;
use common::{fast_scheduler_settings, wait_until, TestEnv, EVERY_SECOND, RANKING_LOCK_KEY};
use jobrank::background_jobs::jobs::{RankingJob, RANKING_JOB_NAME};
use jobrank::background_jobs::{ExecutorRegistry, JobContext, PeriodicJob, Scheduler};
use jobrank::job_store::{JobStore, NewJob};
use jobrank::lock::{LeaseGuard, RetryPolicy};
use jobrank::ranking::{
    BatchRankingService, LocalRankingCache, RankingCache, RankingSettings, SqliteContentSource,
    SqliteRankingCache, TieredRankingCache,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Replica {
    job: Arc<RankingJob>,
    local: Arc<TieredRankingCache>,
}

fn replica(env: &TestEnv, settings: RankingSettings) -> Replica {
    let content = Arc::new(SqliteContentSource::open(&env.content_db).unwrap());
    let shared = Arc::new(SqliteRankingCache::new(&env.jobs_db, Duration::from_secs(60)).unwrap());
    let cache = Arc::new(TieredRankingCache::new(
        LocalRankingCache::new(Duration::from_secs(3600)),
        shared,
    ));
    let service = Arc::new(BatchRankingService::new(
        content.clone(),
        content,
        cache.clone(),
        settings,
    ));
    let guard = LeaseGuard::new(
        env.open_lock_provider(),
        RANKING_LOCK_KEY,
        Duration::from_secs(10),
        RetryPolicy::fixed_interval(Duration::from_millis(20)),
        Duration::from_millis(100),
    );
    Replica {
        job: Arc::new(RankingJob::new(guard, service, Duration::from_secs(10))),
        local: cache,
    }
}

fn ids(ranking: &[jobrank::ranking::RankedItem]) -> Vec<i64> {
    ranking.iter().map(|item| item.id).collect()
}

#[tokio::test]
async fn test_leader_publishes_ranking_to_shared_cache() {
    let env = TestEnv::new();
    env.seed_content(&[
        (1, ChronoDuration::hours(1), Some(10)),
        (2, ChronoDuration::hours(1), Some(50)),
        (3, ChronoDuration::hours(1), Some(30)),
        // No interaction record, never ranked
        (4, ChronoDuration::hours(1), None),
        // Same likes as 2 but much older, decays below it
        (5, ChronoDuration::days(3), Some(50)),
    ]);

    let settings = RankingSettings {
        top_n: 3,
        batch_size: 2,
        ..RankingSettings::default()
    };
    let leader = replica(&env, settings.clone());
    let follower = replica(&env, settings);

    leader.job.run(&JobContext::default()).await.unwrap();
    follower.job.run(&JobContext::default()).await.unwrap();
    assert!(leader.job.is_leader().await);
    assert!(!follower.job.is_leader().await);

    let reader = SqliteRankingCache::new(&env.jobs_db, Duration::from_secs(60)).unwrap();
    let published = reader.get().unwrap().unwrap();
    assert_eq!(ids(&published), vec![2, 3, 1]);

    // The follower never computed, but reads the leader's result through its
    // shared tier
    assert_eq!(ids(&follower.local.get().unwrap().unwrap()), vec![2, 3, 1]);

    leader.job.close().await;
    follower.job.close().await;
}

#[tokio::test]
async fn test_follower_takes_over_after_leader_closes() {
    let env = TestEnv::new();
    env.seed_content(&[
        (1, ChronoDuration::minutes(5), Some(3)),
        (2, ChronoDuration::minutes(5), Some(7)),
    ]);

    let leader = replica(&env, RankingSettings::default());
    let follower = replica(&env, RankingSettings::default());

    leader.job.run(&JobContext::default()).await.unwrap();
    leader.job.close().await;

    follower.job.run(&JobContext::default()).await.unwrap();
    assert!(follower.job.is_leader().await);
    assert_eq!(ids(&follower.local.get().unwrap().unwrap()), vec![2, 1]);
    follower.job.close().await;
}

#[tokio::test]
async fn test_ranking_runs_through_job_scheduler() {
    let env = TestEnv::new();
    env.seed_content(&[
        (1, ChronoDuration::minutes(1), Some(4)),
        (2, ChronoDuration::minutes(1), Some(2)),
    ]);

    let store = env.open_job_store();
    store
        .register(&NewJob::new("ranking-refresh", RANKING_JOB_NAME, EVERY_SECOND))
        .unwrap();

    let replica = replica(&env, RankingSettings::default());
    let registry = Arc::new(ExecutorRegistry::new());
    registry.register(replica.job.clone());

    let shutdown = CancellationToken::new();
    let scheduler = Scheduler::new(store, registry, fast_scheduler_settings(2));
    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });

    let reader = SqliteRankingCache::new(&env.jobs_db, Duration::from_secs(60)).unwrap();
    let published = wait_until(Duration::from_secs(5), || {
        reader.get().ok().flatten().is_some()
    })
    .await;
    shutdown.cancel();
    handle.await.unwrap();
    replica.job.close().await;

    assert!(published);
    assert_eq!(ids(&reader.get().unwrap().unwrap()), vec![1, 2]);
}
