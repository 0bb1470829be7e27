//! Temporary databases and helpers shared by the integration tests.

use chrono::{Duration as ChronoDuration, Utc};
use jobrank::background_jobs::SchedulerSettings;
use jobrank::job_store::SqliteJobStore;
use jobrank::lock::SqliteLockProvider;
use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// One article row for [`TestEnv::seed_content`]: `(id, age, likes)`.
/// `likes = None` leaves the article without an interaction record.
pub type ArticleSeed = (i64, ChronoDuration, Option<i64>);

/// Isolated directory holding a jobs database and a content database.
///
/// Every `open_*` call returns a fresh connection, standing in for another
/// process on the same host.
pub struct TestEnv {
    pub jobs_db: PathBuf,
    pub content_db: PathBuf,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        Self {
            jobs_db: temp_dir.path().join("jobs.db"),
            content_db: temp_dir.path().join("content.db"),
            _temp_dir: temp_dir,
        }
    }

    pub fn open_job_store(&self) -> Arc<SqliteJobStore> {
        Arc::new(SqliteJobStore::new(&self.jobs_db).unwrap())
    }

    pub fn open_lock_provider(&self) -> Arc<SqliteLockProvider> {
        Arc::new(SqliteLockProvider::new(&self.jobs_db).unwrap())
    }

    /// Create the content database with the given articles under the
    /// `article` interaction namespace.
    pub fn seed_content(&self, articles: &[ArticleSeed]) {
        let conn = Connection::open(&self.content_db).unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS published_articles (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS interactions (
                biz TEXT NOT NULL,
                biz_id INTEGER NOT NULL,
                like_cnt INTEGER NOT NULL
            );",
        )
        .unwrap();

        let now = Utc::now();
        for (id, age, likes) in articles {
            conn.execute(
                "INSERT INTO published_articles (id, title, updated_at) VALUES (?1, ?2, ?3)",
                params![id, format!("article {id}"), (now - *age).timestamp_millis()],
            )
            .unwrap();
            if let Some(likes) = likes {
                conn.execute(
                    "INSERT INTO interactions (biz, biz_id, like_cnt) VALUES ('article', ?1, ?2)",
                    params![id, likes],
                )
                .unwrap();
            }
        }
    }
}

/// Scheduler settings with short polls so tests finish quickly.
#[allow(dead_code)]
pub fn fast_scheduler_settings(max_concurrent_jobs: usize) -> SchedulerSettings {
    SchedulerSettings {
        max_concurrent_jobs,
        preempt_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(20),
        poll_jitter: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(50),
        release_timeout: Duration::from_secs(2),
        stale_after: None,
        shutdown_grace: Duration::from_secs(5),
    }
}

/// Poll `condition` every 20ms for up to `timeout`.
#[allow(dead_code)]
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
