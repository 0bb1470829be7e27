use super::{RankedItem, RankingCache};
use crate::job_store::JOBS_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::open_versioned_db;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::warn;

const RANKING_CACHE_KEY: &str = "ranking:top_n";

struct LocalEntry {
    ranking: Vec<RankedItem>,
    stored_at: Instant,
}

/// In-process copy of the latest ranking.
pub struct LocalRankingCache {
    ttl: Duration,
    entry: RwLock<Option<LocalEntry>>,
}

impl LocalRankingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: RwLock::new(None),
        }
    }

    /// Latest ranking regardless of age.
    pub fn force_get(&self) -> Option<Vec<RankedItem>> {
        let entry = self.entry.read().unwrap();
        entry.as_ref().map(|e| e.ranking.clone())
    }
}

impl RankingCache for LocalRankingCache {
    fn set(&self, ranking: &[RankedItem]) -> Result<()> {
        let mut entry = self.entry.write().unwrap();
        *entry = Some(LocalEntry {
            ranking: ranking.to_vec(),
            stored_at: Instant::now(),
        });
        Ok(())
    }

    fn get(&self) -> Result<Option<Vec<RankedItem>>> {
        let entry = self.entry.read().unwrap();
        Ok(entry
            .as_ref()
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .map(|e| e.ranking.clone()))
    }
}

/// Ranking shared between processes through the `ranking_cache` table.
pub struct SqliteRankingCache {
    conn: Arc<Mutex<Connection>>,
    ttl: Duration,
}

impl SqliteRankingCache {
    pub fn new<P: AsRef<Path>>(db_path: P, ttl: Duration) -> Result<Self> {
        let conn = open_versioned_db(db_path.as_ref(), JOBS_VERSIONED_SCHEMAS, "jobs")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl,
        })
    }
}

impl RankingCache for SqliteRankingCache {
    fn set(&self, ranking: &[RankedItem]) -> Result<()> {
        let payload = serde_json::to_string(ranking).context("Failed to serialize ranking")?;
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = Utc::now().timestamp_millis().saturating_add(ttl_ms);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ranking_cache (cache_key, payload, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(cache_key) DO UPDATE SET
                payload = excluded.payload,
                expires_at = excluded.expires_at",
            params![RANKING_CACHE_KEY, payload, expires_at],
        )?;
        Ok(())
    }

    fn get(&self) -> Result<Option<Vec<RankedItem>>> {
        let conn = self.conn.lock().unwrap();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM ranking_cache WHERE cache_key = ?1 AND expires_at > ?2",
                params![RANKING_CACHE_KEY, Utc::now().timestamp_millis()],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|p| serde_json::from_str(&p).context("Corrupted ranking cache payload"))
            .transpose()
    }
}

/// Local cache in front of a shared one.
///
/// Writes go to both. Reads prefer the local copy, then the shared one (which
/// warms the local copy), and fall back to a stale local copy when the shared
/// cache is empty or unreachable.
pub struct TieredRankingCache {
    local: LocalRankingCache,
    shared: Arc<dyn RankingCache>,
}

impl TieredRankingCache {
    pub fn new(local: LocalRankingCache, shared: Arc<dyn RankingCache>) -> Self {
        Self { local, shared }
    }
}

impl RankingCache for TieredRankingCache {
    fn set(&self, ranking: &[RankedItem]) -> Result<()> {
        self.local.set(ranking)?;
        self.shared.set(ranking)
    }

    fn get(&self) -> Result<Option<Vec<RankedItem>>> {
        if let Some(ranking) = self.local.get()? {
            return Ok(Some(ranking));
        }

        match self.shared.get() {
            Ok(Some(ranking)) => {
                self.local.set(&ranking)?;
                Ok(Some(ranking))
            }
            Ok(None) => Ok(self.local.force_get()),
            Err(e) => match self.local.force_get() {
                Some(stale) => {
                    warn!("Shared ranking cache unavailable, serving stale copy: {}", e);
                    Ok(Some(stale))
                }
                None => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    fn ranking(ids: &[i64]) -> Vec<RankedItem> {
        ids.iter()
            .map(|&id| RankedItem {
                id,
                title: format!("title {id}"),
                updated_at: Utc::now(),
                likes: id,
                score: id as f64,
            })
            .collect()
    }

    struct BrokenCache;

    impl RankingCache for BrokenCache {
        fn set(&self, _ranking: &[RankedItem]) -> Result<()> {
            anyhow::bail!("shared cache down")
        }

        fn get(&self) -> Result<Option<Vec<RankedItem>>> {
            anyhow::bail!("shared cache down")
        }
    }

    #[test]
    fn test_local_cache_expires_but_force_get_does_not() {
        let cache = LocalRankingCache::new(Duration::from_millis(20));
        cache.set(&ranking(&[1, 2])).unwrap();
        assert_eq!(cache.get().unwrap().map(|r| r.len()), Some(2));

        thread::sleep(Duration::from_millis(40));
        assert!(cache.get().unwrap().is_none());
        assert_eq!(cache.force_get().map(|r| r.len()), Some(2));
    }

    #[test]
    fn test_sqlite_cache_shared_between_connections() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("jobs.db");
        let writer = SqliteRankingCache::new(&db_path, Duration::from_secs(60)).unwrap();
        let reader = SqliteRankingCache::new(&db_path, Duration::from_secs(60)).unwrap();

        assert!(reader.get().unwrap().is_none());
        writer.set(&ranking(&[3, 2, 1])).unwrap();

        let read = reader.get().unwrap().unwrap();
        assert_eq!(read.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 2, 1]);

        // Overwrites the previous snapshot
        writer.set(&ranking(&[7])).unwrap();
        assert_eq!(reader.get().unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_sqlite_cache_expires() {
        let temp_dir = TempDir::new().unwrap();
        let cache =
            SqliteRankingCache::new(temp_dir.path().join("jobs.db"), Duration::from_millis(20))
                .unwrap();
        cache.set(&ranking(&[1])).unwrap();
        thread::sleep(Duration::from_millis(40));
        assert!(cache.get().unwrap().is_none());
    }

    #[test]
    fn test_tiered_cache_warms_local_from_shared() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("jobs.db");
        let shared = Arc::new(SqliteRankingCache::new(&db_path, Duration::from_secs(60)).unwrap());
        shared.set(&ranking(&[5, 4])).unwrap();

        let tiered =
            TieredRankingCache::new(LocalRankingCache::new(Duration::from_secs(60)), shared);
        assert_eq!(tiered.get().unwrap().unwrap().len(), 2);
        assert_eq!(tiered.local.get().unwrap().unwrap().len(), 2);
    }

    #[test]
    fn test_tiered_cache_serves_stale_local_when_shared_fails() {
        let tiered = TieredRankingCache::new(
            LocalRankingCache::new(Duration::from_millis(10)),
            Arc::new(BrokenCache),
        );
        // Local write succeeds before the shared write fails
        assert!(tiered.set(&ranking(&[1, 2, 3])).is_err());
        thread::sleep(Duration::from_millis(20));

        let served = tiered.get().unwrap().unwrap();
        assert_eq!(served.len(), 3);
    }

    #[test]
    fn test_tiered_cache_propagates_error_without_local_copy() {
        let tiered = TieredRankingCache::new(
            LocalRankingCache::new(Duration::from_secs(60)),
            Arc::new(BrokenCache),
        );
        assert!(tiered.get().is_err());
    }
}
