use super::{Lease, LockError, LockProvider};
use crate::job_store::JOBS_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::open_versioned_db;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Lease provider backed by the `leases` table of the jobs database.
///
/// Every process that opens the same file competes for the same keys. Expiry is
/// judged against wall-clock milliseconds, so hosts sharing the file need
/// reasonably synchronized clocks.
#[derive(Clone)]
pub struct SqliteLockProvider {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLockProvider {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned_db(db_path.as_ref(), JOBS_VERSIONED_SCHEMAS, "jobs")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

async fn run_blocking<T, F>(conn: &Arc<Mutex<Connection>>, f: F) -> Result<T, LockError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let conn = conn.lock().unwrap();
        f(&conn)
    })
    .await
    .map_err(|e| LockError::Backend(anyhow!("Lease task failed: {}", e)))?
    .map_err(|e| LockError::Backend(e.into()))
}

#[async_trait]
impl LockProvider for SqliteLockProvider {
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Arc<dyn Lease>>, LockError> {
        let token = Uuid::new_v4().to_string();
        let owned_key = key.to_string();
        let owned_token = token.clone();
        let ttl_ms = ttl_millis(ttl);

        // Takes over the row only when the current holder has expired.
        let changed = run_blocking(&self.conn, move |conn| {
            let now = Utc::now().timestamp_millis();
            conn.execute(
                "INSERT INTO leases (lease_key, token, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(lease_key) DO UPDATE SET
                    token = excluded.token,
                    expires_at = excluded.expires_at
                 WHERE leases.expires_at <= ?4",
                params![owned_key, owned_token, now.saturating_add(ttl_ms), now],
            )
        })
        .await?;

        if changed == 0 {
            return Ok(None);
        }

        Ok(Some(Arc::new(SqliteLease {
            key: key.to_string(),
            token,
            conn: Arc::clone(&self.conn),
        })))
    }
}

struct SqliteLease {
    key: String,
    token: String,
    conn: Arc<Mutex<Connection>>,
}

#[async_trait]
impl Lease for SqliteLease {
    fn key(&self) -> &str {
        &self.key
    }

    fn token(&self) -> &str {
        &self.token
    }

    async fn renew(&self, ttl: Duration) -> Result<(), LockError> {
        let key = self.key.clone();
        let token = self.token.clone();
        let ttl_ms = ttl_millis(ttl);
        let changed = run_blocking(&self.conn, move |conn| {
            let now = Utc::now().timestamp_millis();
            conn.execute(
                "UPDATE leases SET expires_at = ?1
                 WHERE lease_key = ?2 AND token = ?3 AND expires_at > ?4",
                params![now.saturating_add(ttl_ms), key, token, now],
            )
        })
        .await?;

        if changed == 0 {
            return Err(LockError::NotHeld);
        }
        Ok(())
    }

    async fn release(&self) -> Result<(), LockError> {
        let key = self.key.clone();
        let token = self.token.clone();
        let changed = run_blocking(&self.conn, move |conn| {
            conn.execute(
                "DELETE FROM leases WHERE lease_key = ?1 AND token = ?2",
                params![key, token],
            )
        })
        .await?;

        if changed == 0 {
            return Err(LockError::NotHeld);
        }
        Ok(())
    }
}
