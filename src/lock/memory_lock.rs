use super::{Lease, LockError, LockProvider};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug)]
struct HeldEntry {
    token: String,
    expires_at: Instant,
}

type Entries = Arc<Mutex<HashMap<String, HeldEntry>>>;

/// In-process lease provider.
///
/// Only coordinates tasks that share the same instance, which is enough for a
/// single-node deployment and for tests.
#[derive(Clone, Default)]
pub struct MemoryLockProvider {
    entries: Entries,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder token of `key`, if the lease is still live.
    pub async fn holder(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.token.clone())
    }
}

#[async_trait]
impl LockProvider for MemoryLockProvider {
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Arc<dyn Lease>>, LockError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        if let Some(entry) = entries.get(key) {
            if entry.expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4().to_string();
        entries.insert(
            key.to_string(),
            HeldEntry {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );

        Ok(Some(Arc::new(MemoryLease {
            key: key.to_string(),
            token,
            entries: Arc::clone(&self.entries),
        })))
    }
}

struct MemoryLease {
    key: String,
    token: String,
    entries: Entries,
}

#[async_trait]
impl Lease for MemoryLease {
    fn key(&self) -> &str {
        &self.key
    }

    fn token(&self) -> &str {
        &self.token
    }

    async fn renew(&self, ttl: Duration) -> Result<(), LockError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get_mut(&self.key) {
            Some(entry) if entry.token == self.token && entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(())
            }
            _ => Err(LockError::NotHeld),
        }
    }

    async fn release(&self) -> Result<(), LockError> {
        let mut entries = self.entries.lock().await;
        match entries.get(&self.key) {
            Some(entry) if entry.token == self.token => {
                entries.remove(&self.key);
                Ok(())
            }
            _ => Err(LockError::NotHeld),
        }
    }
}
