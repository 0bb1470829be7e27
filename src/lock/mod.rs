//! Renewable, revocable leases over string keys.
//!
//! A [`LockProvider`] hands out at most one live [`Lease`] per key. Leases carry a
//! TTL and must be renewed before it runs out, otherwise any other caller may take
//! the key over. [`LeaseGuard`] builds leadership election for periodic singleton
//! jobs on top of that.

mod guard;
mod memory_lock;
mod sqlite_lock;

pub use guard::LeaseGuard;
pub use memory_lock::MemoryLockProvider;
pub use sqlite_lock::SqliteLockProvider;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum LockError {
    /// The lease expired or was taken over by another holder.
    #[error("Lease is not held")]
    NotHeld,
    #[error("Timed out acquiring lease")]
    Timeout,
    #[error("Lease acquisition cancelled")]
    Cancelled,
    #[error("Lock backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// How [`LockProvider::acquire`] retries while the key is held elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` retries until cancelled.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn fixed_interval(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A held claim on a key.
#[async_trait]
pub trait Lease: Send + Sync {
    fn key(&self) -> &str;

    /// Opaque value identifying this holder to the provider.
    fn token(&self) -> &str;

    /// Push the expiry `ttl` into the future. Fails with [`LockError::NotHeld`]
    /// if the lease already lapsed or belongs to someone else now.
    async fn renew(&self, ttl: Duration) -> Result<(), LockError>;

    async fn release(&self) -> Result<(), LockError>;
}

#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Single attempt. `None` means another holder owns the key.
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Arc<dyn Lease>>, LockError>;

    /// Retry [`LockProvider::try_acquire`] according to `retry` until the key is
    /// won, attempts run out or `cancel` fires.
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Lease>, LockError> {
        let mut attempts: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled);
            }
            if let Some(lease) = self.try_acquire(key, ttl).await? {
                return Ok(lease);
            }

            attempts += 1;
            if retry.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(LockError::Timeout);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(LockError::Cancelled),
                _ = tokio::time::sleep(retry.interval) => {}
            }
        }
    }
}
