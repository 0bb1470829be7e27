use super::{Lease, LockError, LockProvider, RetryPolicy};
use crate::server::metrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct HeldLease {
    lease: Arc<dyn Lease>,
    generation: u64,
    renew_cancel: CancellationToken,
    renew_task: JoinHandle<()>,
}

type SharedState = Arc<Mutex<Option<HeldLease>>>;

/// Leadership for one lease key, kept alive by a background renewal task.
///
/// The guard starts unlocked. [`LeaseGuard::ensure_leader`] acquires the lease
/// and spawns the renewal loop; if a renewal fails the handle is dropped so the
/// next call competes again. The state mutex is held for the whole acquisition,
/// so concurrent callers on this process never acquire twice.
pub struct LeaseGuard {
    provider: Arc<dyn LockProvider>,
    key: String,
    ttl: Duration,
    retry: RetryPolicy,
    acquire_timeout: Duration,
    state: SharedState,
    next_generation: AtomicU64,
}

impl LeaseGuard {
    pub fn new(
        provider: Arc<dyn LockProvider>,
        key: impl Into<String>,
        ttl: Duration,
        retry: RetryPolicy,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            key: key.into(),
            ttl,
            retry,
            acquire_timeout,
            state: Arc::new(Mutex::new(None)),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Returns `true` if this process holds the lease after the call.
    ///
    /// Losing the race, timing out or a backend error all yield `false`: another
    /// replica is (or may be) the leader for this cycle.
    pub async fn ensure_leader(&self, cancel: &CancellationToken) -> bool {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return true;
        }

        let acquire = self
            .provider
            .acquire(&self.key, self.ttl, &self.retry, cancel);
        let lease = match tokio::time::timeout(self.acquire_timeout, acquire).await {
            Ok(Ok(lease)) => lease,
            Ok(Err(LockError::Cancelled)) => return false,
            Ok(Err(LockError::Timeout)) | Err(_) => {
                debug!("Lease {} is held elsewhere, skipping this cycle", self.key);
                return false;
            }
            Ok(Err(e)) => {
                warn!("Failed to acquire lease {}: {}", self.key, e);
                return false;
            }
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let renew_cancel = CancellationToken::new();
        let renew_task = tokio::spawn(renew_loop(
            Arc::clone(&self.state),
            Arc::clone(&lease),
            generation,
            self.ttl,
            renew_cancel.clone(),
        ));

        *state = Some(HeldLease {
            lease,
            generation,
            renew_cancel,
            renew_task,
        });
        metrics::set_lock_leadership(&self.key, true);
        info!("Acquired leadership on {}", self.key);
        true
    }

    /// Stop renewing and hand the lease back so another replica can take over
    /// without waiting for the TTL.
    pub async fn close(&self) {
        let held = self.state.lock().await.take();
        let Some(held) = held else {
            return;
        };

        held.renew_cancel.cancel();
        let _ = held.renew_task.await;
        metrics::set_lock_leadership(&self.key, false);

        match held.lease.release().await {
            Ok(()) => info!("Released leadership on {}", self.key),
            Err(e) => warn!(
                "Failed to release lease {} on close, it will expire on its own: {}",
                self.key, e
            ),
        }
    }
}

async fn renew_loop(
    state: SharedState,
    lease: Arc<dyn Lease>,
    generation: u64,
    ttl: Duration,
    cancel: CancellationToken,
) {
    let interval = ttl / 2;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        if let Err(e) = lease.renew(ttl).await {
            warn!("Lost leadership on {}: {}", lease.key(), e);
            let mut state = state.lock().await;
            // A newer acquisition may already have replaced us.
            if state.as_ref().map(|held| held.generation) == Some(generation) {
                *state = None;
                metrics::set_lock_leadership(lease.key(), false);
            }
            return;
        }
        debug!("Renewed lease {}", lease.key());
    }
}
