//! Advisory locks over the `locks` table.
//!
//! A lock is a row holding an owner token and a lease expiry. Acquisition
//! polls until the row is free or expired; release runs from the guard's
//! `Drop`, so it happens on normal return, early `?` return, panic unwind and
//! future cancellation alike. A holder that crashes stops blocking others
//! once its lease runs out.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::store::StateStore;

/// Lease length for a freshly acquired lock.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Hands out advisory locks. Cloning shares the owner prefix.
#[derive(Clone)]
pub struct LockManager {
    store: StateStore,
    owner: String,
    ttl: Duration,
    acquisitions: Arc<AtomicU64>,
}

impl LockManager {
    pub fn new(store: StateStore) -> Self {
        let id = NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            store,
            owner: format!("{}-{}", std::process::id(), id),
            ttl: DEFAULT_LOCK_TTL,
            acquisitions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Override the lease length.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn next_token(&self) -> String {
        let n = self.acquisitions.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}", self.owner, n)
    }

    /// Take `key` if it is free right now.
    pub fn try_acquire(&self, key: &str) -> StateResult<Option<LockGuard>> {
        let token = self.next_token();
        if self.store.try_acquire_lock(key, &token, self.ttl)? {
            debug!(%key, owner = %token, "lock acquired");
            Ok(Some(LockGuard {
                store: self.store.clone(),
                key: key.to_string(),
                token,
            }))
        } else {
            Ok(None)
        }
    }

    /// Wait up to `timeout` for `key`.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> StateResult<LockGuard> {
        let token = self.next_token();
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            if self.store.try_acquire_lock(key, &token, self.ttl)? {
                debug!(%key, owner = %token, "lock acquired");
                return Ok(LockGuard {
                    store: self.store.clone(),
                    key: key.to_string(),
                    token,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StateError::LockTimeout {
                    key: key.to_string(),
                    waited_ms: now.duration_since(started).as_millis() as u64,
                });
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Run `f` while holding `key`, waiting at most `timeout` to get it.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, timeout: Duration, f: F) -> StateResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(key, timeout).await?;
        Ok(f().await)
    }

    /// Run `f` only if `key` is free right now; `Ok(None)` otherwise.
    pub async fn try_with_lock<T, F, Fut>(&self, key: &str, f: F) -> StateResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.try_acquire(key)? {
            Some(_guard) => Ok(Some(f().await)),
            None => Ok(None),
        }
    }
}

/// A held lock. Released on drop.
pub struct LockGuard {
    store: StateStore,
    key: String,
    token: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match self.store.release_lock(&self.key, &self.token) {
            Ok(true) => debug!(key = %self.key, owner = %self.token, "lock released"),
            Ok(false) => warn!(key = %self.key, owner = %self.token, "lock lease expired before release"),
            Err(e) => warn!(key = %self.key, error = %e, "failed to release lock"),
        }
    }
}
