//! Lease-based distributed lock over a shared [`KvStore`].
//!
//! A lock is a record under the collection's lock key whose value is the
//! holder's owner token. It is created only if absent and carries a TTL, so a
//! crashed holder blocks others for at most one lease. Release deletes the
//! record only while it still holds the caller's token: a holder whose lease
//! ran out and was taken over cannot remove the new owner's lock.

use crate::error::Result;
use crate::persistence::kv::KvStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Acquires leases on keys of a shared store.
#[derive(Clone)]
pub struct LeaseLock {
    kv: Arc<dyn KvStore>,
    retry_backoff: Duration,
}

impl LeaseLock {
    pub fn new(kv: Arc<dyn KvStore>, retry_backoff: Duration) -> Self {
        Self { kv, retry_backoff }
    }

    /// Single attempt to take `key` for `lease_ttl`.
    pub async fn try_acquire(&self, key: &str, lease_ttl: Duration) -> Result<Option<LeaseGuard>> {
        let owner = Uuid::new_v4().to_string();
        if self
            .kv
            .set_if_absent(key, owner.as_bytes(), lease_ttl)
            .await?
        {
            debug!(key, owner = %owner, "lease acquired");
            Ok(Some(LeaseGuard {
                kv: Arc::clone(&self.kv),
                key: key.to_string(),
                owner,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Take `key`, retrying with a fixed backoff. Returns `Ok(None)` once
    /// `wait_timeout` has elapsed without success; the wait is bounded even if
    /// the store itself stalls.
    pub async fn acquire(
        &self,
        key: &str,
        lease_ttl: Duration,
        wait_timeout: Duration,
    ) -> Result<Option<LeaseGuard>> {
        let deadline = Instant::now() + wait_timeout;
        match tokio::time::timeout_at(deadline, self.retry_until(key, lease_ttl, deadline)).await {
            Ok(result) => result,
            Err(_) => Ok(None),
        }
    }

    async fn retry_until(
        &self,
        key: &str,
        lease_ttl: Duration,
        deadline: Instant,
    ) -> Result<Option<LeaseGuard>> {
        loop {
            if let Some(guard) = self.try_acquire(key, lease_ttl).await? {
                return Ok(Some(guard));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.retry_backoff.min(deadline - now)).await;
        }
    }
}

/// Proof of holding a lease. Release it with [`LeaseGuard::release`]; a guard
/// dropped without release (an early return or a panic) schedules the
/// owner-checked release on the current runtime instead.
#[derive(Debug)]
pub struct LeaseGuard {
    kv: Arc<dyn KvStore>,
    key: String,
    owner: String,
    released: bool,
}

impl LeaseGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Whether the lock record still carries this guard's owner token. False
    /// once the lease has expired, whether or not someone took it over.
    pub async fn is_held(&self) -> Result<bool> {
        self.fence().is_held().await
    }

    /// An owned handle for checking ownership from work running under the lease.
    pub fn fence(&self) -> LeaseFence {
        LeaseFence {
            kv: Arc::clone(&self.kv),
            key: self.key.clone(),
            owner: self.owner.clone(),
        }
    }

    /// Delete the lock record if this guard still owns it. Returns `false`
    /// when the lease had expired and someone else holds the key now.
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        let released = self
            .kv
            .delete_if_equals(&self.key, self.owner.as_bytes())
            .await?;
        if released {
            debug!(key = %self.key, "lease released");
        } else {
            warn!(key = %self.key, owner = %self.owner, "lease expired before release");
        }
        Ok(released)
    }
}

/// Ownership check for one held lease. Checking right before a commit narrows,
/// but does not close, the window in which an expired holder can still write.
#[derive(Debug, Clone)]
pub struct LeaseFence {
    kv: Arc<dyn KvStore>,
    key: String,
    owner: String,
}

impl LeaseFence {
    pub async fn is_held(&self) -> Result<bool> {
        Ok(self.kv.get(&self.key).await?.as_deref() == Some(self.owner.as_bytes()))
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let kv = Arc::clone(&self.kv);
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = kv.delete_if_equals(&key, owner.as_bytes()).await {
                        warn!(key = %key, error = %e, "background lease release failed");
                    }
                });
            }
            Err(_) => {
                warn!(key = %key, "lease dropped outside a runtime; it will expire on its own");
            }
        }
    }
}
