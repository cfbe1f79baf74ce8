//! Distributed locks with lease TTLs.
//!
//! A lock is a conditional KV insert under `lock:<name>`. Leases expire by
//! TTL so a crashed holder never deadlocks the fleet. Acquisition returns an
//! RAII [`LockGuard`] that releases on drop on every path (timeout, error,
//! early return.

use crate::kv::{KvError, KvStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use types::Clock;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    owner_nonce: u64,
    acquired_at_ns: u64,
    lease_ttl_secs: u64,
}

pub struct LockManager {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    /// Distinguishes this process from other holders.
    owner_nonce: u64,
}

impl LockManager {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            kv,
            clock,
            owner_nonce: rand::random(),
        }
    }

    fn key(name: &str) -> String {
        format!("lock:{name}")
    }

    /// Try to take the lock. `Ok(None)` means another holder has it.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockGuard>, KvError> {
        let record = LockRecord {
            owner_nonce: self.owner_nonce,
            acquired_at_ns: self.clock.now_ns(),
            lease_ttl_secs: ttl.as_secs(),
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| KvError::Unavailable {
            reason: format!("serialize lock record: {e}"),
        })?;

        let acquired = self
            .kv
            .put_if_absent(&Self::key(name), bytes, Some(ttl))
            .await?;
        if !acquired {
            debug!(lock = name, "lock held elsewhere");
            return Ok(None);
        }

        debug!(lock = name, ttl_secs = ttl.as_secs(), "lock acquired");
        Ok(Some(LockGuard {
            kv: self.kv.clone(),
            name: name.to_string(),
            owner_nonce: self.owner_nonce,
            released: false,
        }))
    }

    /// Release by name. Only the current owner's record is removed.
    pub async fn release(&self, name: &str) -> Result<(), KvError> {
        release_if_owner(&*self.kv, name, self.owner_nonce).await
    }

    /// Whether the named lock is currently held by anyone.
    pub async fn is_held(&self, name: &str) -> Result<bool, KvError> {
        Ok(self.kv.get(&Self::key(name)).await?.is_some())
    }
}

async fn release_if_owner(kv: &dyn KvStore, name: &str, owner_nonce: u64) -> Result<(), KvError> {
    let key = LockManager::key(name);
    if let Some(bytes) = kv.get(&key).await? {
        match serde_json::from_slice::<LockRecord>(&bytes) {
            Ok(record) if record.owner_nonce == owner_nonce => {
                kv.delete(&key).await?;
                debug!(lock = name, "lock released");
            }
            Ok(_) => {
                // Lease expired and someone else took it; leave theirs alone.
                warn!(lock = name, "skipping release of lock owned elsewhere");
            }
            Err(_) => {
                kv.delete(&key).await?;
            }
        }
    }
    Ok(())
}

/// Scoped lock holder. Explicit [`LockGuard::release`] is preferred; drop is
/// the backstop for early returns and panics.
pub struct LockGuard {
    kv: Arc<dyn KvStore>,
    name: String,
    owner_nonce: u64,
    released: bool,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn release(mut self) -> Result<(), KvError> {
        self.released = true;
        release_if_owner(&*self.kv, &self.name, self.owner_nonce).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let kv = self.kv.clone();
        let name = std::mem::take(&mut self.name);
        let owner_nonce = self.owner_nonce;
        // Release must not block drop; the lease TTL covers a lost race here.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = release_if_owner(&*kv, &name, owner_nonce).await {
                    warn!(lock = %name, error = %e, "failed to release lock on drop");
                }
            });
        }
    }
}
