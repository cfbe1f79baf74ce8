//! Durable key-value substrate abstraction.
//!
//! The trait mirrors what every edge KV offering provides: get/put/delete/
//! list with per-entry TTL, plus the two atomic primitives the coordinator
//! builds everything else on: conditional insert (locks, webhook dedup) and
//! windowed increment (counters, rate limits).

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use types::Clock;

/// Persisted values are JSON, bounded at 25 KB.
pub const MAX_VALUE_BYTES: usize = 25 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("kv store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("value for {key} is {size} bytes, over the {MAX_VALUE_BYTES} byte bound")]
    ValueTooLarge { key: String, size: usize },
}

/// At-least-once semantics assumed: a write may be applied even when the call
/// errored. Every caller in this crate is idempotent against that.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Insert only when the key is absent (or expired). Returns whether the
    /// insert happened.
    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// Atomically add `n` to a numeric key and return the new value. The TTL
    /// applies only when the increment creates the key; an existing window
    /// keeps its original expiry.
    async fn incr(&self, key: &str, n: u64, ttl: Option<Duration>) -> Result<u64, KvError>;

    /// Rough number of live keys, for the `kv_keys_estimate` gauge.
    async fn estimate_keys(&self) -> Result<u64, KvError>;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    bytes: Vec<u8>,
    expires_at_ns: Option<u64>,
}

/// In-process KV used by tests and single-node deployments. TTL expiry is
/// lazy: expired entries are dropped when touched.
pub struct MemoryKv {
    entries: DashMap<String, StoredEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryKv {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    fn expires_at(&self, ttl: Option<Duration>) -> Option<u64> {
        ttl.map(|d| self.clock.now_ns().saturating_add(d.as_nanos() as u64))
    }

    fn is_expired(&self, entry: &StoredEntry) -> bool {
        entry
            .expires_at_ns
            .is_some_and(|at| self.clock.now_ns() >= at)
    }

    fn check_size(key: &str, value: &[u8]) -> Result<(), KvError> {
        if value.len() > MAX_VALUE_BYTES {
            return Err(KvError::ValueTooLarge {
                key: key.to_string(),
                size: value.len(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        if let Some(entry) = self.entries.get(key) {
            if self.is_expired(entry.value()) {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.bytes.clone()));
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError> {
        Self::check_size(key, &value)?;
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                bytes: value,
                expires_at_ns: self.expires_at(ttl),
            },
        );
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        Self::check_size(key, &value)?;
        let mut inserted = false;
        let expires_at_ns = self.expires_at(ttl);
        let now_expired = |entry: &StoredEntry| {
            entry
                .expires_at_ns
                .is_some_and(|at| self.clock.now_ns() >= at)
        };

        self.entries
            .entry(key.to_string())
            .and_modify(|existing| {
                if now_expired(existing) {
                    *existing = StoredEntry {
                        bytes: value.clone(),
                        expires_at_ns,
                    };
                    inserted = true;
                }
            })
            .or_insert_with(|| {
                inserted = true;
                StoredEntry {
                    bytes: value.clone(),
                    expires_at_ns,
                }
            });
        Ok(inserted)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let now_ns = self.clock.now_ns();
        Ok(self
            .entries
            .iter()
            .filter(|entry| {
                entry.key().starts_with(prefix)
                    && !entry.value().expires_at_ns.is_some_and(|at| now_ns >= at)
            })
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn incr(&self, key: &str, n: u64, ttl: Option<Duration>) -> Result<u64, KvError> {
        let expires_at_ns = self.expires_at(ttl);
        let now_ns = self.clock.now_ns();
        let mut new_value = n;

        self.entries
            .entry(key.to_string())
            .and_modify(|existing| {
                let expired = existing.expires_at_ns.is_some_and(|at| now_ns >= at);
                if expired {
                    *existing = StoredEntry {
                        bytes: n.to_string().into_bytes(),
                        expires_at_ns,
                    };
                    new_value = n;
                } else {
                    let current = std::str::from_utf8(&existing.bytes)
                        .ok()
                        .and_then(|s| s.parse::<u64>().ok())
                        .unwrap_or(0);
                    new_value = current.saturating_add(n);
                    existing.bytes = new_value.to_string().into_bytes();
                }
            })
            .or_insert_with(|| StoredEntry {
                bytes: n.to_string().into_bytes(),
                expires_at_ns,
            });
        Ok(new_value)
    }

    async fn estimate_keys(&self) -> Result<u64, KvError> {
        Ok(self.entries.len() as u64)
    }
}

/// Fault-injection wrapper: flips every operation into
/// [`KvError::Unavailable`] while tripped. Used to exercise the fail-open
/// paths in tests and chaos drills.
pub struct FaultInjectedKv<S> {
    inner: S,
    failing: AtomicBool,
}

impl<S: KvStore> FaultInjectedKv<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), KvError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable {
                reason: "fault injected".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<S: KvStore> KvStore for FaultInjectedKv<S> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError> {
        self.check()?;
        self.inner.put(key, value, ttl).await
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        self.check()?;
        self.inner.put_if_absent(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        self.check()?;
        self.inner.list(prefix).await
    }

    async fn incr(&self, key: &str, n: u64, ttl: Option<Duration>) -> Result<u64, KvError> {
        self.check()?;
        self.inner.incr(key, n, ttl).await
    }

    async fn estimate_keys(&self) -> Result<u64, KvError> {
        self.check()?;
        self.inner.estimate_keys().await
    }
}
