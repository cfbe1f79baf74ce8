//! Layered cache: in-process LRU in front of the durable KV.
//!
//! Reads check the local layer first, then the KV; KV hits are promoted.
//! Writes go through to the KV with TTL and a secondary tag index. A `get`
//! never returns an entry past its TTL, except when the KV is down, where a
//! locally cached entry may be served for at most `cache_validity_window`
//! past expiry (fail open). Cross-replica invalidations are advisory: keys
//! not found locally are simply ignored.

use crate::kv::{KvError, KvStore};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use types::Clock;

/// One cached value with bookkeeping for LRU and tag invalidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub inserted_at_ns: u64,
    pub ttl_secs: u64,
    pub version: u64,
    pub tags: Vec<String>,
    pub hit_count: u64,
    pub last_accessed_ns: u64,
    pub schema_version: u32,
}

impl CacheEntry {
    fn expires_at_ns(&self) -> u64 {
        self.inserted_at_ns
            .saturating_add(self.ttl_secs.saturating_mul(1_000_000_000))
    }

    fn is_expired(&self, now_ns: u64) -> bool {
        now_ns >= self.expires_at_ns()
    }
}

pub struct LayeredCache {
    kv: Arc<dyn KvStore>,
    local: Mutex<HashMap<String, CacheEntry>>,
    tag_index: Mutex<HashMap<String, HashSet<String>>>,
    clock: Arc<dyn Clock>,
    max_size: usize,
    validity_window_ns: u64,
    default_ttl: Duration,
}

impl LayeredCache {
    pub fn new(
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        max_size: usize,
        validity_window: Duration,
        default_ttl: Duration,
    ) -> Self {
        Self {
            kv,
            local: Mutex::new(HashMap::new()),
            tag_index: Mutex::new(HashMap::new()),
            clock,
            max_size: max_size.max(1),
            validity_window_ns: validity_window.as_nanos() as u64,
            default_ttl,
        }
    }

    /// Write-through set with TTL and tags.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        tags: Vec<String>,
    ) -> Result<(), KvError> {
        let now_ns = self.clock.now_ns();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let version = {
            let local = self.local.lock();
            local.get(key).map(|e| e.version + 1).unwrap_or(1)
        };

        let entry = CacheEntry {
            key: key.to_string(),
            value,
            inserted_at_ns: now_ns,
            ttl_secs: ttl.as_secs(),
            version,
            tags: tags.clone(),
            hit_count: 0,
            last_accessed_ns: now_ns,
            schema_version: types::SCHEMA_VERSION,
        };

        let bytes = serde_json::to_vec(&entry).map_err(|e| KvError::Unavailable {
            reason: format!("serialize cache entry: {e}"),
        })?;
        self.kv.put(key, bytes, Some(ttl)).await?;

        self.insert_local(entry);
        let mut tag_index = self.tag_index.lock();
        for tag in tags {
            tag_index.entry(tag).or_default().insert(key.to_string());
        }
        Ok(())
    }

    /// Read-through get. Serves stale local data only while the KV is down
    /// and the entry is within the validity window.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let now_ns = self.clock.now_ns();

        if let Some(value) = self.local_hit(key, now_ns) {
            return Some(value);
        }

        match self.kv.get(key).await {
            Ok(Some(bytes)) => {
                let Ok(mut entry) = serde_json::from_slice::<CacheEntry>(&bytes) else {
                    debug!(key, "dropping undecodable cache entry");
                    return None;
                };
                if entry.is_expired(now_ns) {
                    return None;
                }
                entry.hit_count += 1;
                entry.last_accessed_ns = now_ns;
                let value = entry.value.clone();
                self.insert_local(entry);
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "kv unavailable, serving within validity window");
                self.stale_local_hit(key, now_ns)
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.remove_local(key);
        self.kv.delete(key).await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        self.kv.list(prefix).await
    }

    /// Remove every entry whose tag set intersects `tags`.
    pub async fn invalidate_by_tag(&self, tags: &[String]) -> Result<usize, KvError> {
        let keys: Vec<String> = {
            let tag_index = self.tag_index.lock();
            tags.iter()
                .filter_map(|t| tag_index.get(t))
                .flat_map(|keys| keys.iter().cloned())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect()
        };

        let mut removed = 0;
        for key in &keys {
            self.remove_local(key);
            // Advisory across replicas: a miss elsewhere is fine.
            self.kv.delete(key).await?;
            removed += 1;
        }
        let mut tag_index = self.tag_index.lock();
        for tag in tags {
            tag_index.remove(tag);
        }
        Ok(removed)
    }

    /// Remove every entry whose key matches the pattern.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> Result<usize, KvError> {
        let regex = Regex::new(pattern).map_err(|e| KvError::Unavailable {
            reason: format!("invalid invalidation pattern: {e}"),
        })?;

        let mut keys: HashSet<String> = {
            let local = self.local.lock();
            local.keys().filter(|k| regex.is_match(k)).cloned().collect()
        };
        for key in self.kv.list("").await? {
            if regex.is_match(&key) {
                keys.insert(key);
            }
        }

        let mut removed = 0;
        for key in keys {
            self.remove_local(&key);
            self.kv.delete(&key).await?;
            removed += 1;
        }
        Ok(removed)
    }

    pub async fn invalidate_all(&self) -> Result<usize, KvError> {
        self.invalidate_by_pattern(".*").await
    }

    /// Entries currently resident in the local layer.
    pub fn local_len(&self) -> usize {
        self.local.lock().len()
    }

    fn local_hit(&self, key: &str, now_ns: u64) -> Option<Value> {
        let mut local = self.local.lock();
        let entry = local.get_mut(key)?;
        if entry.is_expired(now_ns) {
            local.remove(key);
            return None;
        }
        entry.hit_count += 1;
        entry.last_accessed_ns = now_ns;
        Some(entry.value.clone())
    }

    fn stale_local_hit(&self, key: &str, now_ns: u64) -> Option<Value> {
        let local = self.local.lock();
        let entry = local.get(key)?;
        let hard_limit = entry.expires_at_ns().saturating_add(self.validity_window_ns);
        if now_ns < hard_limit {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    fn insert_local(&self, entry: CacheEntry) {
        let mut local = self.local.lock();
        local.insert(entry.key.clone(), entry);
        if local.len() > self.max_size {
            // Bulk-evict the oldest quarter so overflow is amortized.
            let evict_count = (self.max_size / 4).max(1);
            let mut by_age: Vec<(String, u64)> = local
                .iter()
                .map(|(k, e)| (k.clone(), e.last_accessed_ns))
                .collect();
            by_age.sort_by_key(|(_, accessed)| *accessed);
            for (key, _) in by_age.into_iter().take(evict_count) {
                local.remove(&key);
            }
            debug!(evicted = evict_count, "cache LRU bulk eviction");
        }
    }

    fn remove_local(&self, key: &str) {
        self.local.lock().remove(key);
    }
}
