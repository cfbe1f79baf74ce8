//! Windowed counters over the KV substrate.
//!
//! Keys are `counter:<name>:<window_start>`, with windows aligned to
//! `now − (now mod window)` so every replica agrees on window identity
//! without coordination. Counters never undercount within a window: a failed
//! increment is retried once, which can overcount at most once per failure.

use crate::kv::{KvError, KvStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use types::Clock;

pub struct Counters {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl Counters {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    pub fn window_start(&self, window: Duration) -> u64 {
        let now_secs = self.clock.now_secs();
        let window_secs = window.as_secs().max(1);
        now_secs - now_secs % window_secs
    }

    fn key(&self, name: &str, window: Duration) -> String {
        format!("counter:{name}:{}", self.window_start(window))
    }

    /// Add `n` to the current window and return the new count.
    pub async fn increment(&self, name: &str, n: u64, window: Duration) -> Result<u64, KvError> {
        let key = self.key(name, window);
        // Windows live twice their span so late readers still see them.
        let ttl = Some(window * 2);

        match self.kv.incr(&key, n, ttl).await {
            Ok(count) => Ok(count),
            Err(first) => {
                warn!(counter = name, error = %first, "counter increment failed, retrying once");
                self.kv.incr(&key, n, ttl).await
            }
        }
    }

    /// Current count in the active window.
    pub async fn get(&self, name: &str, window: Duration) -> Result<u64, KvError> {
        let key = self.key(name, window);
        Ok(self
            .kv
            .get(&key)
            .await?
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use types::SimClock;

    fn counters() -> (Arc<SimClock>, Counters) {
        let clock = SimClock::new(0);
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        (clock.clone(), Counters::new(kv, clock))
    }

    #[tokio::test]
    async fn counts_accumulate_within_a_window() {
        let (_clock, counters) = counters();
        let window = Duration::from_secs(3600);
        assert_eq!(counters.increment("profit", 5, window).await.unwrap(), 5);
        assert_eq!(counters.increment("profit", 3, window).await.unwrap(), 8);
        assert_eq!(counters.get("profit", window).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn a_new_window_starts_from_zero() {
        let (clock, counters) = counters();
        let window = Duration::from_secs(60);
        counters.increment("c", 4, window).await.unwrap();

        clock.advance(Duration::from_secs(61));
        assert_eq!(counters.get("c", window).await.unwrap(), 0);
        assert_eq!(counters.increment("c", 1, window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reads_are_monotonic_within_a_window() {
        let (_clock, counters) = counters();
        let window = Duration::from_secs(3600);
        let mut last = 0;
        for _ in 0..20 {
            let count = counters.increment("mono", 1, window).await.unwrap();
            assert!(count > last);
            last = count;
        }
    }

    #[tokio::test]
    async fn window_alignment_is_replica_independent() {
        let (clock, counters) = counters();
        clock.set_ns(125 * 1_000_000_000); // 125s
        let window = Duration::from_secs(60);
        assert_eq!(counters.window_start(window), 120);
    }
}
