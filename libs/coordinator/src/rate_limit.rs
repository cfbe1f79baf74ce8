//! Sliding-window rate limiting over the KV substrate.
//!
//! The first request in a window seeds the counter at 1 with the window TTL;
//! later requests increment atomically. When the substrate is unreachable
//! the limiter **fails open**: traffic is allowed and the incident counted.

use crate::kv::KvStore;
use crate::metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use types::Clock;

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Unix seconds at which the current window resets.
    pub reset_at_secs: u64,
}

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            kv,
            clock,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Check and consume one slot for `id`. Infallible by design: substrate
    /// errors produce an allow.
    pub async fn check(&self, id: &str, max: u32, window: Duration) -> RateDecision {
        let window_secs = window.as_secs().max(1);
        let now_secs = self.clock.now_secs();
        let window_start = now_secs - now_secs % window_secs;
        let reset_at_secs = window_start + window_secs;
        let key = format!("rate_limit:{id}:{window_start}");

        match self.kv.incr(&key, 1, Some(window)).await {
            Ok(count) => {
                let count_u32 = count.min(u32::MAX as u64) as u32;
                RateDecision {
                    allowed: count_u32 <= max,
                    remaining: max.saturating_sub(count_u32),
                    reset_at_secs,
                }
            }
            Err(e) => {
                warn!(id, error = %e, "rate limiter failing open");
                if let Some(metrics) = &self.metrics {
                    metrics.rate_limit_fail_open_total.inc();
                }
                RateDecision {
                    allowed: true,
                    remaining: max,
                    reset_at_secs,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{FaultInjectedKv, MemoryKv};
    use types::SimClock;

    fn limiter() -> (Arc<SimClock>, Arc<FaultInjectedKv<MemoryKv>>, RateLimiter) {
        let clock = SimClock::new(0);
        let kv = Arc::new(FaultInjectedKv::new(MemoryKv::new(clock.clone())));
        let limiter = RateLimiter::new(kv.clone(), clock.clone());
        (clock, kv, limiter)
    }

    #[tokio::test]
    async fn allows_up_to_max_then_blocks() {
        let (_clock, _kv, limiter) = limiter();
        let window = Duration::from_secs(60);

        for used in 1..=5u32 {
            let decision = limiter.check("wf", 5, window).await;
            assert!(decision.allowed, "request {used} should pass");
            assert_eq!(decision.remaining, 5 - used);
        }

        let decision = limiter.check("wf", 5, window).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn window_rollover_resets_the_budget() {
        let (clock, _kv, limiter) = limiter();
        let window = Duration::from_secs(60);
        for _ in 0..5 {
            limiter.check("wf", 5, window).await;
        }
        assert!(!limiter.check("wf", 5, window).await.allowed);

        clock.advance(Duration::from_secs(60));
        let decision = limiter.check("wf", 5, window).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn substrate_failure_fails_open_and_recovers() {
        let (clock, kv, limiter) = limiter();
        let window = Duration::from_secs(60);

        kv.set_failing(true);
        let decision = limiter.check("wf", 5, window).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);

        // Recovery: counting resumes within one window.
        kv.set_failing(false);
        clock.advance(Duration::from_secs(60));
        let decision = limiter.check("wf", 5, window).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn ids_are_limited_independently() {
        let (_clock, _kv, limiter) = limiter();
        let window = Duration::from_secs(60);
        for _ in 0..5 {
            limiter.check("a", 5, window).await;
        }
        assert!(!limiter.check("a", 5, window).await.allowed);
        assert!(limiter.check("b", 5, window).await.allowed);
    }
}
