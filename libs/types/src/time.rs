//! Injected clock for deterministic tests and simulated delays.
//!
//! Production code never calls `SystemTime::now()` directly; it reads time
//! through a shared [`Clock`] handle passed in at construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time, in nanoseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;

    fn now_ms(&self) -> u64 {
        self.now_ns() / 1_000_000
    }

    fn now_secs(&self) -> u64 {
        self.now_ns() / 1_000_000_000
    }
}

/// Real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ns(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct SimClock {
    ns: AtomicU64,
}

impl SimClock {
    pub fn new(start_ns: u64) -> Arc<Self> {
        Arc::new(Self {
            ns: AtomicU64::new(start_ns),
        })
    }

    pub fn advance(&self, by: Duration) {
        self.ns.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set_ns(&self, ns: u64) {
        self.ns.store(ns, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_clock_advances_deterministically() {
        let clock = SimClock::new(1_000);
        assert_eq!(clock.now_ns(), 1_000);
        clock.advance(Duration::from_nanos(500));
        assert_eq!(clock.now_ns(), 1_500);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_secs(), 2);
    }
}
