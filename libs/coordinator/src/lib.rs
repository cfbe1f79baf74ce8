//! # Edge Coordinator
//!
//! The coordination substrate for distributed arbitrage execution: a layered
//! key-value cache, distributed locks with lease TTLs, windowed counters, a
//! sliding-window rate limiter, the workflow lifecycle state machine, an
//! idempotent webhook demultiplexer, and the backend control-plane client.
//!
//! ## Consistency model
//!
//! The KV substrate is assumed eventually consistent with at-least-once
//! write semantics; every consumer here is idempotent. Locks expire by TTL so
//! a crashed holder cannot deadlock the fleet. Counters never undercount
//! within a window but may overcount at-most-once per failed retry. The rate
//! limiter and the cache **fail open** when the substrate is unreachable:
//! traffic is allowed and reads are served stale within a bounded validity
//! window rather than refused.
//!
//! ## Ownership
//!
//! Workflow state, locks, counters, and cache entries are mutated only
//! through this crate's APIs. The workflow lock guarantees a single writer
//! per workflow id.

pub mod backend;
pub mod cache;
pub mod counter;
pub mod error;
pub mod kv;
pub mod lock;
pub mod metrics;
pub mod rate_limit;
pub mod webhook;
pub mod workflow;

pub use backend::BackendClient;
pub use cache::{CacheEntry, LayeredCache};
pub use counter::Counters;
pub use error::CoordinatorError;
pub use kv::{FaultInjectedKv, KvError, KvStore, MemoryKv, MAX_VALUE_BYTES};
pub use lock::{LockGuard, LockManager};
pub use metrics::Metrics;
pub use rate_limit::{RateDecision, RateLimiter};
pub use webhook::{WebhookEvent, WebhookOutcome, WebhookProcessor};
pub use workflow::WorkflowCoordinator;
