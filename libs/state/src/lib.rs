//! # Market State
//!
//! In-process registries for pool snapshots and token metadata.
//!
//! Snapshots are immutable once published: an update swaps the whole
//! `Arc<PoolSnapshot>`, so a reader never observes a torn
//! `(liquidity, last_updated)` pair. The core never mutates external pool
//! state; it only caches what the chain reported.

pub mod registry;

pub use registry::{PoolRegistry, StateError, TokenRegistry};
