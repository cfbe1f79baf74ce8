//! # Opportunity Discovery
//!
//! Streaming detection of candidate arbitrage routes. Pool updates flow in;
//! validated, deduplicated [`types::Opportunity`] values flow out through a
//! lossy, profit-preferring buffer.
//!
//! ## Pipeline
//!
//! ```text
//! Pool Update → [Registry Publish] → [Template Index] → [Quick Gate] → [Exact Eval]
//!       ↓               ↓                   ↓                ↓              ↓
//!  Snapshot Swap   New-Pair Templates  Affected Routes  Spot Bound    Fingerprint
//!  Staleness TTL   Flash Variants      Inverted Index   Gate Factor   Dedup Window
//! ```
//!
//! Emission is at-most-once per fingerprint inside the dedup window. A
//! failure in one template (stale pool, adapter error, overflow) is counted
//! and never poisons sibling templates. Discovery never retries; the next
//! pool update re-fires naturally.

pub mod detector;
pub mod stream;
pub mod templates;

pub use detector::{DiscoveryError, OpportunityDetector};
pub use stream::OpportunityBuffer;
pub use templates::{Template, TemplateIndex};
