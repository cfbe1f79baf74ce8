//! # ArbitrageX Unified Types Library
//!
//! Shared type system for the arbitrage core: identifiers, market state
//! snapshots, opportunities, routes, MEV analysis, executions, and workflow
//! state.
//!
//! ## Design Philosophy
//!
//! - **Ids over pointers**: pools, chains, workflows, and executions are
//!   referenced by newtype ids; arenas live in `market-state` and
//!   `coordinator`, never as cyclic object graphs.
//! - **Typed sum variants**: opportunity kinds, submission strategies,
//!   execution statuses, and MEV actions are enums, not stringly-typed blobs.
//!   JSON appears only at the system boundary (KV values, webhooks, HTTP),
//!   always carrying a `schema_version`.
//! - **No precision loss**: USD values are `rust_decimal::Decimal`; raw token
//!   amounts are `u128` in native token units.
//! - **Injected time**: every time-dependent component takes a
//!   [`time::Clock`] so tests run deterministically.

pub mod error;
pub mod execution;
pub mod identifiers;
pub mod market;
pub mod mev;
pub mod opportunity;
pub mod route;
pub mod time;
pub mod workflow;

pub use error::ErrorKind;
pub use execution::{Execution, ExecutionStatus};
pub use identifiers::{
    ChainId, DexProtocol, EvmAddress, ExecutionId, Fingerprint, OpportunityId, PoolId, WorkflowId,
};
pub use market::{PoolLiquidity, PoolSnapshot, PoolUpdate, Token};
pub use mev::{
    MevAction, MevAnalysis, ProtectionLevel, Submission, SubmissionStrategy, Threat, ThreatLevel,
    ThreatType, TxDraft,
};
pub use opportunity::{Opportunity, OpportunityKind, PoolRef};
pub use route::{Route, RouteLeg};
pub use time::{Clock, SimClock, SystemClock};
pub use workflow::{AgentKind, AgentState, WorkflowState, WorkflowStatus};

/// Schema version stamped into every JSON value persisted at the boundary.
pub const SCHEMA_VERSION: u32 = 1;
