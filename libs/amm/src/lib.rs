//! # ArbitrageX AMM Math & Pool Adapter SPI
//!
//! Exact swap mathematics for the pool protocols the router plans across,
//! plus the flat [`PoolAdapter`] trait every DEX integration implements.
//!
//! All quote functions are deterministic for a fixed `(pool snapshot, params)`
//! pair: no clocks, no RPC, no hidden state. The router and discovery gate
//! both rely on that determinism to re-simulate routes.
//!
//! - [`v2_math`]: constant-product (x·y=k) pools, full-precision `Decimal`
//! - [`v3_math`]: concentrated liquidity, within-tick sqrt-price steps
//! - [`sizing`]: closed-form optimal cycle input and the discovery quick gate
//! - [`exact_output`]: bisection solver for exact-output planning
//! - [`adapter`]: the SPI plus V2/V3 implementations and the registry

pub mod adapter;
pub mod exact_output;
pub mod sizing;
pub mod v2_math;
pub mod v3_math;

pub use adapter::{AdapterRegistry, PoolAdapter, PoolEvent, Quote, SwapParams};
pub use exact_output::{solve_exact_output, ExactOutputSolution, MAX_SOLVER_ITERATIONS};
pub use sizing::{optimal_cycle_input, quick_profit_upper_bound};

use thiserror::Error;
use types::DexProtocol;

/// Failures inside pure AMM math. One failing leg never fails the whole plan;
/// the planner drops the sequence and keeps going.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmmError {
    #[error("invalid input: {context}")]
    InvalidInput { context: String },

    #[error("pool has zero liquidity")]
    ZeroLiquidity,

    #[error("insufficient liquidity: requested output {requested} of reserve {available}")]
    InsufficientLiquidity { requested: u128, available: u128 },

    #[error("arithmetic overflow in {context}")]
    Overflow { context: &'static str },

    #[error("no adapter registered for protocol {dex}")]
    UnsupportedProtocol { dex: DexProtocol },

    #[error("token is not part of the pool")]
    TokenNotInPool,

    #[error("unrecognized event topic")]
    UnknownEvent,

    #[error("malformed event data: expected {expected} bytes, got {got}")]
    MalformedEvent { expected: usize, got: usize },
}
