//! # Route Planner / Simulator
//!
//! Turns a candidate [`types::Opportunity`] into an executable
//! [`types::Route`], or rejects it with a typed reason. Planning is a beam
//! search over adapter-quoted leg sequences under liquidity, price-impact,
//! slippage, and net-profit constraints. The exact-output variant solves for
//! the input amount by bisection, used by the flash-loan path to size loans.
//!
//! Planning never retries and holds no locks; an adapter failure drops one
//! sequence, not the plan.

pub mod planner;

pub use planner::{Planner, RouterError};
