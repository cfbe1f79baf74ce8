//! Strategy service library: the engine wiring plus logging setup. The
//! `arbitragex` binary composes these with the configured chain executors.

pub mod engine;
pub mod logging;

pub use engine::StrategyEngine;
