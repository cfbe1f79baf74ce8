//! Tracing initialization for the strategy binary.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` controls the filter; the
/// default keeps strategy crates at info and the rest at warn.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            "warn,arbitrage_strategy=info,discovery=info,router=info,mev=info,executor=info,coordinator=info",
        )
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
