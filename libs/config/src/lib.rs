//! # ArbitrageX Configuration
//!
//! Typed configuration for every core component. No hardcoded parameters in
//! strategy code: components receive their config struct at construction.
//!
//! Loading order: production defaults → TOML file (if given) → environment
//! overrides → `validate()`. Invalid configurations fail startup rather than
//! degrade silently.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use types::ChainId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
}

/// Complete configuration for the arbitrage core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub chains: Vec<ChainConfig>,
    pub discovery: DiscoveryConfig,
    pub router: RouterConfig,
    pub mev: MevConfig,
    pub executor: ExecutorConfig,
    pub coordinator: CoordinatorConfig,
    pub backend: BackendConfig,
    pub gateway: GatewayConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            chains: vec![ChainConfig::default()],
            discovery: DiscoveryConfig::default(),
            router: RouterConfig::default(),
            mev: MevConfig::default(),
            executor: ExecutorConfig::default(),
            coordinator: CoordinatorConfig::default(),
            backend: BackendConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Per-chain connectivity and pricing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub backup_rpc_urls: Vec<String>,
    /// USD price of the native gas token, used for gas-cost conversion until
    /// a live feed overrides it.
    pub native_token_price_usd: Decimal,
    pub relay_url: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: ChainId::POLYGON.0,
            rpc_url: "https://polygon-rpc.com".to_string(),
            backup_rpc_urls: vec!["https://rpc.ankr.com/polygon".to_string()],
            native_token_price_usd: dec!(0.75),
            relay_url: "https://relay.flashbots.net".to_string(),
        }
    }
}

/// Opportunity discovery parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Floor under which opportunities are never emitted (USD).
    pub min_profit_floor_usd: Decimal,
    /// Quick-gate multiplier: templates whose optimistic bound is below
    /// `floor × gate_factor` are skipped before exact math runs.
    pub gate_factor: Decimal,
    /// Emitted opportunities expire this long after detection.
    pub opportunity_ttl_secs: u64,
    /// At-most-once emission per fingerprint inside this window.
    pub dedup_window_secs: u64,
    /// Pool snapshots older than this are skipped and counted.
    pub staleness_ttl_secs: u64,
    /// Bounded emission buffer; under backpressure the lowest-value
    /// candidates are dropped.
    pub emit_buffer_size: usize,
    /// Flat per-route gas estimate used before the planner refines it.
    pub default_gas_estimate: u64,
    /// Flat gas cost deducted from expected profit until live fees arrive.
    pub gas_cost_usd: Decimal,
    /// Register flash-loan-funded variants alongside plain templates.
    pub enable_flash_variants: bool,
    /// Probe trade size for non-closed-form pairs, as a fraction of pool TVL.
    pub probe_tvl_fraction: Decimal,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            min_profit_floor_usd: dec!(1.0),
            gate_factor: dec!(0.5),
            opportunity_ttl_secs: 30,
            dedup_window_secs: 10,
            staleness_ttl_secs: 15,
            emit_buffer_size: 256,
            default_gas_estimate: 300_000,
            gas_cost_usd: dec!(3.0),
            enable_flash_variants: true,
            probe_tvl_fraction: dec!(0.01),
        }
    }
}

/// Route planning constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Maximum swap hops per route (2 by default, capped at 3).
    pub max_hops: usize,
    pub beam_width: usize,
    pub min_liquidity_usd: Decimal,
    pub max_price_impact_bps: u32,
    pub max_slippage_bps: u32,
    /// Terminal output must clear `amount_in × (1 + min_profit_bps/10⁴)`.
    pub min_profit_bps: u32,
    pub gas_price_gwei: u64,
    /// Profit must also clear gas cost plus this margin (USD).
    pub safety_margin_usd: Decimal,
    /// Exact-output convergence tolerance, in raw output units.
    pub epsilon_out: u128,
    /// Route deadline baseline before MEV widening (minutes).
    pub base_deadline_minutes: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_hops: 2,
            beam_width: 8,
            min_liquidity_usd: dec!(10000),
            max_price_impact_bps: 200,
            max_slippage_bps: 50,
            min_profit_bps: 10,
            gas_price_gwei: 30,
            safety_margin_usd: dec!(0.50),
            epsilon_out: 1_000,
            base_deadline_minutes: 5,
        }
    }
}

/// MEV analysis and protection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MevConfig {
    /// Operator protection posture: "basic" | "standard" | "advanced" | "maximum".
    pub protection_level: String,
    /// Abort instead of protecting on CRITICAL threats.
    pub emergency_stop: bool,
    /// Oracle deviation beyond this is an anomaly (bps).
    pub max_deviation_bps: u32,
    /// TVL drop fraction flagged as manipulation, in `[0, 1]`.
    pub tvl_drop_alert_pct: f64,
    pub sandwich_weight: f64,
    pub frontrun_weight: f64,
    pub backrun_weight: f64,
    pub oracle_weight: f64,
    /// Slippage headroom above this invites backruns (bps).
    pub backrun_headroom_bps: u32,
}

impl Default for MevConfig {
    fn default() -> Self {
        Self {
            protection_level: "standard".to_string(),
            emergency_stop: false,
            max_deviation_bps: 100,
            tvl_drop_alert_pct: 0.25,
            sandwich_weight: 0.5,
            frontrun_weight: 0.35,
            backrun_weight: 0.2,
            oracle_weight: 0.6,
            backrun_headroom_bps: 100,
        }
    }
}

/// Execution engine parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_retries: u32,
    pub confirmation_timeout_secs: u64,
    pub receipt_poll_interval_ms: u64,
    pub max_gas_price_gwei: u64,
    pub gas_limit: u64,
    /// Blocks past the target block a bundle is still considered pending.
    pub bundle_inclusion_window: u64,
    /// Flash-loan providers accepted for callbacks, by pool address (hex).
    pub flash_loan_providers: Vec<FlashLoanProviderConfig>,
    /// Signing key for the executing account (hex; injected via env in
    /// production).
    pub signer_private_key: String,
    /// Arbitrage executor contract receiving the encoded route (hex).
    pub arb_contract: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashLoanProviderConfig {
    pub name: String,
    pub address: String,
    pub fee_bps: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            confirmation_timeout_secs: 60,
            receipt_poll_interval_ms: 500,
            max_gas_price_gwei: 100,
            gas_limit: 500_000,
            bundle_inclusion_window: 2,
            flash_loan_providers: vec![FlashLoanProviderConfig {
                name: "aave_v3".to_string(),
                address: "0x794a61358d6845594f94dc1db02a252b5b4814ad".to_string(),
                fee_bps: 9,
            }],
            signer_private_key:
                "0000000000000000000000000000000000000000000000000000000000000001".to_string(),
            arb_contract: "0x0000000000000000000000000000000000000000".to_string(),
        }
    }
}

/// Coordinator (C5) substrate parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// In-process LRU capacity in entries.
    pub cache_max_size: usize,
    /// Window during which a stale local entry may be served on KV failure.
    pub cache_validity_window_secs: u64,
    pub default_cache_ttl_secs: u64,
    pub lock_ttl_secs: u64,
    /// `start_workflow:<id>` limit: attempts per window.
    pub start_rate_limit_max: u32,
    pub start_rate_limit_window_secs: u64,
    /// Terminal workflows are retained this long.
    pub workflow_retention_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cache_max_size: 1000,
            cache_validity_window_secs: 5,
            default_cache_ttl_secs: 300,
            lock_ttl_secs: 60,
            start_rate_limit_max: 5,
            start_rate_limit_window_secs: 60,
            workflow_retention_secs: 86_400,
        }
    }
}

/// Backend control-plane client parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub bearer_token: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
    /// Client-side pacing toward the backend, requests per minute.
    pub requests_per_minute: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8787".to_string(),
            bearer_token: String::new(),
            request_timeout_secs: 30,
            max_retries: 3,
            backoff_initial_secs: 1,
            backoff_max_secs: 10,
            requests_per_minute: 600,
        }
    }
}

/// Exposed HTTP surface parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_address: String,
    pub port: u16,
    /// HMAC-SHA256 key for `POST /webhooks` signatures (hex).
    pub webhook_secret: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8700,
            webhook_secret: String::new(),
        }
    }
}

impl CoreConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let mut config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, for container deployments without
    /// a mounted config file.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("ARBX_MIN_PROFIT_FLOOR_USD") {
            if let Ok(parsed) = value.parse::<Decimal>() {
                self.discovery.min_profit_floor_usd = parsed;
            }
        }
        if let Ok(value) = std::env::var("ARBX_MAX_PRICE_IMPACT_BPS") {
            if let Ok(parsed) = value.parse::<u32>() {
                self.router.max_price_impact_bps = parsed;
            }
        }
        if let Ok(value) = std::env::var("ARBX_PROTECTION_LEVEL") {
            self.mev.protection_level = value.to_lowercase();
        }
        if let Ok(value) = std::env::var("ARBX_EMERGENCY_STOP") {
            self.mev.emergency_stop = value.eq_ignore_ascii_case("true");
        }
        if let Ok(value) = std::env::var("ARBX_BACKEND_URL") {
            self.backend.base_url = value;
        }
        if let Ok(value) = std::env::var("ARBX_BACKEND_TOKEN") {
            self.backend.bearer_token = value;
        }
        if let Ok(value) = std::env::var("ARBX_SIGNER_KEY") {
            self.executor.signer_private_key = value;
        }
        if let Ok(value) = std::env::var("ARBX_GATEWAY_PORT") {
            if let Ok(parsed) = value.parse::<u16>() {
                self.gateway.port = parsed;
            }
        }
        if let Ok(value) = std::env::var("ARBX_WEBHOOK_SECRET") {
            self.gateway.webhook_secret = value;
        }
    }

    /// Reject out-of-range parameters before any component starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery.min_profit_floor_usd < Decimal::ZERO {
            return Err(invalid("discovery.min_profit_floor_usd must be >= 0"));
        }
        if self.discovery.gate_factor <= Decimal::ZERO {
            return Err(invalid("discovery.gate_factor must be positive"));
        }
        if self.discovery.opportunity_ttl_secs == 0 {
            return Err(invalid("discovery.opportunity_ttl_secs must be positive"));
        }
        if self.discovery.gas_cost_usd < Decimal::ZERO {
            return Err(invalid("discovery.gas_cost_usd must be >= 0"));
        }
        if self.discovery.probe_tvl_fraction <= Decimal::ZERO
            || self.discovery.probe_tvl_fraction > Decimal::ONE
        {
            return Err(invalid("discovery.probe_tvl_fraction must be in (0, 1]"));
        }

        if self.router.max_hops == 0 || self.router.max_hops > 3 {
            return Err(invalid("router.max_hops must be in 1..=3"));
        }
        if self.router.beam_width == 0 {
            return Err(invalid("router.beam_width must be positive"));
        }
        if self.router.max_slippage_bps > 10_000 {
            return Err(invalid("router.max_slippage_bps must be <= 10000"));
        }
        if self.router.max_price_impact_bps > 10_000 {
            return Err(invalid("router.max_price_impact_bps must be <= 10000"));
        }

        match self.mev.protection_level.as_str() {
            "basic" | "standard" | "advanced" | "maximum" => {}
            other => {
                return Err(invalid(format!(
                    "mev.protection_level '{other}' is not one of basic/standard/advanced/maximum"
                )))
            }
        }
        for (name, weight) in [
            ("sandwich_weight", self.mev.sandwich_weight),
            ("frontrun_weight", self.mev.frontrun_weight),
            ("backrun_weight", self.mev.backrun_weight),
            ("oracle_weight", self.mev.oracle_weight),
        ] {
            if !(0.0..=1.0).contains(&weight) {
                return Err(invalid(format!("mev.{name} must be in [0, 1]")));
            }
        }

        if self.executor.gas_limit < 21_000 {
            return Err(invalid("executor.gas_limit must be at least 21000"));
        }
        if self.executor.max_gas_price_gwei == 0 {
            return Err(invalid("executor.max_gas_price_gwei must be positive"));
        }

        if self.coordinator.cache_max_size == 0 {
            return Err(invalid("coordinator.cache_max_size must be positive"));
        }
        if self.coordinator.lock_ttl_secs == 0 {
            return Err(invalid("coordinator.lock_ttl_secs must be positive"));
        }
        if self.coordinator.start_rate_limit_max == 0 {
            return Err(invalid("coordinator.start_rate_limit_max must be positive"));
        }

        if self.backend.request_timeout_secs == 0 {
            return Err(invalid("backend.request_timeout_secs must be positive"));
        }
        if self.backend.backoff_initial_secs > self.backend.backoff_max_secs {
            return Err(invalid(
                "backend.backoff_initial_secs must not exceed backoff_max_secs",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        CoreConfig::default().validate().unwrap();
    }

    #[test]
    fn defaults_carry_production_constants() {
        let config = CoreConfig::default();
        assert_eq!(config.router.max_hops, 2);
        assert_eq!(config.router.beam_width, 8);
        assert_eq!(config.router.max_price_impact_bps, 200);
        assert_eq!(config.coordinator.cache_max_size, 1000);
        assert_eq!(config.coordinator.cache_validity_window_secs, 5);
        assert_eq!(config.coordinator.lock_ttl_secs, 60);
        assert_eq!(config.coordinator.start_rate_limit_max, 5);
        assert_eq!(config.backend.request_timeout_secs, 30);
        assert_eq!(config.backend.max_retries, 3);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut config = CoreConfig::default();
        config.router.max_hops = 4;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.mev.protection_level = "paranoid".to_string();
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.executor.gas_limit = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let config = CoreConfig::default();
        let rendered = toml::to_string(&config).unwrap();
        let parsed: CoreConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(
            parsed.discovery.min_profit_floor_usd,
            config.discovery.min_profit_floor_usd
        );
        assert_eq!(parsed.router.beam_width, config.router.beam_width);
    }

    #[test]
    fn partial_file_fills_from_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[router]\nmax_hops = 3\n").unwrap();

        let config = CoreConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.router.max_hops, 3);
        assert_eq!(config.router.beam_width, 8);
        config.validate().unwrap();
    }
}
