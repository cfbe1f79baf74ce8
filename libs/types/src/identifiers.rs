//! Identifier newtypes for chains, pools, workflows, and executions.
//!
//! Pointers between entities are always ids; the owning arena resolves them.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;

/// Raw 20-byte EVM address.
pub type EvmAddress = [u8; 20];

/// EVM chain identifier (1 = Ethereum mainnet, 137 = Polygon, ...).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl ChainId {
    pub const ETHEREUM: ChainId = ChainId(1);
    pub const POLYGON: ChainId = ChainId(137);
    pub const ARBITRUM: ChainId = ChainId(42161);
    pub const BASE: ChainId = ChainId(8453);
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// DEX protocol variant. Determines which pool adapter quotes a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DexProtocol {
    UniswapV2,
    SushiswapV2,
    UniswapV3,
    QuickswapV3,
    Curve,
    Balancer,
}

impl DexProtocol {
    /// Constant-product pools share the V2 adapter.
    pub fn is_v2(&self) -> bool {
        matches!(self, DexProtocol::UniswapV2 | DexProtocol::SushiswapV2)
    }

    /// Concentrated-liquidity pools share the V3 adapter.
    pub fn is_v3(&self) -> bool {
        matches!(self, DexProtocol::UniswapV3 | DexProtocol::QuickswapV3)
    }

    fn tag(&self) -> u8 {
        match self {
            DexProtocol::UniswapV2 => 1,
            DexProtocol::SushiswapV2 => 2,
            DexProtocol::UniswapV3 => 3,
            DexProtocol::QuickswapV3 => 4,
            DexProtocol::Curve => 5,
            DexProtocol::Balancer => 6,
        }
    }
}

impl fmt::Display for DexProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DexProtocol::UniswapV2 => "uniswap_v2",
            DexProtocol::SushiswapV2 => "sushiswap_v2",
            DexProtocol::UniswapV3 => "uniswap_v3",
            DexProtocol::QuickswapV3 => "quickswap_v3",
            DexProtocol::Curve => "curve",
            DexProtocol::Balancer => "balancer",
        };
        f.write_str(name)
    }
}

/// Pool identifier derived from `(chain, dex, address)`.
///
/// Two pools with the same derivation inputs are the same pool; the id is
/// stable across restarts and replicas.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct PoolId(pub u64);

impl PoolId {
    pub fn derive(chain: ChainId, dex: DexProtocol, address: &EvmAddress) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(chain.0.to_be_bytes());
        hasher.update([dex.tag()]);
        hasher.update(address);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        PoolId(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Monotonic opportunity id, unique per detector instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct OpportunityId(pub u64);

impl fmt::Display for OpportunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic execution id, unique per executor instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ExecutionId(pub u64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Workflow identifier, assigned by the caller that starts the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        WorkflowId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        WorkflowId(s.to_string())
    }
}

/// Content-addressed hash identifying equivalent opportunities.
///
/// Equal fingerprints mean "the same trade": identical kind, chain, pool set,
/// token path, and input-size bucket. Used for deduplication in discovery and
/// single-flight execution in the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Log2 bucket of a raw input amount. Near-identical sizes collapse into
    /// one bucket; an order-of-magnitude change produces a fresh fingerprint.
    pub fn amount_bucket(amount_in: u128) -> u32 {
        128 - amount_in.leading_zeros()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
