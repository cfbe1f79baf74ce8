//! Market state snapshots: tokens, pools, and pool update events.
//!
//! Pools are externally owned. The core only caches snapshots: a published
//! [`PoolSnapshot`] is immutable, and an update replaces the whole snapshot so
//! readers always observe a consistent `(liquidity, last_updated)` pair.

use crate::identifiers::{ChainId, DexProtocol, EvmAddress, PoolId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarketError {
    #[error("token decimals {decimals} outside supported range 0..=36")]
    DecimalsOutOfRange { decimals: u8 },

    #[error("pool {pool} token pair is degenerate (token0 == token1)")]
    DegenerateTokenPair { pool: PoolId },
}

/// An ERC-20 token, unique per `(chain, address)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    pub chain: ChainId,
    pub address: EvmAddress,
    pub symbol: String,
    pub decimals: u8,
}

impl Token {
    pub fn new(
        chain: ChainId,
        address: EvmAddress,
        symbol: impl Into<String>,
        decimals: u8,
    ) -> Result<Self, MarketError> {
        if decimals > 36 {
            return Err(MarketError::DecimalsOutOfRange { decimals });
        }
        Ok(Self {
            chain,
            address,
            symbol: symbol.into(),
            decimals,
        })
    }

    /// Scale factor converting raw units to whole tokens. Decimal carries at
    /// most 28 digits, so larger scales saturate there.
    pub fn unit(&self) -> Decimal {
        Decimal::from(10u128.pow(self.decimals.min(28) as u32))
    }
}

/// Protocol-specific liquidity representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum PoolLiquidity {
    V2 {
        reserve0: u128,
        reserve1: u128,
    },
    V3 {
        sqrt_price_x96: u128,
        liquidity: u128,
        tick: i32,
    },
}

impl PoolLiquidity {
    pub fn is_empty(&self) -> bool {
        match self {
            PoolLiquidity::V2 { reserve0, reserve1 } => *reserve0 == 0 || *reserve1 == 0,
            PoolLiquidity::V3 { liquidity, .. } => *liquidity == 0,
        }
    }
}

/// Immutable snapshot of one pool's state at `last_updated_ns`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub id: PoolId,
    pub chain: ChainId,
    pub dex: DexProtocol,
    pub address: EvmAddress,
    pub token0: EvmAddress,
    pub token1: EvmAddress,
    pub fee_bps: u32,
    pub liquidity: PoolLiquidity,
    pub tvl_usd: Decimal,
    pub last_updated_ns: u64,
}

impl PoolSnapshot {
    /// A snapshot is stale once it outlives the configured staleness TTL.
    pub fn is_stale(&self, now_ns: u64, staleness_ttl_ns: u64) -> bool {
        now_ns.saturating_sub(self.last_updated_ns) > staleness_ttl_ns
    }

    /// The canonical (sorted) token pair, used as a lookup key.
    pub fn pair_key(&self) -> (EvmAddress, EvmAddress) {
        sorted_pair(self.token0, self.token1)
    }

    /// Which direction a swap from `token_in` takes through this pool.
    /// Returns `None` when the token does not belong to the pool.
    pub fn zero_for_one(&self, token_in: &EvmAddress) -> Option<bool> {
        if *token_in == self.token0 {
            Some(true)
        } else if *token_in == self.token1 {
            Some(false)
        } else {
            None
        }
    }

    /// Counterparty token for a given input token, if it belongs to the pool.
    pub fn other_token(&self, token_in: &EvmAddress) -> Option<EvmAddress> {
        match self.zero_for_one(token_in)? {
            true => Some(self.token1),
            false => Some(self.token0),
        }
    }
}

/// Sort a token pair so both orderings map to the same key.
pub fn sorted_pair(a: EvmAddress, b: EvmAddress) -> (EvmAddress, EvmAddress) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// A per-chain pool state change consumed by discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolUpdate {
    pub chain: ChainId,
    pub dex: DexProtocol,
    pub address: EvmAddress,
    pub token0: EvmAddress,
    pub token1: EvmAddress,
    pub fee_bps: u32,
    pub liquidity: PoolLiquidity,
    pub tvl_usd: Decimal,
    pub timestamp_ns: u64,
}

impl PoolUpdate {
    pub fn pool_id(&self) -> PoolId {
        PoolId::derive(self.chain, self.dex, &self.address)
    }

    pub fn into_snapshot(self) -> PoolSnapshot {
        PoolSnapshot {
            id: self.pool_id(),
            chain: self.chain,
            dex: self.dex,
            address: self.address,
            token0: self.token0,
            token1: self.token1,
            fee_bps: self.fee_bps,
            liquidity: self.liquidity,
            tvl_usd: self.tvl_usd,
            last_updated_ns: self.timestamp_ns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(last_updated_ns: u64) -> PoolSnapshot {
        PoolSnapshot {
            id: PoolId(1),
            chain: ChainId::POLYGON,
            dex: DexProtocol::UniswapV2,
            address: [0xaa; 20],
            token0: [0x01; 20],
            token1: [0x02; 20],
            fee_bps: 30,
            liquidity: PoolLiquidity::V2 {
                reserve0: 1_000,
                reserve1: 2_000,
            },
            tvl_usd: dec!(100000),
            last_updated_ns,
        }
    }

    #[test]
    fn token_decimals_are_bounded() {
        assert!(Token::new(ChainId::ETHEREUM, [0u8; 20], "USDC", 6).is_ok());
        assert!(Token::new(ChainId::ETHEREUM, [0u8; 20], "WEIRD", 36).is_ok());
        assert_eq!(
            Token::new(ChainId::ETHEREUM, [0u8; 20], "BAD", 37),
            Err(MarketError::DecimalsOutOfRange { decimals: 37 })
        );
    }

    #[test]
    fn staleness_respects_ttl() {
        let snap = snapshot(1_000_000_000);
        let ttl = 5_000_000_000; // 5s
        assert!(!snap.is_stale(3_000_000_000, ttl));
        assert!(!snap.is_stale(6_000_000_000, ttl));
        assert!(snap.is_stale(6_000_000_001, ttl));
    }

    #[test]
    fn swap_direction_follows_token_ordering() {
        let snap = snapshot(0);
        assert_eq!(snap.zero_for_one(&[0x01; 20]), Some(true));
        assert_eq!(snap.zero_for_one(&[0x02; 20]), Some(false));
        assert_eq!(snap.zero_for_one(&[0x03; 20]), None);
        assert_eq!(snap.other_token(&[0x01; 20]), Some([0x02; 20]));
    }

    #[test]
    fn pair_key_is_order_independent() {
        let (a, b) = sorted_pair([0x02; 20], [0x01; 20]);
        assert_eq!((a, b), sorted_pair([0x01; 20], [0x02; 20]));
        assert!(a <= b);
    }
}
