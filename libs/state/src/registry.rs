//! Concurrent pool and token registries.

use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use types::market::sorted_pair;
use types::{ChainId, EvmAddress, PoolId, PoolSnapshot, PoolUpdate, Token};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("pool {pool} not found")]
    PoolNotFound { pool: PoolId },

    #[error("token 0x{address} not registered on chain {chain}", address = hex::encode(.address))]
    TokenNotFound { chain: ChainId, address: EvmAddress },
}

/// Arena of published pool snapshots with pair and address indexes.
#[derive(Default)]
pub struct PoolRegistry {
    pools: DashMap<PoolId, Arc<PoolSnapshot>>,
    by_pair: DashMap<(EvmAddress, EvmAddress), Vec<PoolId>>,
    by_address: DashMap<(ChainId, EvmAddress), PoolId>,
    by_token: DashMap<EvmAddress, Vec<PoolId>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a fresh snapshot, replacing any previous one wholesale.
    /// Returns the pool id and whether the pool is new to the registry.
    pub fn publish(&self, update: PoolUpdate) -> (PoolId, bool) {
        let snapshot = update.into_snapshot();
        let id = snapshot.id;
        let pair = snapshot.pair_key();
        let address_key = (snapshot.chain, snapshot.address);

        let is_new = !self.pools.contains_key(&id);
        if is_new {
            self.by_pair.entry(pair).or_default().push(id);
            self.by_address.insert(address_key, id);
            self.by_token.entry(snapshot.token0).or_default().push(id);
            self.by_token.entry(snapshot.token1).or_default().push(id);
            debug!(pool = %id, dex = %snapshot.dex, "registered new pool");
        }
        self.pools.insert(id, Arc::new(snapshot));
        (id, is_new)
    }

    pub fn get(&self, id: PoolId) -> Result<Arc<PoolSnapshot>, StateError> {
        self.pools
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StateError::PoolNotFound { pool: id })
    }

    pub fn get_by_address(&self, chain: ChainId, address: &EvmAddress) -> Option<Arc<PoolSnapshot>> {
        let id = *self.by_address.get(&(chain, *address))?;
        self.pools.get(&id).map(|entry| entry.value().clone())
    }

    /// All pools trading the given token pair, either ordering.
    pub fn pools_for_pair(&self, a: &EvmAddress, b: &EvmAddress) -> Vec<Arc<PoolSnapshot>> {
        let key = sorted_pair(*a, *b);
        let Some(ids) = self.by_pair.get(&key) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.pools.get(id).map(|entry| entry.value().clone()))
            .collect()
    }

    /// Pools for a pair with stale snapshots filtered out.
    pub fn fresh_pools_for_pair(
        &self,
        a: &EvmAddress,
        b: &EvmAddress,
        now_ns: u64,
        staleness_ttl_ns: u64,
    ) -> Vec<Arc<PoolSnapshot>> {
        self.pools_for_pair(a, b)
            .into_iter()
            .filter(|p| !p.is_stale(now_ns, staleness_ttl_ns))
            .collect()
    }

    /// All pools with the given token on either side.
    pub fn pools_for_token(&self, token: &EvmAddress) -> Vec<Arc<PoolSnapshot>> {
        let Some(ids) = self.by_token.get(token) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.pools.get(id).map(|entry| entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

/// Token metadata arena keyed by `(chain, address)`.
#[derive(Default)]
pub struct TokenRegistry {
    tokens: DashMap<(ChainId, EvmAddress), Token>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, token: Token) {
        self.tokens.insert((token.chain, token.address), token);
    }

    pub fn get(&self, chain: ChainId, address: &EvmAddress) -> Result<Token, StateError> {
        self.tokens
            .get(&(chain, *address))
            .map(|entry| entry.value().clone())
            .ok_or(StateError::TokenNotFound {
                chain,
                address: *address,
            })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use types::{DexProtocol, PoolLiquidity};

    fn update(address: [u8; 20], reserve0: u128, timestamp_ns: u64) -> PoolUpdate {
        PoolUpdate {
            chain: ChainId::POLYGON,
            dex: DexProtocol::UniswapV2,
            address,
            token0: [0x01; 20],
            token1: [0x02; 20],
            fee_bps: 30,
            liquidity: PoolLiquidity::V2 {
                reserve0,
                reserve1: 2_000,
            },
            tvl_usd: dec!(50000),
            timestamp_ns,
        }
    }

    #[test]
    fn publish_replaces_snapshot_wholesale() {
        let registry = PoolRegistry::new();
        let (id, is_new) = registry.publish(update([0xaa; 20], 1_000, 100));
        assert!(is_new);

        let (same_id, is_new) = registry.publish(update([0xaa; 20], 5_000, 200));
        assert_eq!(id, same_id);
        assert!(!is_new);

        let snap = registry.get(id).unwrap();
        assert_eq!(snap.last_updated_ns, 200);
        assert_eq!(
            snap.liquidity,
            PoolLiquidity::V2 {
                reserve0: 5_000,
                reserve1: 2_000
            }
        );
    }

    #[test]
    fn pair_lookup_finds_all_venues_in_either_order() {
        let registry = PoolRegistry::new();
        registry.publish(update([0xaa; 20], 1_000, 100));
        registry.publish(update([0xbb; 20], 3_000, 100));

        assert_eq!(registry.pools_for_pair(&[0x01; 20], &[0x02; 20]).len(), 2);
        assert_eq!(registry.pools_for_pair(&[0x02; 20], &[0x01; 20]).len(), 2);
        assert!(registry.pools_for_pair(&[0x01; 20], &[0x03; 20]).is_empty());
    }

    #[test]
    fn stale_pools_are_filtered() {
        let registry = PoolRegistry::new();
        registry.publish(update([0xaa; 20], 1_000, 1_000_000_000));
        registry.publish(update([0xbb; 20], 3_000, 9_000_000_000));

        let fresh =
            registry.fresh_pools_for_pair(&[0x01; 20], &[0x02; 20], 10_000_000_000, 5_000_000_000);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].address, [0xbb; 20]);
    }

    #[test]
    fn missing_pool_is_an_error() {
        let registry = PoolRegistry::new();
        assert_eq!(
            registry.get(PoolId(42)).unwrap_err(),
            StateError::PoolNotFound { pool: PoolId(42) }
        );
    }

    #[test]
    fn token_registry_round_trips() {
        let tokens = TokenRegistry::new();
        let usdc = Token::new(ChainId::POLYGON, [0x01; 20], "USDC", 6).unwrap();
        tokens.register(usdc.clone());
        assert_eq!(tokens.get(ChainId::POLYGON, &[0x01; 20]).unwrap(), usdc);
        assert!(tokens.get(ChainId::ETHEREUM, &[0x01; 20]).is_err());
    }
}
