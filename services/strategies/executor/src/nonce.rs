//! Per-(chain, signer) nonce ownership.
//!
//! Each chain's executor task is the sole caller for its signer, so assigned
//! nonces form a strictly increasing, gap-free sequence. A conflict observed
//! on-chain (external spend of the account) resyncs from the RPC.

use crate::rpc::BlockchainRpc;
use crate::ExecutionError;
use dashmap::DashMap;
use tracing::warn;
use types::{ChainId, EvmAddress};

#[derive(Default)]
pub struct NonceManager {
    next: DashMap<(u64, EvmAddress), u64>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next nonce for `(chain, signer)`, seeding from the chain
    /// on first use.
    pub async fn next_nonce(
        &self,
        rpc: &dyn BlockchainRpc,
        chain: ChainId,
        signer: EvmAddress,
    ) -> Result<u64, ExecutionError> {
        let key = (chain.0, signer);
        if self.next.get(&key).is_none() {
            let on_chain = rpc.get_transaction_count(signer).await?;
            self.next.entry(key).or_insert(on_chain);
        }

        let mut slot = self
            .next
            .get_mut(&key)
            .ok_or(ExecutionError::NonceConflict { chain })?;
        let nonce = *slot;
        *slot += 1;
        Ok(nonce)
    }

    /// Drop local state after an observed conflict; the next reservation
    /// reseeds from the chain.
    pub fn resync(&self, chain: ChainId, signer: EvmAddress) {
        warn!(chain = %chain, "nonce conflict observed, resyncing from chain");
        self.next.remove(&(chain.0, signer));
    }

    /// Peek without reserving, for diagnostics.
    pub fn peek(&self, chain: ChainId, signer: EvmAddress) -> Option<u64> {
        self.next.get(&(chain.0, signer)).map(|slot| *slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::MockRpc;

    #[tokio::test]
    async fn nonces_are_strictly_increasing_and_gap_free() {
        let rpc = MockRpc::new(1, 1);
        rpc.set_nonce([0xab; 20], 5);
        let manager = NonceManager::new();

        let mut previous = None;
        for _ in 0..10 {
            let nonce = manager
                .next_nonce(&rpc, ChainId::POLYGON, [0xab; 20])
                .await
                .unwrap();
            if let Some(prev) = previous {
                assert_eq!(nonce, prev + 1, "no gaps, no repeats");
            } else {
                assert_eq!(nonce, 5, "seeded from chain");
            }
            previous = Some(nonce);
        }
    }

    #[tokio::test]
    async fn chains_and_signers_are_independent() {
        let rpc = MockRpc::new(1, 1);
        let manager = NonceManager::new();

        let a = manager
            .next_nonce(&rpc, ChainId::POLYGON, [0x01; 20])
            .await
            .unwrap();
        let b = manager
            .next_nonce(&rpc, ChainId::ETHEREUM, [0x01; 20])
            .await
            .unwrap();
        let c = manager
            .next_nonce(&rpc, ChainId::POLYGON, [0x02; 20])
            .await
            .unwrap();
        assert_eq!((a, b, c), (0, 0, 0));
    }

    #[tokio::test]
    async fn resync_reseeds_from_the_chain() {
        let rpc = MockRpc::new(1, 1);
        let manager = NonceManager::new();
        manager
            .next_nonce(&rpc, ChainId::POLYGON, [0x01; 20])
            .await
            .unwrap();

        // External activity moved the account nonce.
        rpc.set_nonce([0x01; 20], 42);
        manager.resync(ChainId::POLYGON, [0x01; 20]);

        let nonce = manager
            .next_nonce(&rpc, ChainId::POLYGON, [0x01; 20])
            .await
            .unwrap();
        assert_eq!(nonce, 42);
    }
}
