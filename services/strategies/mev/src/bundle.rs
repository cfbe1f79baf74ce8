//! Atomic bundle construction for private relay submission.

use serde::{Deserialize, Serialize};
use types::EvmAddress;

/// An ordered group of raw signed transactions targeting one block. For a
/// flash-loan route the order is `[borrow, swaps.., repay]`; reverting any
/// member reverts the whole bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// RLP-encoded signed transactions, in execution order.
    pub transactions: Vec<Vec<u8>>,
    pub target_block: u64,
    pub min_timestamp: Option<u64>,
    pub max_timestamp: Option<u64>,
    /// Tx hashes allowed to revert without invalidating the bundle.
    pub reverting_hashes: Vec<[u8; 32]>,
    pub refund_recipient: Option<EvmAddress>,
}

impl Bundle {
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Hex-encoded transactions for the relay wire format.
    pub fn encoded_transactions(&self) -> Vec<String> {
        self.transactions
            .iter()
            .map(|raw| format!("0x{}", hex::encode(raw)))
            .collect()
    }

    /// Rebuild the same bundle against a later block after an inclusion miss.
    pub fn retargeted(&self, target_block: u64) -> Self {
        Self {
            target_block,
            ..self.clone()
        }
    }
}

pub struct BundleBuilder {
    bundle: Bundle,
}

impl BundleBuilder {
    pub fn new(target_block: u64) -> Self {
        Self {
            bundle: Bundle {
                transactions: Vec::new(),
                target_block,
                min_timestamp: None,
                max_timestamp: None,
                reverting_hashes: Vec::new(),
                refund_recipient: None,
            },
        }
    }

    pub fn add_transaction(mut self, raw_signed: Vec<u8>) -> Self {
        self.bundle.transactions.push(raw_signed);
        self
    }

    pub fn timestamp_range(mut self, min: Option<u64>, max: Option<u64>) -> Self {
        self.bundle.min_timestamp = min;
        self.bundle.max_timestamp = max;
        self
    }

    pub fn allow_reverting(mut self, tx_hash: [u8; 32]) -> Self {
        self.bundle.reverting_hashes.push(tx_hash);
        self
    }

    pub fn refund_to(mut self, recipient: EvmAddress) -> Self {
        self.bundle.refund_recipient = Some(recipient);
        self
    }

    pub fn build(self) -> Bundle {
        self.bundle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_preserves_transaction_order() {
        let bundle = BundleBuilder::new(100)
            .add_transaction(vec![0x01]) // borrow
            .add_transaction(vec![0x02]) // swap
            .add_transaction(vec![0x03]) // repay
            .refund_to([0xee; 20])
            .build();

        assert_eq!(bundle.transaction_count(), 3);
        assert_eq!(bundle.transactions, vec![vec![0x01], vec![0x02], vec![0x03]]);
        assert_eq!(bundle.encoded_transactions()[1], "0x02");
        assert_eq!(bundle.refund_recipient, Some([0xee; 20]));
    }

    #[test]
    fn retargeting_only_moves_the_block() {
        let bundle = BundleBuilder::new(100).add_transaction(vec![0xff]).build();
        let moved = bundle.retargeted(103);
        assert_eq!(moved.target_block, 103);
        assert_eq!(moved.transactions, bundle.transactions);
    }
}
