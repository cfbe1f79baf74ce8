//! Candidate arbitrage opportunities emitted by discovery.

use crate::identifiers::{ChainId, DexProtocol, EvmAddress, Fingerprint, OpportunityId, PoolId};
use crate::market::Token;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OpportunityError {
    #[error("token path does not close a cycle: starts at {start} and ends at {end}")]
    OpenCycle { start: String, end: String },

    #[error("token path and legs disagree: {tokens} tokens for {legs} legs")]
    PathLegMismatch { tokens: usize, legs: usize },

    #[error("expires_at {expires_at_ns} is not after detected_at {detected_at_ns}")]
    ExpiryBeforeDetection {
        detected_at_ns: u64,
        expires_at_ns: u64,
    },

    #[error("opportunity has no legs")]
    EmptyLegs,
}

/// Candidate route shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityKind {
    TwoLeg,
    Triangular,
    FlashLoanTwoLeg,
    FlashLoanTriangular,
}

impl OpportunityKind {
    pub fn is_flash_loan(&self) -> bool {
        matches!(
            self,
            OpportunityKind::FlashLoanTwoLeg | OpportunityKind::FlashLoanTriangular
        )
    }

    /// Number of swap legs the kind implies.
    pub fn leg_count(&self) -> usize {
        match self {
            OpportunityKind::TwoLeg | OpportunityKind::FlashLoanTwoLeg => 2,
            OpportunityKind::Triangular | OpportunityKind::FlashLoanTriangular => 3,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            OpportunityKind::TwoLeg => 1,
            OpportunityKind::Triangular => 2,
            OpportunityKind::FlashLoanTwoLeg => 3,
            OpportunityKind::FlashLoanTriangular => 4,
        }
    }
}

/// Reference to a pool inside an opportunity leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolRef {
    pub pool: PoolId,
    pub dex: DexProtocol,
    pub address: EvmAddress,
}

/// A candidate arbitrage, produced by discovery and consumed by the planner
/// as an immutable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: OpportunityId,
    pub kind: OpportunityKind,
    pub chain: ChainId,
    pub legs: Vec<PoolRef>,
    pub token_path: Vec<Token>,
    pub amount_in: u128,
    pub expected_amount_out: u128,
    pub expected_profit_usd: Decimal,
    pub gas_estimate: u64,
    /// Detector confidence in the quote inputs, in `[0, 1]`.
    pub confidence: f64,
    /// Execution risk score, in `[0, 1]`.
    pub risk: f64,
    pub detected_at_ns: u64,
    pub expires_at_ns: u64,
    pub fingerprint: Fingerprint,
    pub schema_version: u32,
}

impl Opportunity {
    /// Validates the cycle and expiry invariants and computes the fingerprint.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: OpportunityId,
        kind: OpportunityKind,
        chain: ChainId,
        legs: Vec<PoolRef>,
        token_path: Vec<Token>,
        amount_in: u128,
        expected_amount_out: u128,
        expected_profit_usd: Decimal,
        gas_estimate: u64,
        confidence: f64,
        risk: f64,
        detected_at_ns: u64,
        expires_at_ns: u64,
    ) -> Result<Self, OpportunityError> {
        if legs.is_empty() {
            return Err(OpportunityError::EmptyLegs);
        }
        if token_path.len() != legs.len() + 1 {
            return Err(OpportunityError::PathLegMismatch {
                tokens: token_path.len(),
                legs: legs.len(),
            });
        }
        let (first, last) = (&token_path[0], &token_path[token_path.len() - 1]);
        if first.address != last.address || first.chain != last.chain {
            return Err(OpportunityError::OpenCycle {
                start: first.symbol.clone(),
                end: last.symbol.clone(),
            });
        }
        if expires_at_ns <= detected_at_ns {
            return Err(OpportunityError::ExpiryBeforeDetection {
                detected_at_ns,
                expires_at_ns,
            });
        }

        let fingerprint = compute_fingerprint(kind, chain, &legs, &token_path, amount_in);
        Ok(Self {
            id,
            kind,
            chain,
            legs,
            token_path,
            amount_in,
            expected_amount_out,
            expected_profit_usd,
            gas_estimate,
            confidence: confidence.clamp(0.0, 1.0),
            risk: risk.clamp(0.0, 1.0),
            detected_at_ns,
            expires_at_ns,
            fingerprint,
            schema_version: crate::SCHEMA_VERSION,
        })
    }

    pub fn is_expired(&self, now_ns: u64) -> bool {
        now_ns >= self.expires_at_ns
    }

    /// The set of pools this opportunity touches, for route exclusion.
    pub fn pool_set(&self) -> Vec<PoolId> {
        self.legs.iter().map(|l| l.pool).collect()
    }
}

/// `H(kind, chain, sorted(legs), token_path, amount_bucket)` over Keccak-256.
///
/// Legs are sorted by pool id so the same pool set fingerprints identically
/// regardless of enumeration order.
pub fn compute_fingerprint(
    kind: OpportunityKind,
    chain: ChainId,
    legs: &[PoolRef],
    token_path: &[Token],
    amount_in: u128,
) -> Fingerprint {
    let mut sorted_pools: Vec<u64> = legs.iter().map(|l| l.pool.0).collect();
    sorted_pools.sort_unstable();

    let mut hasher = Keccak256::new();
    hasher.update([kind.tag()]);
    hasher.update(chain.0.to_be_bytes());
    for pool in &sorted_pools {
        hasher.update(pool.to_be_bytes());
    }
    for token in token_path {
        hasher.update(token.address);
    }
    hasher.update(Fingerprint::amount_bucket(amount_in).to_be_bytes());

    let digest = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    Fingerprint(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn token(byte: u8, symbol: &str) -> Token {
        Token::new(ChainId::POLYGON, [byte; 20], symbol, 18).unwrap()
    }

    fn pool_ref(byte: u8) -> PoolRef {
        let address = [byte; 20];
        PoolRef {
            pool: PoolId::derive(ChainId::POLYGON, DexProtocol::UniswapV2, &address),
            dex: DexProtocol::UniswapV2,
            address,
        }
    }

    fn two_leg(amount_in: u128) -> Result<Opportunity, OpportunityError> {
        Opportunity::new(
            OpportunityId(1),
            OpportunityKind::TwoLeg,
            ChainId::POLYGON,
            vec![pool_ref(0xa1), pool_ref(0xa2)],
            vec![token(1, "USDC"), token(2, "WETH"), token(1, "USDC")],
            amount_in,
            amount_in + 1,
            dec!(13.0),
            300_000,
            0.9,
            0.1,
            1_000,
            2_000,
        )
    }

    #[test]
    fn cycle_invariant_is_enforced() {
        let err = Opportunity::new(
            OpportunityId(1),
            OpportunityKind::TwoLeg,
            ChainId::POLYGON,
            vec![pool_ref(0xa1), pool_ref(0xa2)],
            vec![token(1, "USDC"), token(2, "WETH"), token(3, "DAI")],
            1,
            2,
            dec!(1),
            1,
            0.5,
            0.5,
            1,
            2,
        )
        .unwrap_err();
        assert!(matches!(err, OpportunityError::OpenCycle { .. }));
    }

    #[test]
    fn expiry_must_follow_detection() {
        let err = Opportunity::new(
            OpportunityId(1),
            OpportunityKind::TwoLeg,
            ChainId::POLYGON,
            vec![pool_ref(0xa1), pool_ref(0xa2)],
            vec![token(1, "USDC"), token(2, "WETH"), token(1, "USDC")],
            1,
            2,
            dec!(1),
            1,
            0.5,
            0.5,
            2_000,
            2_000,
        )
        .unwrap_err();
        assert!(matches!(err, OpportunityError::ExpiryBeforeDetection { .. }));
    }

    #[test]
    fn fingerprint_is_stable_and_leg_order_independent() {
        let a = two_leg(1_000_000).unwrap();
        let b = two_leg(1_000_000).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);

        let reversed = Opportunity::new(
            OpportunityId(9),
            OpportunityKind::TwoLeg,
            ChainId::POLYGON,
            vec![pool_ref(0xa2), pool_ref(0xa1)],
            vec![token(1, "USDC"), token(2, "WETH"), token(1, "USDC")],
            1_000_000,
            1_000_001,
            dec!(13.0),
            250_000,
            0.9,
            0.1,
            5_000,
            6_000,
        )
        .unwrap();
        assert_eq!(a.fingerprint, reversed.fingerprint);
    }

    #[test]
    fn fingerprint_changes_across_amount_buckets() {
        let small = two_leg(1_000_000).unwrap();
        let near = two_leg(1_100_000).unwrap();
        let large = two_leg(100_000_000).unwrap();
        assert_eq!(small.fingerprint, near.fingerprint);
        assert_ne!(small.fingerprint, large.fingerprint);
    }
}
