//! Concrete, executable routes produced by the planner.

use crate::identifiers::{ChainId, EvmAddress, Fingerprint, OpportunityId};
use crate::opportunity::PoolRef;
use serde::{Deserialize, Serialize};

/// One swap hop of a route, with its slippage-protected minimum output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteLeg {
    pub pool: PoolRef,
    pub token_in: EvmAddress,
    pub token_out: EvmAddress,
    pub amount_in: u128,
    pub expected_amount_out: u128,
    pub min_amount_out: u128,
    pub fee_bps: u32,
    pub gas_estimate: u64,
}

/// A concretized opportunity ready for threat analysis and execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub opportunity_id: OpportunityId,
    pub chain: ChainId,
    pub legs: Vec<RouteLeg>,
    pub amount_in: u128,
    pub expected_amount_out: u128,
    /// End-to-end minimum acceptable output after slippage.
    pub min_amount_out_end: u128,
    pub price_impact_bps: u32,
    pub slippage_bps: u32,
    /// Cap on input size for exact-output plans.
    pub max_amount_in: u128,
    pub gas_estimate: u64,
    pub deadline_ns: u64,
    pub fingerprint: Fingerprint,
}

impl Route {
    /// Slippage law: `min_out = floor(expected × (1 − slippage_bps / 10^4))`.
    pub fn min_out(expected: u128, slippage_bps: u32) -> u128 {
        let keep = 10_000u128.saturating_sub(slippage_bps as u128);
        expected.saturating_mul(keep) / 10_000
    }

    pub fn is_expired(&self, now_ns: u64) -> bool {
        now_ns >= self.deadline_ns
    }

    /// First hop's input token, which is also the cycle's terminal token.
    pub fn entry_token(&self) -> Option<&EvmAddress> {
        self.legs.first().map(|l| &l.token_in)
    }

    /// Legs chain without gaps: each output token feeds the next input.
    pub fn legs_are_contiguous(&self) -> bool {
        self.legs
            .windows(2)
            .all(|pair| pair[0].token_out == pair[1].token_in)
    }
}
