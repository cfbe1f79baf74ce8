//! Ordered fallback strategies for failed or threatened executions.

use types::{PoolId, ProtectionLevel, Route};

/// Why the current attempt cannot proceed as planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackTrigger {
    HighMevRisk,
    CriticalThreat,
    /// Non-MEV failure: revert, timeout, or submission error.
    ExecutionFailure,
}

/// What to do next. Amount scaling is in bps of the original input
/// (10_000 = unchanged, 11_000 = ×1.10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackAction {
    RetryWithProtection {
        level: ProtectionLevel,
        extra_slippage_bps: u32,
    },
    UseAlternativeRoute {
        exclude: Vec<PoolId>,
        amount_scale_bps: u32,
    },
    Abort,
}

pub struct FallbackPolicy {
    emergency_stop: bool,
    max_retries: u32,
}

impl FallbackPolicy {
    pub fn new(emergency_stop: bool, max_retries: u32) -> Self {
        Self {
            emergency_stop,
            max_retries,
        }
    }

    /// Map a trigger to the next action for this attempt.
    pub fn decide(
        &self,
        trigger: FallbackTrigger,
        current_level: ProtectionLevel,
        attempt: u32,
        route: &Route,
    ) -> FallbackAction {
        match trigger {
            FallbackTrigger::HighMevRisk => {
                if attempt >= self.max_retries {
                    return FallbackAction::Abort;
                }
                FallbackAction::RetryWithProtection {
                    level: current_level.escalate(),
                    extra_slippage_bps: 50,
                }
            }
            FallbackTrigger::CriticalThreat => {
                if self.emergency_stop {
                    return FallbackAction::Abort;
                }
                FallbackAction::UseAlternativeRoute {
                    exclude: route.legs.iter().map(|l| l.pool.pool).collect(),
                    amount_scale_bps: 10_000,
                }
            }
            FallbackTrigger::ExecutionFailure => FallbackAction::UseAlternativeRoute {
                exclude: route.legs.iter().map(|l| l.pool.pool).collect(),
                amount_scale_bps: 11_000, // amount_in × 1.10
            },
        }
    }
}

/// Apply an amount scale in bps.
pub fn scale_amount(amount: u128, scale_bps: u32) -> u128 {
    amount.saturating_mul(scale_bps as u128) / 10_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{ChainId, DexProtocol, Fingerprint, OpportunityId, PoolRef, RouteLeg};

    fn route() -> Route {
        let leg = |byte: u8| RouteLeg {
            pool: PoolRef {
                pool: PoolId(byte as u64),
                dex: DexProtocol::UniswapV2,
                address: [byte; 20],
            },
            token_in: [0x01; 20],
            token_out: [0x02; 20],
            amount_in: 1_000,
            expected_amount_out: 1_010,
            min_amount_out: 1_005,
            fee_bps: 30,
            gas_estimate: 120_000,
        };
        Route {
            opportunity_id: OpportunityId(1),
            chain: ChainId::POLYGON,
            legs: vec![leg(1), leg(2)],
            amount_in: 1_000,
            expected_amount_out: 1_010,
            min_amount_out_end: 1_005,
            price_impact_bps: 40,
            slippage_bps: 50,
            max_amount_in: 1_000,
            gas_estimate: 261_000,
            deadline_ns: u64::MAX,
            fingerprint: Fingerprint([0u8; 32]),
        }
    }

    #[test]
    fn high_mev_risk_escalates_protection_until_retries_exhaust() {
        let policy = FallbackPolicy::new(false, 2);
        let action = policy.decide(
            FallbackTrigger::HighMevRisk,
            ProtectionLevel::Standard,
            0,
            &route(),
        );
        assert_eq!(
            action,
            FallbackAction::RetryWithProtection {
                level: ProtectionLevel::Advanced,
                extra_slippage_bps: 50,
            }
        );

        let exhausted = policy.decide(
            FallbackTrigger::HighMevRisk,
            ProtectionLevel::Advanced,
            2,
            &route(),
        );
        assert_eq!(exhausted, FallbackAction::Abort);
    }

    #[test]
    fn critical_threat_respects_emergency_stop() {
        let stopped = FallbackPolicy::new(true, 3);
        assert_eq!(
            stopped.decide(
                FallbackTrigger::CriticalThreat,
                ProtectionLevel::Standard,
                0,
                &route()
            ),
            FallbackAction::Abort
        );

        let running = FallbackPolicy::new(false, 3);
        match running.decide(
            FallbackTrigger::CriticalThreat,
            ProtectionLevel::Standard,
            0,
            &route(),
        ) {
            FallbackAction::UseAlternativeRoute {
                exclude,
                amount_scale_bps,
            } => {
                assert_eq!(exclude, vec![PoolId(1), PoolId(2)]);
                assert_eq!(amount_scale_bps, 10_000);
            }
            other => panic!("expected alternative route, got {other:?}"),
        }
    }

    #[test]
    fn execution_failure_scales_the_retry_up_ten_percent() {
        let policy = FallbackPolicy::new(false, 3);
        match policy.decide(
            FallbackTrigger::ExecutionFailure,
            ProtectionLevel::Standard,
            0,
            &route(),
        ) {
            FallbackAction::UseAlternativeRoute {
                amount_scale_bps, ..
            } => {
                assert_eq!(amount_scale_bps, 11_000);
                assert_eq!(scale_amount(1_000, amount_scale_bps), 1_100);
            }
            other => panic!("expected alternative route, got {other:?}"),
        }
    }
}
