//! Threat classification from mempool and pool-state signals.
//!
//! Each recognized signal emits a weighted severity contribution; the sum is
//! thresholded into a [`ThreatLevel`]. Signal order follows attack frequency:
//! sandwich, then front-run, then back-run exposure, then oracle anomalies.

use config::MevConfig;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashSet;
use types::{
    EvmAddress, MevAction, MevAnalysis, PoolId, Route, Threat, ThreatLevel, ThreatType,
};

/// A pending transaction observed in the public mempool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MempoolSignal {
    PendingSwap {
        pool: PoolId,
        gas_price_wei: u128,
        token_path: Vec<EvmAddress>,
        /// Whether the pending tx targets the same router contract we use.
        same_router: bool,
    },
}

/// Pool-state anomalies that suggest oracle manipulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PoolAnomaly {
    TvlDrop { pool: PoolId, drop_pct: f64 },
    OracleDeviation { pool: PoolId, deviation_bps: u32 },
}

pub struct ThreatAnalyzer {
    config: MevConfig,
}

impl ThreatAnalyzer {
    pub fn new(config: MevConfig) -> Self {
        Self { config }
    }

    /// Analyze one route against the currently observed signals.
    /// `route_value_usd` scales the loss estimates; `base_gas_price_wei` is
    /// the prevailing network price used to spot gas bidding.
    pub fn analyze(
        &self,
        route: &Route,
        route_value_usd: Decimal,
        base_gas_price_wei: u128,
        signals: &[MempoolSignal],
        anomalies: &[PoolAnomaly],
    ) -> MevAnalysis {
        let route_pools: HashSet<PoolId> = route.legs.iter().map(|l| l.pool.pool).collect();
        let route_tokens: HashSet<EvmAddress> = route
            .legs
            .iter()
            .flat_map(|l| [l.token_in, l.token_out])
            .collect();

        let mut threats = Vec::new();
        let mut actions = Vec::new();

        // (a) Sandwich: pending swaps on our pools bidding gas above base.
        let sandwich_severity = self.sandwich_severity(&route_pools, base_gas_price_wei, signals);
        if sandwich_severity > 0.0 {
            threats.push(Threat {
                kind: ThreatType::Sandwich,
                severity: sandwich_severity * self.config.sandwich_weight,
                est_loss_usd: route_value_usd
                    * Decimal::from(route.slippage_bps)
                    / Decimal::from(10_000),
            });
            actions.push(MevAction::UsePrivateMempool);
            actions.push(MevAction::AdjustSlippage { delta_bps: -10 });
        }

        // (b) Front-run: same router, higher gas, overlapping token path.
        let frontrun_severity =
            self.frontrun_severity(&route_tokens, base_gas_price_wei, signals);
        if frontrun_severity > 0.0 {
            threats.push(Threat {
                kind: ThreatType::Frontrun,
                severity: frontrun_severity * self.config.frontrun_weight,
                est_loss_usd: route_value_usd
                    * Decimal::from_f64(0.3 * frontrun_severity).unwrap_or_default(),
            });
            actions.push(MevAction::UsePrivateMempool);
        }

        // (c) Back-run: our own slippage headroom invites tail extraction.
        if route.slippage_bps > self.config.backrun_headroom_bps {
            let excess = route.slippage_bps - self.config.backrun_headroom_bps;
            let severity =
                (excess as f64 / self.config.backrun_headroom_bps.max(1) as f64).min(1.0);
            threats.push(Threat {
                kind: ThreatType::Backrun,
                severity: severity * self.config.backrun_weight,
                est_loss_usd: route_value_usd * Decimal::from(excess) / Decimal::from(10_000),
            });
            actions.push(MevAction::AdjustSlippage {
                delta_bps: -(excess as i32),
            });
        }

        // (d) Oracle manipulation: sudden TVL drops or price deviation.
        let oracle_severity = self.oracle_severity(&route_pools, anomalies);
        if oracle_severity > 0.0 {
            threats.push(Threat {
                kind: ThreatType::OracleManipulation,
                severity: oracle_severity * self.config.oracle_weight,
                est_loss_usd: route_value_usd
                    * Decimal::from_f64(0.5 * oracle_severity).unwrap_or_default(),
            });
            if oracle_severity >= 0.8 {
                actions.push(MevAction::CancelTx);
            } else {
                actions.push(MevAction::DelayExecution { blocks: 2 });
            }
        }

        let score: f64 = threats.iter().map(|t| t.severity).sum::<f64>().min(1.0);
        MevAnalysis {
            threat_level: ThreatLevel::from_score(score),
            score,
            threats,
            recommended_actions: actions,
        }
    }

    fn sandwich_severity(
        &self,
        route_pools: &HashSet<PoolId>,
        base_gas_price_wei: u128,
        signals: &[MempoolSignal],
    ) -> f64 {
        let mut severity: f64 = 0.0;
        for signal in signals {
            let MempoolSignal::PendingSwap {
                pool,
                gas_price_wei,
                ..
            } = signal;
            if !route_pools.contains(pool) || *gas_price_wei <= base_gas_price_wei {
                continue;
            }
            // Gas bidding intensity maps to severity.
            let ratio = *gas_price_wei as f64 / base_gas_price_wei.max(1) as f64;
            severity = severity.max((0.5 + (ratio - 1.0)).min(1.0));
        }
        severity
    }

    fn frontrun_severity(
        &self,
        route_tokens: &HashSet<EvmAddress>,
        base_gas_price_wei: u128,
        signals: &[MempoolSignal],
    ) -> f64 {
        for signal in signals {
            let MempoolSignal::PendingSwap {
                gas_price_wei,
                token_path,
                same_router,
                ..
            } = signal;
            if !same_router || *gas_price_wei <= base_gas_price_wei {
                continue;
            }
            if token_path.iter().any(|t| route_tokens.contains(t)) {
                return 1.0;
            }
        }
        0.0
    }

    fn oracle_severity(&self, route_pools: &HashSet<PoolId>, anomalies: &[PoolAnomaly]) -> f64 {
        let mut severity: f64 = 0.0;
        for anomaly in anomalies {
            match anomaly {
                PoolAnomaly::TvlDrop { pool, drop_pct } => {
                    if route_pools.contains(pool) && *drop_pct >= self.config.tvl_drop_alert_pct {
                        severity = severity.max(drop_pct.min(1.0));
                    }
                }
                PoolAnomaly::OracleDeviation { pool, deviation_bps } => {
                    if route_pools.contains(pool)
                        && *deviation_bps > self.config.max_deviation_bps
                    {
                        let ratio = *deviation_bps as f64
                            / (2.0 * self.config.max_deviation_bps.max(1) as f64);
                        severity = severity.max(ratio.min(1.0));
                    }
                }
            }
        }
        severity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use types::{DexProtocol, Fingerprint, OpportunityId, PoolRef, RouteLeg};

    const GWEI: u128 = 1_000_000_000;

    fn route(slippage_bps: u32) -> Route {
        let leg = |byte: u8| RouteLeg {
            pool: PoolRef {
                pool: PoolId(byte as u64),
                dex: DexProtocol::UniswapV2,
                address: [byte; 20],
            },
            token_in: [0x01; 20],
            token_out: [0x02; 20],
            amount_in: 1_000_000,
            expected_amount_out: 1_000_000,
            min_amount_out: 990_000,
            fee_bps: 30,
            gas_estimate: 120_000,
        };
        Route {
            opportunity_id: OpportunityId(1),
            chain: types::ChainId::POLYGON,
            legs: vec![leg(1), leg(2)],
            amount_in: 1_000_000,
            expected_amount_out: 1_010_000,
            min_amount_out_end: 1_004_950,
            price_impact_bps: 40,
            slippage_bps,
            max_amount_in: 1_000_000,
            gas_estimate: 261_000,
            deadline_ns: u64::MAX,
            fingerprint: Fingerprint([0u8; 32]),
        }
    }

    fn analyzer() -> ThreatAnalyzer {
        ThreatAnalyzer::new(MevConfig::default())
    }

    #[test]
    fn quiet_mempool_scores_none() {
        let analysis = analyzer().analyze(&route(50), dec!(1000), 30 * GWEI, &[], &[]);
        assert_eq!(analysis.threat_level, ThreatLevel::None);
        assert!(analysis.threats.is_empty());
    }

    #[test]
    fn mirrored_swap_with_gas_bidding_reads_as_sandwich() {
        let signals = vec![MempoolSignal::PendingSwap {
            pool: PoolId(1),
            gas_price_wei: 60 * GWEI, // 2x base
            token_path: vec![[0x01; 20], [0x02; 20]],
            same_router: false,
        }];
        let analysis = analyzer().analyze(&route(50), dec!(1000), 30 * GWEI, &signals, &[]);

        assert!(analysis
            .threats
            .iter()
            .any(|t| t.kind == ThreatType::Sandwich));
        assert!(analysis.threat_level >= ThreatLevel::Medium);
        assert!(analysis
            .recommended_actions
            .contains(&MevAction::UsePrivateMempool));
    }

    #[test]
    fn same_router_overlap_reads_as_frontrun_and_stacks_to_high() {
        let signals = vec![
            MempoolSignal::PendingSwap {
                pool: PoolId(1),
                gas_price_wei: 60 * GWEI,
                token_path: vec![[0x01; 20], [0x02; 20]],
                same_router: false,
            },
            MempoolSignal::PendingSwap {
                pool: PoolId(99), // not our pool, but our router and tokens
                gas_price_wei: 45 * GWEI,
                token_path: vec![[0x02; 20], [0x03; 20]],
                same_router: true,
            },
        ];
        let analysis = analyzer().analyze(&route(50), dec!(1000), 30 * GWEI, &signals, &[]);

        assert!(analysis
            .threats
            .iter()
            .any(|t| t.kind == ThreatType::Frontrun));
        assert!(analysis.threat_level >= ThreatLevel::High);
    }

    #[test]
    fn wide_slippage_flags_backrun_exposure() {
        // headroom default is 100 bps; 250 bps is wide open.
        let analysis = analyzer().analyze(&route(250), dec!(1000), 30 * GWEI, &[], &[]);
        let backrun = analysis
            .threats
            .iter()
            .find(|t| t.kind == ThreatType::Backrun)
            .expect("backrun flagged");
        assert!(backrun.severity > 0.0);
        assert!(analysis
            .recommended_actions
            .iter()
            .any(|a| matches!(a, MevAction::AdjustSlippage { delta_bps } if *delta_bps < 0)));
    }

    #[test]
    fn severe_oracle_deviation_recommends_cancel() {
        let anomalies = vec![PoolAnomaly::OracleDeviation {
            pool: PoolId(1),
            deviation_bps: 400, // 4x the 100 bps limit
        }];
        let analysis = analyzer().analyze(&route(50), dec!(1000), 30 * GWEI, &[], &anomalies);
        assert!(analysis
            .recommended_actions
            .contains(&MevAction::CancelTx));
    }

    #[test]
    fn anomalies_on_unrelated_pools_are_ignored() {
        let anomalies = vec![PoolAnomaly::TvlDrop {
            pool: PoolId(77),
            drop_pct: 0.9,
        }];
        let analysis = analyzer().analyze(&route(50), dec!(1000), 30 * GWEI, &[], &anomalies);
        assert_eq!(analysis.threat_level, ThreatLevel::None);
    }
}
