//! Protection controller: strategy selection, gas competitiveness, deadlines.

use crate::MevError;
use config::MevConfig;
use coordinator::Metrics;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use types::{
    MevAction, MevAnalysis, ProtectionLevel, Submission, SubmissionStrategy, ThreatLevel, TxDraft,
};

pub struct ProtectionController {
    config: MevConfig,
    level: ProtectionLevel,
    metrics: Option<Arc<Metrics>>,
}

impl ProtectionController {
    pub fn new(config: MevConfig) -> Result<Self, MevError> {
        let level = parse_level(&config.protection_level)?;
        Ok(Self {
            config,
            level,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn level(&self) -> ProtectionLevel {
        self.level
    }

    /// Override the configured posture; the retry-with-protection fallback
    /// escalates one step through this.
    pub fn at_level(&self, level: ProtectionLevel) -> Self {
        Self {
            config: self.config.clone(),
            level,
            metrics: self.metrics.clone(),
        }
    }

    /// Decide how the draft transaction reaches the chain.
    #[allow(clippy::too_many_arguments)]
    pub fn choose(
        &self,
        analysis: &MevAnalysis,
        draft: TxDraft,
        base_gas_price_wei: u128,
        gas_limit: u64,
        current_block: u64,
        now_ns: u64,
        base_deadline_minutes: u64,
    ) -> Result<Submission, MevError> {
        // CancelTx beats everything else.
        if analysis
            .recommended_actions
            .contains(&MevAction::CancelTx)
        {
            warn!("protection controller cancelling transaction");
            self.count_triggers(analysis);
            return Err(MevError::Cancelled);
        }

        let mut strategy =
            select_strategy(analysis.threat_level, self.level, self.config.emergency_stop)?;

        // Any recommended delay upgrades the strategy to Delayed.
        let mut target_block = None;
        for action in &analysis.recommended_actions {
            if let MevAction::DelayExecution { blocks } = action {
                strategy = SubmissionStrategy::Delayed;
                target_block = Some(current_block + blocks.max(&1));
            }
        }
        if strategy == SubmissionStrategy::PrivateBundle && target_block.is_none() {
            target_block = Some(current_block + 1);
        }

        let gas_price_wei = match strategy {
            SubmissionStrategy::Protected => {
                scale_gas(base_gas_price_wei, analysis.threat_level.gas_multiplier())
            }
            _ => base_gas_price_wei,
        };

        let slippage_adjustment_bps = analysis
            .recommended_actions
            .iter()
            .filter_map(|a| match a {
                MevAction::AdjustSlippage { delta_bps } => Some(*delta_bps),
                _ => None,
            })
            .sum();

        let deadline_minutes = base_deadline_minutes
            + self.level.deadline_adj_minutes()
            + analysis.threat_level.deadline_adj_minutes();
        let deadline_ns = now_ns + deadline_minutes.saturating_mul(60_000_000_000);

        if strategy != SubmissionStrategy::Direct {
            self.count_triggers(analysis);
        }
        info!(
            strategy = strategy.as_str(),
            threat = ?analysis.threat_level,
            level = ?self.level,
            "submission strategy selected"
        );

        Ok(Submission {
            strategy,
            tx: draft,
            gas_price_wei,
            gas_limit,
            target_block,
            bundle_id: None, // issued by the relay at submission time
            deadline_ns,
            slippage_adjustment_bps,
        })
    }

    fn count_triggers(&self, analysis: &MevAnalysis) {
        if let Some(metrics) = &self.metrics {
            for threat in &analysis.threats {
                metrics
                    .mev_protection_triggered_total
                    .with_label_values(&[threat.kind.as_str()])
                    .inc();
            }
        }
    }
}

fn parse_level(level: &str) -> Result<ProtectionLevel, MevError> {
    match level {
        "basic" => Ok(ProtectionLevel::Basic),
        "standard" => Ok(ProtectionLevel::Standard),
        "advanced" => Ok(ProtectionLevel::Advanced),
        "maximum" => Ok(ProtectionLevel::Maximum),
        other => Err(MevError::InvalidLevel(other.to_string())),
    }
}

/// The threat × protection selection table.
fn select_strategy(
    threat: ThreatLevel,
    level: ProtectionLevel,
    emergency_stop: bool,
) -> Result<SubmissionStrategy, MevError> {
    use ProtectionLevel::*;
    use SubmissionStrategy::*;
    use ThreatLevel as T;

    Ok(match (threat, level) {
        (T::None | T::Low, Basic) => Direct,
        (T::None | T::Low, _) => Protected,

        (T::Medium, Basic) => Direct,
        (T::Medium, Standard | Advanced) => Protected,
        (T::Medium, Maximum) => PrivateBundle,

        (T::High, Basic | Standard) => Protected,
        (T::High, Advanced | Maximum) => PrivateBundle,

        (T::Critical, Basic) => {
            if emergency_stop {
                return Err(MevError::Aborted);
            }
            Protected
        }
        (T::Critical, Standard | Advanced) => PrivateBundle,
        (T::Critical, Maximum) => return Err(MevError::Aborted),
    })
}

/// Multiply a wei price by a decimal factor, rounding down.
fn scale_gas(base_wei: u128, multiplier: Decimal) -> u128 {
    let scaled = Decimal::from(base_wei.min(u64::MAX as u128) as u64) * multiplier;
    scaled.to_u128().unwrap_or(base_wei)
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{ChainId, Threat, ThreatType};

    const GWEI: u128 = 1_000_000_000;

    fn draft() -> TxDraft {
        TxDraft {
            chain: ChainId::POLYGON,
            to: [0xaa; 20],
            data: vec![0x01, 0x02],
            value: 0,
        }
    }

    fn analysis(level: ThreatLevel, actions: Vec<MevAction>) -> MevAnalysis {
        MevAnalysis {
            threat_level: level,
            score: 0.0,
            threats: vec![Threat {
                kind: ThreatType::Sandwich,
                severity: 0.5,
                est_loss_usd: Decimal::ZERO,
            }],
            recommended_actions: actions,
        }
    }

    fn controller(level: &str, emergency_stop: bool) -> ProtectionController {
        let config = MevConfig {
            protection_level: level.to_string(),
            emergency_stop,
            ..MevConfig::default()
        };
        ProtectionController::new(config).unwrap()
    }

    #[test]
    fn selection_table_covers_every_pairing() {
        use ProtectionLevel::*;
        use SubmissionStrategy::*;
        use ThreatLevel as T;

        let cases = [
            (T::None, Basic, Direct),
            (T::Low, Standard, Protected),
            (T::Low, Maximum, Protected),
            (T::Medium, Basic, Direct),
            (T::Medium, Standard, Protected),
            (T::Medium, Maximum, PrivateBundle),
            (T::High, Basic, Protected),
            (T::High, Standard, Protected),
            (T::High, Advanced, PrivateBundle),
            (T::High, Maximum, PrivateBundle),
            (T::Critical, Basic, Protected), // emergency_stop off
            (T::Critical, Standard, PrivateBundle),
            (T::Critical, Advanced, PrivateBundle),
        ];
        for (threat, level, expected) in cases {
            assert_eq!(
                select_strategy(threat, level, false).unwrap(),
                expected,
                "({threat:?}, {level:?})"
            );
        }

        assert!(matches!(
            select_strategy(T::Critical, Maximum, false),
            Err(MevError::Aborted)
        ));
        assert!(matches!(
            select_strategy(T::Critical, Basic, true),
            Err(MevError::Aborted)
        ));
    }

    #[test]
    fn protected_gas_scales_with_threat_level() {
        let controller = controller("standard", false);
        let submission = controller
            .choose(
                &analysis(ThreatLevel::High, vec![]),
                draft(),
                30 * GWEI,
                500_000,
                100,
                0,
                5,
            )
            .unwrap();
        assert_eq!(submission.strategy, SubmissionStrategy::Protected);
        assert_eq!(submission.gas_price_wei, 39 * GWEI); // 30 × 1.30
    }

    #[test]
    fn delay_action_upgrades_to_delayed_with_future_block() {
        let controller = controller("standard", false);
        let submission = controller
            .choose(
                &analysis(
                    ThreatLevel::Medium,
                    vec![MevAction::DelayExecution { blocks: 3 }],
                ),
                draft(),
                30 * GWEI,
                500_000,
                100,
                0,
                5,
            )
            .unwrap();
        assert_eq!(submission.strategy, SubmissionStrategy::Delayed);
        assert_eq!(submission.target_block, Some(103));
        assert!(submission.target_block.unwrap() > 100);
    }

    #[test]
    fn cancel_action_aborts_with_cancelled() {
        let controller = controller("standard", false);
        let err = controller
            .choose(
                &analysis(ThreatLevel::Medium, vec![MevAction::CancelTx]),
                draft(),
                30 * GWEI,
                500_000,
                100,
                0,
                5,
            )
            .unwrap_err();
        assert!(matches!(err, MevError::Cancelled));
    }

    #[test]
    fn deadline_widens_with_protection_and_threat() {
        let controller = controller("advanced", false); // +10 min
        let submission = controller
            .choose(
                &analysis(ThreatLevel::Medium, vec![]), // +5 min
                draft(),
                30 * GWEI,
                500_000,
                100,
                0,
                5, // base
            )
            .unwrap();
        // 5 + 10 + 5 = 20 minutes
        assert_eq!(submission.deadline_ns, 20 * 60_000_000_000);
    }

    #[test]
    fn slippage_adjustments_accumulate() {
        let controller = controller("standard", false);
        let submission = controller
            .choose(
                &analysis(
                    ThreatLevel::Low,
                    vec![
                        MevAction::AdjustSlippage { delta_bps: -10 },
                        MevAction::AdjustSlippage { delta_bps: -15 },
                    ],
                ),
                draft(),
                30 * GWEI,
                500_000,
                100,
                0,
                5,
            )
            .unwrap();
        assert_eq!(submission.slippage_adjustment_bps, -25);
    }

    #[test]
    fn private_bundle_targets_the_next_block() {
        let controller = controller("maximum", false);
        let submission = controller
            .choose(
                &analysis(ThreatLevel::Medium, vec![]),
                draft(),
                30 * GWEI,
                500_000,
                100,
                0,
                5,
            )
            .unwrap();
        assert_eq!(submission.strategy, SubmissionStrategy::PrivateBundle);
        assert_eq!(submission.target_block, Some(101));
    }

    #[test]
    fn unknown_level_is_rejected_at_construction() {
        let config = MevConfig {
            protection_level: "paranoid".to_string(),
            ..MevConfig::default()
        };
        assert!(matches!(
            ProtectionController::new(config),
            Err(MevError::InvalidLevel(_))
        ));
    }
}
