//! MEV threat analysis and submission types.

use crate::identifiers::{ChainId, EvmAddress};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Aggregate threat severity, thresholded from the weighted signal score:
/// `LOW ≤ 0.2 < MEDIUM ≤ 0.5 < HIGH ≤ 0.8 < CRITICAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn from_score(score: f64) -> Self {
        if score <= 0.0 {
            ThreatLevel::None
        } else if score <= 0.2 {
            ThreatLevel::Low
        } else if score <= 0.5 {
            ThreatLevel::Medium
        } else if score <= 0.8 {
            ThreatLevel::High
        } else {
            ThreatLevel::Critical
        }
    }

    /// Gas-price competitiveness multiplier applied to Protected submissions.
    pub fn gas_multiplier(&self) -> Decimal {
        match self {
            ThreatLevel::None => Decimal::new(100, 2),     // 1.00
            ThreatLevel::Low => Decimal::new(105, 2),      // 1.05
            ThreatLevel::Medium => Decimal::new(115, 2),   // 1.15
            ThreatLevel::High => Decimal::new(130, 2),     // 1.30
            ThreatLevel::Critical => Decimal::new(150, 2), // 1.50
        }
    }

    /// Deadline widening in minutes, added per threat level.
    pub fn deadline_adj_minutes(&self) -> u64 {
        match self {
            ThreatLevel::None => 0,
            ThreatLevel::Low => 2,
            ThreatLevel::Medium => 5,
            ThreatLevel::High => 10,
            ThreatLevel::Critical => 15,
        }
    }
}

/// The attack classes the analyzer recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    Sandwich,
    Frontrun,
    Backrun,
    OracleManipulation,
}

impl ThreatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatType::Sandwich => "sandwich",
            ThreatType::Frontrun => "frontrun",
            ThreatType::Backrun => "backrun",
            ThreatType::OracleManipulation => "oracle_manipulation",
        }
    }
}

/// One classified threat with its weighted contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threat {
    pub kind: ThreatType,
    /// Weighted severity contribution in `[0, 1]`.
    pub severity: f64,
    pub est_loss_usd: Decimal,
}

/// Protection action recommended by the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MevAction {
    AdjustSlippage { delta_bps: i32 },
    UsePrivateMempool,
    DelayExecution { blocks: u64 },
    CancelTx,
}

/// Full analysis result handed to the protection controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MevAnalysis {
    pub threat_level: ThreatLevel,
    /// Raw weighted score before thresholding, for diagnostics.
    pub score: f64,
    pub threats: Vec<Threat>,
    pub recommended_actions: Vec<MevAction>,
}

impl MevAnalysis {
    pub fn benign() -> Self {
        Self {
            threat_level: ThreatLevel::None,
            score: 0.0,
            threats: Vec::new(),
            recommended_actions: Vec::new(),
        }
    }

    pub fn total_est_loss_usd(&self) -> Decimal {
        self.threats.iter().map(|t| t.est_loss_usd).sum()
    }
}

/// Operator-chosen protection posture, orthogonal to observed threat level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtectionLevel {
    Basic,
    Standard,
    Advanced,
    Maximum,
}

impl ProtectionLevel {
    /// Deadline widening in minutes, added per protection level.
    pub fn deadline_adj_minutes(&self) -> u64 {
        match self {
            ProtectionLevel::Basic => 0,
            ProtectionLevel::Standard => 5,
            ProtectionLevel::Advanced => 10,
            ProtectionLevel::Maximum => 20,
        }
    }

    /// One-step escalation used by the retry-with-protection fallback.
    pub fn escalate(&self) -> Self {
        match self {
            ProtectionLevel::Basic => ProtectionLevel::Standard,
            ProtectionLevel::Standard => ProtectionLevel::Advanced,
            ProtectionLevel::Advanced | ProtectionLevel::Maximum => ProtectionLevel::Maximum,
        }
    }
}

/// How a transaction reaches the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStrategy {
    Direct,
    Protected,
    PrivateBundle,
    Delayed,
}

impl SubmissionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStrategy::Direct => "direct",
            SubmissionStrategy::Protected => "protected",
            SubmissionStrategy::PrivateBundle => "private_bundle",
            SubmissionStrategy::Delayed => "delayed",
        }
    }
}

/// Unsigned transaction shape carried from the planner into submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDraft {
    pub chain: ChainId,
    pub to: EvmAddress,
    pub data: Vec<u8>,
    pub value: u128,
}

/// A submission decision: strategy plus the concrete gas/deadline envelope.
///
/// Invariants (enforced by the protection controller): `Delayed` carries a
/// `target_block` strictly above the current block; `PrivateBundle` receives
/// its `bundle_id` from the relay at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub strategy: SubmissionStrategy,
    pub tx: TxDraft,
    pub gas_price_wei: u128,
    pub gas_limit: u64,
    pub target_block: Option<u64>,
    pub bundle_id: Option<String>,
    pub deadline_ns: u64,
    /// Extra slippage headroom granted by protection actions, in bps.
    pub slippage_adjustment_bps: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threat_level_thresholds_are_exact() {
        assert_eq!(ThreatLevel::from_score(0.0), ThreatLevel::None);
        assert_eq!(ThreatLevel::from_score(0.1), ThreatLevel::Low);
        assert_eq!(ThreatLevel::from_score(0.2), ThreatLevel::Low);
        assert_eq!(ThreatLevel::from_score(0.21), ThreatLevel::Medium);
        assert_eq!(ThreatLevel::from_score(0.5), ThreatLevel::Medium);
        assert_eq!(ThreatLevel::from_score(0.51), ThreatLevel::High);
        assert_eq!(ThreatLevel::from_score(0.8), ThreatLevel::High);
        assert_eq!(ThreatLevel::from_score(0.81), ThreatLevel::Critical);
        assert_eq!(ThreatLevel::from_score(1.0), ThreatLevel::Critical);
    }

    #[test]
    fn gas_multipliers_scale_with_threat() {
        assert_eq!(ThreatLevel::None.gas_multiplier(), Decimal::new(100, 2));
        assert_eq!(ThreatLevel::Low.gas_multiplier(), Decimal::new(105, 2));
        assert_eq!(ThreatLevel::Medium.gas_multiplier(), Decimal::new(115, 2));
        assert_eq!(ThreatLevel::High.gas_multiplier(), Decimal::new(130, 2));
        assert_eq!(ThreatLevel::Critical.gas_multiplier(), Decimal::new(150, 2));
    }

    #[test]
    fn protection_escalation_saturates_at_maximum() {
        assert_eq!(ProtectionLevel::Basic.escalate(), ProtectionLevel::Standard);
        assert_eq!(
            ProtectionLevel::Advanced.escalate(),
            ProtectionLevel::Maximum
        );
        assert_eq!(
            ProtectionLevel::Maximum.escalate(),
            ProtectionLevel::Maximum
        );
    }
}
