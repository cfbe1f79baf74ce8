//! Execution records and their state machine.

use crate::identifiers::{ExecutionId, OpportunityId, WorkflowId};
use crate::mev::Submission;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Execution lifecycle:
///
/// ```text
///            submit ok              seen in block
///  Pending ───────────▶ Submitted ───────────────▶ Confirmed
///     │                    │ revert
///     │                    ├──────────────▶ Reverted
///     │ submit fail        │ deadline passed w/o inclusion
///     └─────▶ Failed       └──────────▶ TimedOut
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
    Reverted,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Confirmed
                | ExecutionStatus::Failed
                | ExecutionStatus::Reverted
                | ExecutionStatus::TimedOut
        )
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Pending, Failed)
                | (Submitted, Confirmed)
                | (Submitted, Reverted)
                | (Submitted, TimedOut)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Submitted => "submitted",
            ExecutionStatus::Confirmed => "confirmed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Reverted => "reverted",
            ExecutionStatus::TimedOut => "timed_out",
        }
    }
}

/// One execution attempt of a route, owned by the executor and mirrored into
/// the coordinator by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub opportunity_id: OpportunityId,
    pub workflow_id: WorkflowId,
    pub submission: Submission,
    pub status: ExecutionStatus,
    pub tx_hash: Option<[u8; 32]>,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub actual_profit_usd: Option<Decimal>,
    pub error: Option<String>,
    pub executed_at_ns: u64,
    pub confirmed_at_ns: Option<u64>,
    pub schema_version: u32,
}

impl Execution {
    pub fn new(
        id: ExecutionId,
        opportunity_id: OpportunityId,
        workflow_id: WorkflowId,
        submission: Submission,
        executed_at_ns: u64,
    ) -> Self {
        Self {
            id,
            opportunity_id,
            workflow_id,
            submission,
            status: ExecutionStatus::Pending,
            tx_hash: None,
            block_number: None,
            gas_used: None,
            actual_profit_usd: None,
            error: None,
            executed_at_ns,
            confirmed_at_ns: None,
            schema_version: crate::SCHEMA_VERSION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_the_closed_set() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Submitted.is_terminal());
        assert!(ExecutionStatus::Confirmed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Reverted.is_terminal());
        assert!(ExecutionStatus::TimedOut.is_terminal());
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Submitted));
        assert!(Pending.can_transition_to(Failed));
        assert!(Submitted.can_transition_to(Confirmed));
        assert!(Submitted.can_transition_to(Reverted));
        assert!(Submitted.can_transition_to(TimedOut));

        assert!(!Pending.can_transition_to(Confirmed));
        assert!(!Confirmed.can_transition_to(Submitted));
        assert!(!Failed.can_transition_to(Submitted));
        assert!(!Submitted.can_transition_to(Failed));
    }
}
