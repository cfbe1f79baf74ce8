//! Workflow lifecycle state shared between the strategy engine and the
//! coordinator.

use crate::identifiers::WorkflowId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("illegal workflow transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("last_update would move backwards: {current_ns} -> {attempted_ns}")]
    NonMonotonicUpdate { current_ns: u64, attempted_ns: u64 },
}

/// Workflow lifecycle:
///
/// ```text
///                start_ok
///  (absent) ──────────────▶ Starting ──agents up──▶ Active
///      │                        │ fail                │ stop_req
///      │                        ▼                     ▼
///      │                      Error              Stopped
///      │                                              │ completion event
///      └── (completion event) ──▶ Completed ◀─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Starting,
    Active,
    Completed,
    Stopped,
    Error,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Error)
    }

    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Starting, Active)
                | (Starting, Error)
                | (Active, Stopped)
                | (Active, Completed)
                | (Active, Error)
                | (Stopped, Completed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Starting => "starting",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Stopped => "stopped",
            WorkflowStatus::Error => "error",
        }
    }
}

/// Agents cooperating inside one workflow.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Detector,
    Router,
    Guardian,
    Executor,
}

impl AgentKind {
    pub const ALL: [AgentKind; 4] = [
        AgentKind::Detector,
        AgentKind::Router,
        AgentKind::Guardian,
        AgentKind::Executor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Detector => "detector",
            AgentKind::Router => "router",
            AgentKind::Guardian => "guardian",
            AgentKind::Executor => "executor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Starting,
    Active,
    Error,
    Stopped,
}

/// Persisted workflow record. `last_update_ns` is monotonic; transitions only
/// follow [`WorkflowStatus::can_transition_to`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: WorkflowId,
    pub status: WorkflowStatus,
    pub config: serde_json::Value,
    pub agents: BTreeMap<AgentKind, AgentState>,
    pub phase: String,
    /// Progress percentage, `0..=100`.
    pub progress: u8,
    pub started_at_ns: u64,
    pub last_update_ns: u64,
    pub stopped_at_ns: Option<u64>,
    pub summary: Option<String>,
    pub schema_version: u32,
}

impl WorkflowState {
    pub fn starting(id: WorkflowId, config: serde_json::Value, now_ns: u64) -> Self {
        let agents = AgentKind::ALL
            .iter()
            .map(|a| (*a, AgentState::Idle))
            .collect();
        Self {
            id,
            status: WorkflowStatus::Starting,
            config,
            agents,
            phase: "starting".to_string(),
            progress: 0,
            started_at_ns: now_ns,
            last_update_ns: now_ns,
            stopped_at_ns: None,
            summary: None,
            schema_version: crate::SCHEMA_VERSION,
        }
    }

    /// Apply a status transition, enforcing legality and clock monotonicity.
    pub fn transition(&mut self, next: WorkflowStatus, now_ns: u64) -> Result<(), WorkflowError> {
        if !self.status.can_transition_to(next) {
            return Err(WorkflowError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.touch(now_ns)?;
        if next == WorkflowStatus::Stopped {
            self.stopped_at_ns = Some(now_ns);
        }
        self.status = next;
        Ok(())
    }

    /// Bump `last_update_ns`, rejecting backwards movement.
    pub fn touch(&mut self, now_ns: u64) -> Result<(), WorkflowError> {
        if now_ns < self.last_update_ns {
            return Err(WorkflowError::NonMonotonicUpdate {
                current_ns: self.last_update_ns,
                attempted_ns: now_ns,
            });
        }
        self.last_update_ns = now_ns;
        Ok(())
    }

    pub fn set_progress(&mut self, progress: u8, now_ns: u64) -> Result<(), WorkflowError> {
        self.touch(now_ns)?;
        self.progress = progress.min(100);
        Ok(())
    }

    pub fn set_agent(
        &mut self,
        agent: AgentKind,
        state: AgentState,
        now_ns: u64,
    ) -> Result<(), WorkflowError> {
        self.touch(now_ns)?;
        self.agents.insert(agent, state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> WorkflowState {
        WorkflowState::starting(WorkflowId::from("wf-1"), serde_json::json!({}), 1_000)
    }

    #[test]
    fn happy_path_transitions() {
        let mut wf = state();
        wf.transition(WorkflowStatus::Active, 2_000).unwrap();
        wf.transition(WorkflowStatus::Stopped, 3_000).unwrap();
        assert_eq!(wf.stopped_at_ns, Some(3_000));
        wf.transition(WorkflowStatus::Completed, 4_000).unwrap();
        assert!(wf.status.is_terminal());
    }

    #[test]
    fn starting_can_fail_into_error() {
        let mut wf = state();
        wf.transition(WorkflowStatus::Error, 2_000).unwrap();
        assert!(wf.status.is_terminal());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut wf = state();
        let err = wf.transition(WorkflowStatus::Completed, 2_000).unwrap_err();
        assert!(matches!(err, WorkflowError::IllegalTransition { .. }));

        wf.transition(WorkflowStatus::Active, 2_000).unwrap();
        wf.transition(WorkflowStatus::Completed, 3_000).unwrap();
        assert!(wf
            .transition(WorkflowStatus::Active, 4_000)
            .is_err());
    }

    #[test]
    fn last_update_is_monotonic() {
        let mut wf = state();
        wf.touch(5_000).unwrap();
        let err = wf.touch(4_000).unwrap_err();
        assert_eq!(
            err,
            WorkflowError::NonMonotonicUpdate {
                current_ns: 5_000,
                attempted_ns: 4_000
            }
        );
    }

    #[test]
    fn progress_is_clamped() {
        let mut wf = state();
        wf.set_progress(250, 2_000).unwrap();
        assert_eq!(wf.progress, 100);
    }
}
