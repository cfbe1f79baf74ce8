//! Webhook demultiplexer.
//!
//! Accepts backend events and routes them to workflow state, agent state,
//! live metrics, cached opportunities, terminal transitions, and counters.
//! Processing is idempotent by `(event_type, workflow_id, monotonic_ts)`: a
//! replayed delivery is detected through a conditional KV marker and dropped.

use crate::error::CoordinatorError;
use crate::kv::KvStore;
use crate::metrics::Metrics;
use crate::workflow::WorkflowCoordinator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use types::{AgentKind, AgentState, WorkflowId, WorkflowStatus};

/// Dedup markers outlive any plausible redelivery window.
const DEDUP_TTL: Duration = Duration::from_secs(3_600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_type: String,
    pub workflow_id: Option<WorkflowId>,
    pub agent_id: Option<String>,
    /// Producer-side monotonic timestamp; the idempotence key component.
    pub monotonic_ts: u64,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    Duplicate,
    Ignored,
}

pub struct WebhookProcessor {
    coordinator: Arc<WorkflowCoordinator>,
    kv: Arc<dyn KvStore>,
    metrics: Option<Arc<Metrics>>,
}

impl WebhookProcessor {
    pub fn new(coordinator: Arc<WorkflowCoordinator>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            coordinator,
            kv,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn process(&self, event: WebhookEvent) -> Result<WebhookOutcome, CoordinatorError> {
        let workflow_part = event
            .workflow_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let dedup_key = format!(
            "webhook:{}:{}:{}",
            event.event_type, workflow_part, event.monotonic_ts
        );

        let fresh = self
            .kv
            .put_if_absent(&dedup_key, vec![1], Some(DEDUP_TTL))
            .await?;
        if !fresh {
            debug!(event_type = %event.event_type, "duplicate webhook dropped");
            if let Some(metrics) = &self.metrics {
                metrics.webhook_duplicates_total.inc();
            }
            return Ok(WebhookOutcome::Duplicate);
        }

        match event.event_type.as_str() {
            "workflow_update" => self.apply_workflow_update(&event).await,
            "agent_update" => self.apply_agent_update(&event).await,
            "live_metrics" => self.apply_live_metrics(&event).await,
            "opportunity_found" => self.apply_opportunity(&event).await,
            "workflow_completed" => self.apply_terminal(&event, WorkflowStatus::Completed).await,
            "workflow_error" => self.apply_terminal(&event, WorkflowStatus::Error).await,
            "counter_increment" => self.apply_counter(&event).await,
            other => {
                warn!(event_type = other, "unroutable webhook event");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    fn require_workflow(event: &WebhookEvent) -> Result<&WorkflowId, CoordinatorError> {
        event
            .workflow_id
            .as_ref()
            .ok_or_else(|| CoordinatorError::WorkflowNotFound {
                id: WorkflowId::from("<missing>"),
            })
    }

    async fn apply_workflow_update(
        &self,
        event: &WebhookEvent,
    ) -> Result<WebhookOutcome, CoordinatorError> {
        let id = Self::require_workflow(event)?;
        let Some(mut state) = self.coordinator.get_workflow_state(id).await? else {
            return Err(CoordinatorError::WorkflowNotFound { id: id.clone() });
        };

        let now_ns = self.coordinator.clock().now_ns();
        if let Some(phase) = event.payload.get("phase").and_then(Value::as_str) {
            state.phase = phase.to_string();
        }
        if let Some(progress) = event.payload.get("progress").and_then(Value::as_u64) {
            state.set_progress(progress.min(100) as u8, now_ns)?;
        } else {
            state.touch(now_ns)?;
        }
        if let Some(status) = event.payload.get("status").and_then(Value::as_str) {
            if let Some(next) = parse_status(status) {
                if state.status != next {
                    state.transition(next, now_ns)?;
                }
            }
        }

        self.coordinator.set_workflow_state(&state).await?;
        Ok(WebhookOutcome::Applied)
    }

    async fn apply_agent_update(
        &self,
        event: &WebhookEvent,
    ) -> Result<WebhookOutcome, CoordinatorError> {
        let id = Self::require_workflow(event)?;
        let Some(agent) = event.agent_id.as_deref().and_then(parse_agent) else {
            warn!(agent = ?event.agent_id, "agent_update with unknown agent id");
            return Ok(WebhookOutcome::Ignored);
        };
        let Some(state) = event
            .payload
            .get("state")
            .and_then(Value::as_str)
            .and_then(parse_agent_state)
        else {
            return Ok(WebhookOutcome::Ignored);
        };

        self.coordinator.set_agent_state(id, agent, state).await?;
        Ok(WebhookOutcome::Applied)
    }

    async fn apply_live_metrics(
        &self,
        event: &WebhookEvent,
    ) -> Result<WebhookOutcome, CoordinatorError> {
        let id = Self::require_workflow(event)?;
        self.coordinator
            .cache()
            .set(
                &format!("api_cache:live_metrics:{id}"),
                event.payload.clone(),
                Some(Duration::from_secs(30)),
                vec!["live_metrics".to_string()],
            )
            .await?;
        Ok(WebhookOutcome::Applied)
    }

    async fn apply_opportunity(
        &self,
        event: &WebhookEvent,
    ) -> Result<WebhookOutcome, CoordinatorError> {
        let Some(fingerprint) = event.payload.get("fingerprint").and_then(Value::as_str) else {
            return Ok(WebhookOutcome::Ignored);
        };
        self.coordinator
            .cache()
            .set(
                &format!("opportunity:{fingerprint}"),
                event.payload.clone(),
                Some(Duration::from_secs(60)),
                vec!["opportunities".to_string()],
            )
            .await?;
        Ok(WebhookOutcome::Applied)
    }

    async fn apply_terminal(
        &self,
        event: &WebhookEvent,
        status: WorkflowStatus,
    ) -> Result<WebhookOutcome, CoordinatorError> {
        let id = Self::require_workflow(event)?;
        let summary = event
            .payload
            .get("summary")
            .and_then(Value::as_str)
            .map(str::to_string);

        match status {
            WorkflowStatus::Completed => {
                self.coordinator.complete_workflow(id, summary).await?;
            }
            WorkflowStatus::Error => {
                self.coordinator
                    .fail_workflow(id, summary.unwrap_or_else(|| "unspecified".to_string()))
                    .await?;
            }
            _ => return Ok(WebhookOutcome::Ignored),
        }
        Ok(WebhookOutcome::Applied)
    }

    async fn apply_counter(
        &self,
        event: &WebhookEvent,
    ) -> Result<WebhookOutcome, CoordinatorError> {
        let Some(name) = event.payload.get("name").and_then(Value::as_str) else {
            return Ok(WebhookOutcome::Ignored);
        };
        let n = event.payload.get("n").and_then(Value::as_u64).unwrap_or(1);
        let window_h = event
            .payload
            .get("window_h")
            .and_then(Value::as_u64)
            .unwrap_or(24);
        self.coordinator
            .increment_counter(name, n, Duration::from_secs(window_h * 3_600))
            .await?;
        Ok(WebhookOutcome::Applied)
    }
}

fn parse_status(s: &str) -> Option<WorkflowStatus> {
    match s {
        "starting" => Some(WorkflowStatus::Starting),
        "active" => Some(WorkflowStatus::Active),
        "completed" => Some(WorkflowStatus::Completed),
        "stopped" => Some(WorkflowStatus::Stopped),
        "error" => Some(WorkflowStatus::Error),
        _ => None,
    }
}

fn parse_agent(s: &str) -> Option<AgentKind> {
    match s {
        "detector" => Some(AgentKind::Detector),
        "router" => Some(AgentKind::Router),
        "guardian" => Some(AgentKind::Guardian),
        "executor" => Some(AgentKind::Executor),
        _ => None,
    }
}

fn parse_agent_state(s: &str) -> Option<AgentState> {
    match s {
        "idle" => Some(AgentState::Idle),
        "starting" => Some(AgentState::Starting),
        "active" => Some(AgentState::Active),
        "error" => Some(AgentState::Error),
        "stopped" => Some(AgentState::Stopped),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use config::CoordinatorConfig;
    use serde_json::json;
    use types::SimClock;

    async fn processor() -> (Arc<SimClock>, Arc<WorkflowCoordinator>, WebhookProcessor) {
        let clock = SimClock::new(1_000_000_000);
        let kv: Arc<MemoryKv> = Arc::new(MemoryKv::new(clock.clone()));
        let coordinator = Arc::new(WorkflowCoordinator::new(
            kv.clone(),
            clock.clone(),
            CoordinatorConfig::default(),
        ));
        coordinator
            .start_workflow(&WorkflowId::from("wf-1"), json!({}))
            .await
            .unwrap();
        let processor = WebhookProcessor::new(coordinator.clone(), kv);
        (clock, coordinator, processor)
    }

    fn event(event_type: &str, ts: u64, payload: Value) -> WebhookEvent {
        WebhookEvent {
            event_type: event_type.to_string(),
            workflow_id: Some(WorkflowId::from("wf-1")),
            agent_id: None,
            monotonic_ts: ts,
            payload,
        }
    }

    #[tokio::test]
    async fn replayed_event_applies_once() {
        let (clock, coordinator, processor) = processor().await;
        clock.advance(Duration::from_secs(1));

        let update = event("workflow_update", 42, json!({"progress": 30}));
        assert_eq!(
            processor.process(update.clone()).await.unwrap(),
            WebhookOutcome::Applied
        );
        let after_first = coordinator
            .get_workflow_state(&WorkflowId::from("wf-1"))
            .await
            .unwrap()
            .unwrap();

        clock.advance(Duration::from_secs(1));
        assert_eq!(
            processor.process(update).await.unwrap(),
            WebhookOutcome::Duplicate
        );
        let after_second = coordinator
            .get_workflow_state(&WorkflowId::from("wf-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn workflow_update_moves_status_and_progress() {
        let (clock, coordinator, processor) = processor().await;
        clock.advance(Duration::from_secs(1));

        processor
            .process(event(
                "workflow_update",
                1,
                json!({"status": "active", "progress": 55, "phase": "executing"}),
            ))
            .await
            .unwrap();

        let state = coordinator
            .get_workflow_state(&WorkflowId::from("wf-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, WorkflowStatus::Active);
        assert_eq!(state.progress, 55);
        assert_eq!(state.phase, "executing");
    }

    #[tokio::test]
    async fn agent_update_routes_to_agent_state() {
        let (clock, coordinator, processor) = processor().await;
        clock.advance(Duration::from_secs(1));

        let mut ev = event("agent_update", 7, json!({"state": "active"}));
        ev.agent_id = Some("guardian".to_string());
        assert_eq!(processor.process(ev).await.unwrap(), WebhookOutcome::Applied);

        let state = coordinator
            .get_workflow_state(&WorkflowId::from("wf-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.agents[&AgentKind::Guardian], AgentState::Active);
    }

    #[tokio::test]
    async fn terminal_event_completes_the_workflow() {
        let (clock, coordinator, processor) = processor().await;
        clock.advance(Duration::from_secs(1));
        coordinator
            .activate_workflow(&WorkflowId::from("wf-1"))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(1));
        processor
            .process(event(
                "workflow_completed",
                9,
                json!({"summary": "3 executions, $41.20 net"}),
            ))
            .await
            .unwrap();

        let state = coordinator
            .get_workflow_state(&WorkflowId::from("wf-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.summary.as_deref(), Some("3 executions, $41.20 net"));
        assert!(coordinator.list_active_workflows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_event_type_is_ignored_not_failed() {
        let (_clock, _coordinator, processor) = processor().await;
        assert_eq!(
            processor
                .process(event("mystery", 1, json!({})))
                .await
                .unwrap(),
            WebhookOutcome::Ignored
        );
    }
}
