//! Workflow lifecycle coordination.
//!
//! Start and stop are guarded by named locks (`workflow_start:<id>`,
//! `workflow_stop:<id>`) and a per-id rate limit, giving at-most-once starts
//! and stops across replicas. The lock also makes this the single writer of
//! `workflow:<id>` and the active set while a transition is in flight.

use crate::backend::BackendClient;
use crate::cache::LayeredCache;
use crate::counter::Counters;
use crate::error::CoordinatorError;
use crate::kv::KvStore;
use crate::lock::LockManager;
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;
use config::CoordinatorConfig;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use types::{
    AgentKind, AgentState, Clock, Execution, Opportunity, WorkflowId, WorkflowState, WorkflowStatus,
};

const ACTIVE_SET_KEY: &str = "system:active_workflows";

pub struct WorkflowCoordinator {
    kv: Arc<dyn KvStore>,
    cache: Arc<LayeredCache>,
    locks: LockManager,
    rate_limiter: RateLimiter,
    counters: Counters,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    metrics: Option<Arc<Metrics>>,
    backend: Option<Arc<BackendClient>>,
}

impl WorkflowCoordinator {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: CoordinatorConfig) -> Self {
        let cache = Arc::new(LayeredCache::new(
            kv.clone(),
            clock.clone(),
            config.cache_max_size,
            Duration::from_secs(config.cache_validity_window_secs),
            Duration::from_secs(config.default_cache_ttl_secs),
        ));
        Self {
            locks: LockManager::new(kv.clone(), clock.clone()),
            rate_limiter: RateLimiter::new(kv.clone(), clock.clone()),
            counters: Counters::new(kv.clone(), clock.clone()),
            cache,
            kv,
            clock,
            config,
            metrics: None,
            backend: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.rate_limiter = self.rate_limiter_with(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    /// Attach the control-plane client; start/stop then notify the backend
    /// after the local transition commits.
    pub fn with_backend(mut self, backend: Arc<BackendClient>) -> Self {
        self.backend = Some(backend);
        self
    }

    fn rate_limiter_with(&self, metrics: Arc<Metrics>) -> RateLimiter {
        RateLimiter::new(self.kv.clone(), self.clock.clone()).with_metrics(metrics)
    }

    pub fn cache(&self) -> &Arc<LayeredCache> {
        &self.cache
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn workflow_key(id: &WorkflowId) -> String {
        format!("workflow:{id}")
    }

    fn retention(&self) -> Duration {
        Duration::from_secs(self.config.workflow_retention_secs)
    }

    /// At-most-once workflow start.
    ///
    /// Order matters: rate limit first (cheap, fails open), then the start
    /// lock before any backend-visible write.
    pub async fn start_workflow(
        &self,
        id: &WorkflowId,
        config: Value,
    ) -> Result<WorkflowState, CoordinatorError> {
        let decision = self
            .rate_limiter
            .check(
                &format!("start_workflow:{id}"),
                self.config.start_rate_limit_max,
                Duration::from_secs(self.config.start_rate_limit_window_secs),
            )
            .await;
        if !decision.allowed {
            return Err(CoordinatorError::RateLimited {
                retry_after_secs: decision
                    .reset_at_secs
                    .saturating_sub(self.clock.now_secs())
                    .max(1),
            });
        }

        let guard = self
            .locks
            .acquire(
                &format!("workflow_start:{id}"),
                Duration::from_secs(self.config.lock_ttl_secs),
            )
            .await?
            .ok_or_else(|| CoordinatorError::AlreadyStarting { id: id.clone() })?;

        let result = self.start_workflow_locked(id, config).await;
        guard.release().await?;
        result
    }

    async fn start_workflow_locked(
        &self,
        id: &WorkflowId,
        config: Value,
    ) -> Result<WorkflowState, CoordinatorError> {
        if self.list_active_workflows().await?.contains(id) {
            return Err(CoordinatorError::AlreadyActive { id: id.clone() });
        }
        // At-most-once started_at: an existing record means some replica
        // already won the race, whatever its current status.
        if self.get_workflow_state(id).await?.is_some() {
            return Err(CoordinatorError::AlreadyActive { id: id.clone() });
        }

        let state = WorkflowState::starting(id.clone(), config.clone(), self.clock.now_ns());
        self.put_workflow_state(&state).await?;
        self.add_active_workflow(id).await?;
        self.counters
            .increment("workflows_started", 1, Duration::from_secs(86_400))
            .await?;

        // Lock is still held here, so the backend sees at most one start
        // notification per id; its request-id idempotency absorbs retries.
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.start_workflow(id, config).await {
                warn!(workflow = %id, error = %e, "backend start notification failed");
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.active_workflows.inc();
        }
        info!(workflow = %id, "workflow started");
        Ok(state)
    }

    /// At-most-once workflow stop, symmetric with start.
    pub async fn stop_workflow(&self, id: &WorkflowId) -> Result<WorkflowState, CoordinatorError> {
        let guard = self
            .locks
            .acquire(
                &format!("workflow_stop:{id}"),
                Duration::from_secs(self.config.lock_ttl_secs),
            )
            .await?
            .ok_or_else(|| CoordinatorError::AlreadyStopping { id: id.clone() })?;

        let result = self.stop_workflow_locked(id).await;
        guard.release().await?;
        result
    }

    async fn stop_workflow_locked(
        &self,
        id: &WorkflowId,
    ) -> Result<WorkflowState, CoordinatorError> {
        let mut state = self
            .get_workflow_state(id)
            .await?
            .ok_or_else(|| CoordinatorError::WorkflowNotFound { id: id.clone() })?;

        state.transition(WorkflowStatus::Stopped, self.clock.now_ns())?;
        self.put_workflow_state(&state).await?;
        self.remove_active_workflow(id).await?;

        if let Some(backend) = &self.backend {
            if let Err(e) = backend.stop_workflow(id).await {
                warn!(workflow = %id, error = %e, "backend stop notification failed");
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.active_workflows.dec();
        }
        info!(workflow = %id, "workflow stopped");
        Ok(state)
    }

    /// Agents are up: Starting → Active.
    pub async fn activate_workflow(
        &self,
        id: &WorkflowId,
    ) -> Result<WorkflowState, CoordinatorError> {
        self.transition_workflow(id, WorkflowStatus::Active, None)
            .await
    }

    /// Completion event: Active/Stopped → Completed.
    pub async fn complete_workflow(
        &self,
        id: &WorkflowId,
        summary: Option<String>,
    ) -> Result<WorkflowState, CoordinatorError> {
        let state = self
            .transition_workflow(id, WorkflowStatus::Completed, summary)
            .await?;
        self.remove_active_workflow(id).await?;
        if let Some(metrics) = &self.metrics {
            if state.stopped_at_ns.is_none() {
                metrics.active_workflows.dec();
            }
        }
        Ok(state)
    }

    /// Workflow-level failure: record the error and transition to Error.
    pub async fn fail_workflow(
        &self,
        id: &WorkflowId,
        error: String,
    ) -> Result<WorkflowState, CoordinatorError> {
        let state = self
            .transition_workflow(id, WorkflowStatus::Error, Some(error))
            .await?;
        self.remove_active_workflow(id).await?;
        if let Some(metrics) = &self.metrics {
            metrics.active_workflows.dec();
        }
        Ok(state)
    }

    async fn transition_workflow(
        &self,
        id: &WorkflowId,
        next: WorkflowStatus,
        summary: Option<String>,
    ) -> Result<WorkflowState, CoordinatorError> {
        let mut state = self
            .get_workflow_state(id)
            .await?
            .ok_or_else(|| CoordinatorError::WorkflowNotFound { id: id.clone() })?;
        state.transition(next, self.clock.now_ns())?;
        if summary.is_some() {
            state.summary = summary;
        }
        self.put_workflow_state(&state).await?;
        Ok(state)
    }

    pub async fn get_workflow_state(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowState>, CoordinatorError> {
        let Some(bytes) = self.kv.get(&Self::workflow_key(id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Overwrite the persisted record. Callers own transition legality; this
    /// is the raw write used by the webhook demux and the engine.
    pub async fn set_workflow_state(&self, state: &WorkflowState) -> Result<(), CoordinatorError> {
        self.put_workflow_state(state).await
    }

    async fn put_workflow_state(&self, state: &WorkflowState) -> Result<(), CoordinatorError> {
        let bytes = serde_json::to_vec(state)?;
        self.kv
            .put(&Self::workflow_key(&state.id), bytes, Some(self.retention()))
            .await?;
        Ok(())
    }

    pub async fn set_agent_state(
        &self,
        id: &WorkflowId,
        agent: AgentKind,
        agent_state: AgentState,
    ) -> Result<(), CoordinatorError> {
        let payload = serde_json::to_vec(&agent_state)?;
        let ttl = Some(self.retention());
        self.kv
            .put(&format!("agent:{}:{id}", agent.as_str()), payload.clone(), ttl)
            .await?;
        self.kv
            .put(&format!("agent:{}:latest", agent.as_str()), payload, ttl)
            .await?;

        // Mirror into the workflow record when one exists.
        if let Some(mut state) = self.get_workflow_state(id).await? {
            state.set_agent(agent, agent_state, self.clock.now_ns())?;
            self.put_workflow_state(&state).await?;
        }
        Ok(())
    }

    pub async fn add_active_workflow(&self, id: &WorkflowId) -> Result<(), CoordinatorError> {
        let mut active = self.list_active_workflows().await?;
        if !active.contains(id) {
            active.push(id.clone());
            self.kv
                .put(ACTIVE_SET_KEY, serde_json::to_vec(&active)?, None)
                .await?;
        }
        Ok(())
    }

    pub async fn remove_active_workflow(&self, id: &WorkflowId) -> Result<(), CoordinatorError> {
        let mut active = self.list_active_workflows().await?;
        let before = active.len();
        active.retain(|wf| wf != id);
        if active.len() != before {
            self.kv
                .put(ACTIVE_SET_KEY, serde_json::to_vec(&active)?, None)
                .await?;
        }
        Ok(())
    }

    pub async fn list_active_workflows(&self) -> Result<Vec<WorkflowId>, CoordinatorError> {
        let Some(bytes) = self.kv.get(ACTIVE_SET_KEY).await? else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Periodic liveness record under `system:health`.
    pub async fn record_health(&self, health: Value) -> Result<(), CoordinatorError> {
        self.kv
            .put(
                "system:health",
                serde_json::to_vec(&health)?,
                Some(Duration::from_secs(120)),
            )
            .await?;
        if let Some(metrics) = &self.metrics {
            if let Ok(estimate) = self.kv.estimate_keys().await {
                metrics.kv_keys_estimate.set(estimate as i64);
            }
        }
        Ok(())
    }

    pub async fn increment_counter(
        &self,
        name: &str,
        n: u64,
        window: Duration,
    ) -> Result<u64, CoordinatorError> {
        Ok(self.counters.increment(name, n, window).await?)
    }

    /// Cache an emitted opportunity under `opportunity:<fp>` until it expires.
    pub async fn record_opportunity(
        &self,
        opportunity: &Opportunity,
    ) -> Result<(), CoordinatorError> {
        let ttl_ns = opportunity
            .expires_at_ns
            .saturating_sub(self.clock.now_ns());
        let key = format!("opportunity:{}", opportunity.fingerprint);
        self.cache
            .set(
                &key,
                serde_json::to_value(opportunity)?,
                Some(Duration::from_nanos(ttl_ns.max(1))),
                vec!["opportunities".to_string()],
            )
            .await?;
        Ok(())
    }

    pub async fn get_opportunity(&self, fingerprint_hex: &str) -> Option<Value> {
        self.cache
            .get(&format!("opportunity:{fingerprint_hex}"))
            .await
    }

    /// Mirror an execution by value and roll its profit into the 24h counter.
    pub async fn record_execution(&self, execution: &Execution) -> Result<(), CoordinatorError> {
        self.cache
            .set(
                &format!("api_cache:executions:{}", execution.id),
                serde_json::to_value(execution)?,
                Some(self.retention()),
                vec!["executions".to_string()],
            )
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics
                .executions_total
                .with_label_values(&[execution.status.as_str()])
                .inc();
        }

        if let Some(profit) = execution.actual_profit_usd {
            // Counter substrate is integral; track cents.
            let cents = (profit * rust_decimal::Decimal::from(100))
                .to_i64()
                .unwrap_or(0);
            if cents > 0 {
                if let Err(e) = self
                    .counters
                    .increment("profit_usd_cents_24h", cents as u64, Duration::from_secs(86_400))
                    .await
                {
                    warn!(error = %e, "failed to roll profit into 24h counter");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use serde_json::json;
    use types::SimClock;

    fn coordinator() -> (Arc<SimClock>, WorkflowCoordinator) {
        let clock = SimClock::new(1_000_000_000);
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let coordinator =
            WorkflowCoordinator::new(kv, clock.clone(), CoordinatorConfig::default());
        (clock, coordinator)
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let (clock, coordinator) = coordinator();
        let id = WorkflowId::from("wf-1");

        let state = coordinator.start_workflow(&id, json!({})).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Starting);
        assert_eq!(coordinator.list_active_workflows().await.unwrap(), vec![id.clone()]);

        clock.advance(Duration::from_secs(1));
        coordinator.activate_workflow(&id).await.unwrap();

        clock.advance(Duration::from_secs(1));
        let stopped = coordinator.stop_workflow(&id).await.unwrap();
        assert_eq!(stopped.status, WorkflowStatus::Stopped);
        assert!(stopped.stopped_at_ns.is_some());
        assert!(coordinator.list_active_workflows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_start_returns_already_active() {
        let (_clock, coordinator) = coordinator();
        let id = WorkflowId::from("wf-1");
        coordinator.start_workflow(&id, json!({})).await.unwrap();

        let err = coordinator.start_workflow(&id, json!({})).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::AlreadyActive { .. }));
    }

    #[tokio::test]
    async fn started_at_exists_at_most_once() {
        let (clock, coordinator) = coordinator();
        let id = WorkflowId::from("wf-1");

        let first = coordinator.start_workflow(&id, json!({})).await.unwrap();
        clock.advance(Duration::from_secs(1));
        coordinator.activate_workflow(&id).await.unwrap();
        coordinator.stop_workflow(&id).await.unwrap();

        // Even after leaving the active set, the record pins started_at.
        let err = coordinator.start_workflow(&id, json!({})).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::AlreadyActive { .. }));

        let persisted = coordinator.get_workflow_state(&id).await.unwrap().unwrap();
        assert_eq!(persisted.started_at_ns, first.started_at_ns);
    }

    #[tokio::test]
    async fn start_rate_limit_kicks_in() {
        let (_clock, coordinator) = coordinator();
        let id = WorkflowId::from("wf-same");
        // Burn the 5/60s budget: one successful start, then AlreadyActive.
        for _ in 0..5 {
            let _ = coordinator.start_workflow(&id, json!({})).await;
        }
        let err = coordinator.start_workflow(&id, json!({})).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn agent_state_is_mirrored_into_the_record() {
        let (clock, coordinator) = coordinator();
        let id = WorkflowId::from("wf-1");
        coordinator.start_workflow(&id, json!({})).await.unwrap();

        clock.advance(Duration::from_secs(1));
        coordinator
            .set_agent_state(&id, AgentKind::Router, AgentState::Active)
            .await
            .unwrap();

        let state = coordinator.get_workflow_state(&id).await.unwrap().unwrap();
        assert_eq!(state.agents[&AgentKind::Router], AgentState::Active);
    }

    #[tokio::test]
    async fn workflows_started_counter_accumulates() {
        let (_clock, coordinator) = coordinator();
        coordinator
            .start_workflow(&WorkflowId::from("a"), json!({}))
            .await
            .unwrap();
        coordinator
            .start_workflow(&WorkflowId::from("b"), json!({}))
            .await
            .unwrap();

        let count = coordinator
            .counters()
            .get("workflows_started", Duration::from_secs(86_400))
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
