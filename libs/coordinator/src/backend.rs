//! Backend control-plane client.
//!
//! Bearer-authenticated HTTP with a request-id header for idempotency: the
//! same id is reused across retries of one logical request, so an
//! at-least-once delivery applies at most once server-side. Transient
//! failures retry with exponential backoff (1 s doubling to 10 s, plus
//! jitter), bounded by `max_retries`. Calls are paced client-side so a
//! reconnect storm cannot hammer the backend.

use crate::error::CoordinatorError;
use crate::metrics::Metrics;
use config::BackendConfig;
use governor::{DefaultDirectRateLimiter, Quota};
use nonzero_ext::nonzero;
use rand::Rng;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use types::WorkflowId;

pub struct BackendClient {
    http: reqwest::Client,
    config: BackendConfig,
    limiter: DefaultDirectRateLimiter,
    metrics: Option<Arc<Metrics>>,
}

impl BackendClient {
    pub fn new(config: BackendConfig) -> Result<Self, CoordinatorError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| CoordinatorError::BackendUnavailable {
                attempts: 0,
                reason: format!("client construction failed: {e}"),
            })?;

        let rate = NonZeroU32::new(config.requests_per_minute).unwrap_or(nonzero!(600u32));
        let limiter = DefaultDirectRateLimiter::direct(Quota::per_minute(rate));

        Ok(Self {
            http,
            config,
            limiter,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn health(&self) -> Result<Value, CoordinatorError> {
        self.request(reqwest::Method::GET, "/health", None).await
    }

    pub async fn start_workflow(
        &self,
        id: &WorkflowId,
        config: Value,
    ) -> Result<Value, CoordinatorError> {
        self.request(
            reqwest::Method::POST,
            "/workflows",
            Some(json!({ "id": id, "config": config })),
        )
        .await
    }

    pub async fn stop_workflow(&self, id: &WorkflowId) -> Result<Value, CoordinatorError> {
        self.request(
            reqwest::Method::POST,
            &format!("/workflows/{id}/stop"),
            None,
        )
        .await
    }

    pub async fn workflow_status(&self, id: &WorkflowId) -> Result<Value, CoordinatorError> {
        self.request(reqwest::Method::GET, &format!("/workflows/{id}"), None)
            .await
    }

    pub async fn agent_status(&self, agent: &str) -> Result<Value, CoordinatorError> {
        self.request(reqwest::Method::GET, &format!("/agents/{agent}"), None)
            .await
    }

    pub async fn system_metrics(&self) -> Result<Value, CoordinatorError> {
        self.request(reqwest::Method::GET, "/metrics/system", None)
            .await
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, CoordinatorError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        // One id for all retries of this logical request.
        let request_id = uuid::Uuid::new_v4().to_string();

        let mut last_error = String::new();
        let mut attempts = 0;

        for attempt in 0..=self.config.max_retries {
            attempts = attempt + 1;
            self.limiter.until_ready().await;

            if attempt > 0 {
                let backoff = self.backoff_for(attempt);
                debug!(path, attempt, backoff_ms = backoff.as_millis() as u64, "backend retry");
                tokio::time::sleep(backoff).await;
            }

            let mut builder = self
                .http
                .request(method.clone(), &url)
                .header("X-Request-Id", &request_id);
            if !self.config.bearer_token.is_empty() {
                builder = builder.bearer_auth(&self.config.bearer_token);
            }
            if let Some(body) = &body {
                builder = builder.json(body);
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return self.parse_envelope(response).await;
                    }
                    if !is_retryable(status) {
                        let message = response.text().await.unwrap_or_default();
                        return Err(CoordinatorError::BackendRejected {
                            kind: status.to_string(),
                            message,
                        });
                    }
                    last_error = format!("status {status}");
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            warn!(path, attempt, error = %last_error, "backend request failed");
            if let Some(metrics) = &self.metrics {
                metrics.backend_request_failures_total.inc();
            }
        }

        Err(CoordinatorError::BackendUnavailable {
            attempts,
            reason: last_error,
        })
    }

    async fn parse_envelope(&self, response: reqwest::Response) -> Result<Value, CoordinatorError> {
        let envelope: Value =
            response
                .json()
                .await
                .map_err(|e| CoordinatorError::BackendUnavailable {
                    attempts: 1,
                    reason: format!("malformed response body: {e}"),
                })?;

        if envelope.get("ok").and_then(Value::as_bool) == Some(false) {
            let error = envelope.get("error").cloned().unwrap_or(Value::Null);
            return Err(CoordinatorError::BackendRejected {
                kind: error
                    .get("kind")
                    .and_then(Value::as_str)
                    .unwrap_or("UNKNOWN")
                    .to_string(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        Ok(envelope.get("data").cloned().unwrap_or(envelope))
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .backoff_initial_secs
            .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(10));
        let capped = base.min(self.config.backoff_max_secs);
        let jitter_ms = rand::thread_rng().gen_range(0..250);
        Duration::from_secs(capped) + Duration::from_millis(jitter_ms)
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let client = BackendClient::new(BackendConfig::default()).unwrap();
        let b1 = client.backoff_for(1).as_secs();
        let b2 = client.backoff_for(2).as_secs();
        let b5 = client.backoff_for(5).as_secs();
        assert_eq!(b1, 1);
        assert_eq!(b2, 2);
        assert_eq!(b5, 10); // capped at backoff_max_secs
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
    }
}
