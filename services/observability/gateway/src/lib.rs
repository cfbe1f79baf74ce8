//! # ArbitrageX Gateway
//!
//! The exposed HTTP surface: Prometheus metrics, workflow control, cached
//! opportunity lookups, and the HMAC-verified webhook sink.
//!
//! Every response is the uniform envelope
//! `{ok, data?, error?: {kind, message, request_id}, request_id}`; transient
//! error kinds additionally set `Retry-After`.

use config::GatewayConfig;
use coordinator::{CoordinatorError, Metrics, WebhookEvent, WebhookProcessor, WorkflowCoordinator};
use hmac::{Hmac, Mac};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use sha2::Sha256;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use types::{ErrorKind, WorkflowId};

type HmacSha256 = Hmac<Sha256>;

pub struct Gateway {
    coordinator: Arc<WorkflowCoordinator>,
    webhooks: Arc<WebhookProcessor>,
    metrics: Arc<Metrics>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(
        coordinator: Arc<WorkflowCoordinator>,
        webhooks: Arc<WebhookProcessor>,
        metrics: Arc<Metrics>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            coordinator,
            webhooks,
            metrics,
            config,
        }
    }

    /// Bind and serve until the process exits.
    pub async fn serve(self: Arc<Self>) -> Result<(), hyper::Error> {
        let address: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], self.config.port)));

        let gateway = self.clone();
        let make_svc = make_service_fn(move |_conn| {
            let gateway = gateway.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let gateway = gateway.clone();
                    async move { Ok::<_, Infallible>(gateway.handle(req).await) }
                }))
            }
        });

        info!("🌐 gateway listening on http://{address}");
        Server::bind(&address).serve(make_svc).await
    }

    /// Route one request. Public for in-process testing.
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let response = match (&method, path.as_str()) {
            (&Method::GET, "/metrics") => self.metrics_text(),
            (&Method::GET, p) if p.starts_with("/opportunities/") => {
                self.get_opportunity(&p["/opportunities/".len()..], &request_id)
                    .await
            }
            (&Method::POST, "/workflows") => self.start_workflow(req, &request_id).await,
            (&Method::POST, p) if p.starts_with("/workflows/") && p.ends_with("/stop") => {
                let id = &p["/workflows/".len()..p.len() - "/stop".len()];
                self.stop_workflow(id, &request_id).await
            }
            (&Method::GET, p) if p.starts_with("/workflows/") => {
                self.get_workflow(&p["/workflows/".len()..], &request_id)
                    .await
            }
            (&Method::POST, "/webhooks") => self.webhook(req, &request_id).await,
            _ => error_response(
                &request_id,
                ErrorKind::NotFound,
                format!("no route for {method} {path}"),
            ),
        };
        response
    }

    fn metrics_text(&self) -> Response<Body> {
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4")
            .body(Body::from(self.metrics.render()))
            .unwrap_or_default()
    }

    async fn get_opportunity(&self, fingerprint: &str, request_id: &str) -> Response<Body> {
        match self.coordinator.get_opportunity(fingerprint).await {
            Some(value) => ok_response(request_id, value),
            None => error_response(
                request_id,
                ErrorKind::NotFound,
                format!("opportunity {fingerprint} not found"),
            ),
        }
    }

    async fn start_workflow(&self, req: Request<Body>, request_id: &str) -> Response<Body> {
        let Ok(body) = hyper::body::to_bytes(req.into_body()).await else {
            return error_response(request_id, ErrorKind::Validation, "unreadable body".into());
        };
        let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
            return error_response(request_id, ErrorKind::Validation, "body is not JSON".into());
        };
        let Some(id) = payload.get("id").and_then(Value::as_str) else {
            return error_response(request_id, ErrorKind::Validation, "missing 'id'".into());
        };
        let config = payload.get("config").cloned().unwrap_or(json!({}));

        match self
            .coordinator
            .start_workflow(&WorkflowId::from(id), config)
            .await
        {
            Ok(state) => match serde_json::to_value(&state) {
                Ok(value) => ok_response(request_id, value),
                Err(e) => internal_error(request_id, e),
            },
            Err(e) => coordinator_error(request_id, e),
        }
    }

    async fn stop_workflow(&self, id: &str, request_id: &str) -> Response<Body> {
        match self.coordinator.stop_workflow(&WorkflowId::from(id)).await {
            Ok(state) => match serde_json::to_value(&state) {
                Ok(value) => ok_response(request_id, value),
                Err(e) => internal_error(request_id, e),
            },
            Err(e) => coordinator_error(request_id, e),
        }
    }

    async fn get_workflow(&self, id: &str, request_id: &str) -> Response<Body> {
        match self
            .coordinator
            .get_workflow_state(&WorkflowId::from(id))
            .await
        {
            Ok(Some(state)) => match serde_json::to_value(&state) {
                Ok(value) => ok_response(request_id, value),
                Err(e) => internal_error(request_id, e),
            },
            Ok(None) => error_response(
                request_id,
                ErrorKind::NotFound,
                format!("workflow {id} not found"),
            ),
            Err(e) => coordinator_error(request_id, e),
        }
    }

    async fn webhook(&self, req: Request<Body>, request_id: &str) -> Response<Body> {
        let signature = req
            .headers()
            .get("x-signature")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let Ok(body) = hyper::body::to_bytes(req.into_body()).await else {
            return error_response(request_id, ErrorKind::Validation, "unreadable body".into());
        };

        if !self.verify_signature(&body, signature.as_deref()) {
            warn!("webhook rejected: bad signature");
            return error_response(
                request_id,
                ErrorKind::InvalidSignature,
                "HMAC verification failed".into(),
            );
        }

        let Ok(event) = serde_json::from_slice::<WebhookEvent>(&body) else {
            return error_response(
                request_id,
                ErrorKind::Validation,
                "body is not a webhook event".into(),
            );
        };

        match self.webhooks.process(event).await {
            Ok(outcome) => ok_response(request_id, json!({ "outcome": format!("{outcome:?}") })),
            Err(e) => coordinator_error(request_id, e),
        }
    }

    /// HMAC-SHA256 over the raw body; constant-time comparison. An empty
    /// configured secret disables verification (local development only).
    fn verify_signature(&self, body: &[u8], signature_hex: Option<&str>) -> bool {
        if self.config.webhook_secret.is_empty() {
            return true;
        }
        let Some(signature_hex) = signature_hex else {
            return false;
        };
        let Ok(signature) = hex::decode(signature_hex.trim_start_matches("sha256=")) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.config.webhook_secret.as_bytes()) else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&signature).is_ok()
    }
}

fn ok_response(request_id: &str, data: Value) -> Response<Body> {
    let body = json!({
        "ok": true,
        "data": data,
        "request_id": request_id,
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}

fn error_response(request_id: &str, kind: ErrorKind, message: String) -> Response<Body> {
    let status = match kind {
        ErrorKind::Validation | ErrorKind::InvalidSignature => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::LockHeld => StatusCode::CONFLICT,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        k if k.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = json!({
        "ok": false,
        "error": {
            "kind": kind.as_str(),
            "message": message,
            "request_id": request_id,
        },
        "request_id": request_id,
    });

    let mut builder = Response::builder()
        .status(status)
        .header("content-type", "application/json");
    if kind.is_transient() {
        builder = builder.header("retry-after", "1");
    }
    builder
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}

fn coordinator_error(request_id: &str, error: CoordinatorError) -> Response<Body> {
    error_response(request_id, error.kind(), error.to_string())
}

fn internal_error(request_id: &str, error: impl std::error::Error) -> Response<Body> {
    error!(error = %error, "gateway internal error");
    error_response(request_id, ErrorKind::Internal, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::CoordinatorConfig;
    use coordinator::MemoryKv;
    use types::SimClock;

    fn gateway(secret: &str) -> Arc<Gateway> {
        let clock = SimClock::new(1_000_000_000);
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let coordinator = Arc::new(WorkflowCoordinator::new(
            kv.clone(),
            clock,
            CoordinatorConfig::default(),
        ));
        let webhooks = Arc::new(WebhookProcessor::new(coordinator.clone(), kv));
        let metrics = Arc::new(Metrics::new().unwrap());
        Arc::new(Gateway::new(
            coordinator,
            webhooks,
            metrics,
            GatewayConfig {
                webhook_secret: secret.to_string(),
                ..GatewayConfig::default()
            },
        ))
    }

    async fn body_json(response: Response<Body>) -> Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn workflow_lifecycle_over_http() {
        let gateway = gateway("");

        let start = Request::builder()
            .method(Method::POST)
            .uri("/workflows")
            .body(Body::from(r#"{"id":"wf-http","config":{"x":1}}"#))
            .unwrap();
        let response = gateway.handle(start).await;
        assert_eq!(response.status(), StatusCode::OK);
        let envelope = body_json(response).await;
        assert_eq!(envelope["ok"], json!(true));
        assert_eq!(envelope["data"]["status"], json!("starting"));

        let get = Request::builder()
            .method(Method::GET)
            .uri("/workflows/wf-http")
            .body(Body::empty())
            .unwrap();
        let envelope = body_json(gateway.handle(get).await).await;
        assert_eq!(envelope["data"]["id"], json!("wf-http"));

        // Second start: the id is pinned, surfaced as a client error.
        let duplicate = Request::builder()
            .method(Method::POST)
            .uri("/workflows")
            .body(Body::from(r#"{"id":"wf-http"}"#))
            .unwrap();
        let response = gateway.handle(duplicate).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let envelope = body_json(response).await;
        assert_eq!(envelope["ok"], json!(false));
    }

    #[tokio::test]
    async fn missing_workflow_is_404_with_envelope() {
        let gateway = gateway("");
        let response = gateway
            .handle(
                Request::builder()
                    .method(Method::GET)
                    .uri("/workflows/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let envelope = body_json(response).await;
        assert_eq!(envelope["error"]["kind"], json!("NOT_FOUND"));
        assert!(envelope["request_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_text() {
        let gateway = gateway("");
        gateway.metrics.opportunities_detected_total.inc();
        let response = gateway
            .handle(
                Request::builder()
                    .method(Method::GET)
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("opportunities_detected_total 1"));
    }

    #[tokio::test]
    async fn webhook_requires_a_valid_signature() {
        let gateway = gateway("secret-key");
        let payload = r#"{"event_type":"live_metrics","workflow_id":"wf-1","monotonic_ts":1,"payload":{}}"#;

        // Unsigned: rejected.
        let response = gateway
            .handle(
                Request::builder()
                    .method(Method::POST)
                    .uri("/webhooks")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Properly signed: accepted (workflow missing → envelope error, but
        // the signature gate passes).
        let mut mac = HmacSha256::new_from_slice(b"secret-key").unwrap();
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let response = gateway
            .handle(
                Request::builder()
                    .method(Method::POST)
                    .uri("/webhooks")
                    .header("x-signature", signature)
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await;
        assert_ne!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_replay_reports_duplicate() {
        let gateway = gateway("");
        let start = Request::builder()
            .method(Method::POST)
            .uri("/workflows")
            .body(Body::from(r#"{"id":"wf-1"}"#))
            .unwrap();
        gateway.handle(start).await;

        let payload = r#"{"event_type":"live_metrics","workflow_id":"wf-1","monotonic_ts":7,"payload":{"p":1}}"#;
        let request = |payload: &str| {
            Request::builder()
                .method(Method::POST)
                .uri("/webhooks")
                .body(Body::from(payload.to_string()))
                .unwrap()
        };

        let first = body_json(gateway.handle(request(payload)).await).await;
        assert_eq!(first["data"]["outcome"], json!("Applied"));
        let second = body_json(gateway.handle(request(payload)).await).await;
        assert_eq!(second["data"]["outcome"], json!("Duplicate"));
    }
}
