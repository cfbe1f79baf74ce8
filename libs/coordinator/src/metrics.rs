//! Prometheus metrics shared across the core.
//!
//! One registry, handed down to every component; the gateway renders it at
//! `GET /metrics`.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

pub struct Metrics {
    pub registry: Registry,

    // Counters
    pub opportunities_detected_total: IntCounter,
    pub discovery_errors_total: IntCounter,
    pub discovery_dropped_total: IntCounter,
    pub executions_total: IntCounterVec,
    pub mev_protection_triggered_total: IntCounterVec,
    pub backend_request_failures_total: IntCounter,
    pub rate_limit_fail_open_total: IntCounter,
    pub webhook_duplicates_total: IntCounter,

    // Gauges
    pub active_workflows: IntGauge,
    pub inflight_executions: IntGauge,
    pub kv_keys_estimate: IntGauge,

    // Histograms
    pub plan_duration_seconds: Histogram,
    pub submission_to_inclusion_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let opportunities_detected_total = IntCounter::new(
            "opportunities_detected_total",
            "Arbitrage opportunities emitted by discovery",
        )?;
        let discovery_errors_total = IntCounter::new(
            "discovery_errors_total",
            "Template evaluations skipped due to errors",
        )?;
        let discovery_dropped_total = IntCounter::new(
            "discovery_dropped_total",
            "Opportunities dropped under emission backpressure",
        )?;
        let executions_total = IntCounterVec::new(
            Opts::new("executions_total", "Executions by terminal status"),
            &["status"],
        )?;
        let mev_protection_triggered_total = IntCounterVec::new(
            Opts::new(
                "mev_protection_triggered_total",
                "Protection actions taken, by threat type",
            ),
            &["type"],
        )?;
        let backend_request_failures_total = IntCounter::new(
            "backend_request_failures_total",
            "Failed backend control-plane requests",
        )?;
        let rate_limit_fail_open_total = IntCounter::new(
            "rate_limit_fail_open_total",
            "Rate-limit checks that failed open on substrate errors",
        )?;
        let webhook_duplicates_total = IntCounter::new(
            "webhook_duplicates_total",
            "Webhook deliveries dropped as duplicates",
        )?;

        let active_workflows = IntGauge::new("active_workflows", "Workflows currently active")?;
        let inflight_executions =
            IntGauge::new("inflight_executions", "Executions not yet terminal")?;
        let kv_keys_estimate = IntGauge::new("kv_keys_estimate", "Estimated live KV keys")?;

        let plan_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("plan_duration_seconds", "Route planning latency").buckets(vec![
                0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5,
            ]),
        )?;
        let submission_to_inclusion_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "submission_to_inclusion_seconds",
                "Latency from submission to block inclusion",
            )
            .buckets(vec![1.0, 2.0, 5.0, 10.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
        )?;

        registry.register(Box::new(opportunities_detected_total.clone()))?;
        registry.register(Box::new(discovery_errors_total.clone()))?;
        registry.register(Box::new(discovery_dropped_total.clone()))?;
        registry.register(Box::new(executions_total.clone()))?;
        registry.register(Box::new(mev_protection_triggered_total.clone()))?;
        registry.register(Box::new(backend_request_failures_total.clone()))?;
        registry.register(Box::new(rate_limit_fail_open_total.clone()))?;
        registry.register(Box::new(webhook_duplicates_total.clone()))?;
        registry.register(Box::new(active_workflows.clone()))?;
        registry.register(Box::new(inflight_executions.clone()))?;
        registry.register(Box::new(kv_keys_estimate.clone()))?;
        registry.register(Box::new(plan_duration_seconds.clone()))?;
        registry.register(Box::new(submission_to_inclusion_seconds.clone()))?;

        Ok(Self {
            registry,
            opportunities_detected_total,
            discovery_errors_total,
            discovery_dropped_total,
            executions_total,
            mev_protection_triggered_total,
            backend_request_failures_total,
            rate_limit_fail_open_total,
            webhook_duplicates_total,
            active_workflows,
            inflight_executions,
            kv_keys_estimate,
            plan_duration_seconds,
            submission_to_inclusion_seconds,
        })
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}
