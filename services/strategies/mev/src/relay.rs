//! Private relay client for bundle submission.

use crate::bundle::Bundle;
use crate::MevError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleStatus {
    pub included: bool,
    pub block: Option<u64>,
    pub reason: Option<String>,
}

/// Flashbots-style relay endpoint.
#[async_trait]
pub trait BundleRelay: Send + Sync {
    /// Submit and receive the relay-issued bundle hash.
    async fn submit_bundle(&self, bundle: &Bundle) -> Result<String, MevError>;

    async fn bundle_status(&self, bundle_hash: &str) -> Result<BundleStatus, MevError>;
}

/// JSON-RPC relay client (`eth_sendBundle` / `flashbots_getBundleStats`).
pub struct HttpBundleRelay {
    http: reqwest::Client,
    url: String,
}

impl HttpBundleRelay {
    pub fn new(url: String, timeout: Duration) -> Result<Self, MevError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| MevError::RelayUnavailable {
                reason: format!("client construction failed: {e}"),
            })?;
        Ok(Self { http, url })
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, MevError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MevError::RelayUnavailable {
                reason: e.to_string(),
            })?;
        let envelope: Value =
            response
                .json()
                .await
                .map_err(|e| MevError::RelayUnavailable {
                    reason: format!("malformed relay response: {e}"),
                })?;

        if let Some(error) = envelope.get("error") {
            return Err(MevError::BundleRejected {
                reason: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified")
                    .to_string(),
            });
        }
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl BundleRelay for HttpBundleRelay {
    async fn submit_bundle(&self, bundle: &Bundle) -> Result<String, MevError> {
        let mut params = json!({
            "txs": bundle.encoded_transactions(),
            "blockNumber": format!("0x{:x}", bundle.target_block),
        });
        if let Some(min) = bundle.min_timestamp {
            params["minTimestamp"] = json!(min);
        }
        if let Some(max) = bundle.max_timestamp {
            params["maxTimestamp"] = json!(max);
        }
        if let Some(recipient) = bundle.refund_recipient {
            params["refundRecipient"] = json!(format!("0x{}", hex::encode(recipient)));
        }
        if !bundle.reverting_hashes.is_empty() {
            params["revertingTxHashes"] = json!(bundle
                .reverting_hashes
                .iter()
                .map(|h| format!("0x{}", hex::encode(h)))
                .collect::<Vec<_>>());
        }

        let result = self.rpc("eth_sendBundle", json!([params])).await?;
        let bundle_hash = result
            .get("bundleHash")
            .and_then(Value::as_str)
            .ok_or_else(|| MevError::RelayUnavailable {
                reason: "relay did not issue a bundle hash".to_string(),
            })?;
        info!(bundle_hash, target_block = bundle.target_block, "📦 bundle submitted");
        Ok(bundle_hash.to_string())
    }

    async fn bundle_status(&self, bundle_hash: &str) -> Result<BundleStatus, MevError> {
        let result = self
            .rpc("flashbots_getBundleStats", json!([{ "bundleHash": bundle_hash }]))
            .await?;
        let included = result
            .get("isIncluded")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let block = result.get("includedBlock").and_then(Value::as_u64);
        debug!(bundle_hash, included, "bundle status polled");
        Ok(BundleStatus {
            included,
            block,
            reason: result
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// In-process relay double. The `include_on_attempt` policy controls which
/// submission (1-based) lands in its target block; everything else misses.
pub struct MockRelay {
    submissions: Mutex<Vec<(String, u64)>>,
    statuses: DashMap<String, BundleStatus>,
    next_hash: AtomicU64,
    include_on_attempt: AtomicU64,
}

impl MockRelay {
    pub fn new() -> Self {
        Self {
            submissions: Mutex::new(Vec::new()),
            statuses: DashMap::new(),
            next_hash: AtomicU64::new(1),
            include_on_attempt: AtomicU64::new(1),
        }
    }

    /// Make the nth submission (1-based) the one that lands. Zero means every
    /// submission misses.
    pub fn include_on_attempt(&self, attempt: u64) {
        self.include_on_attempt.store(attempt, Ordering::SeqCst);
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }

    pub fn submitted_target_blocks(&self) -> Vec<u64> {
        self.submissions.lock().iter().map(|(_, b)| *b).collect()
    }
}

impl Default for MockRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BundleRelay for MockRelay {
    async fn submit_bundle(&self, bundle: &Bundle) -> Result<String, MevError> {
        let n = self.next_hash.fetch_add(1, Ordering::SeqCst);
        let hash = format!("0xbundle{n:02x}");
        let attempt = {
            let mut submissions = self.submissions.lock();
            submissions.push((hash.clone(), bundle.target_block));
            submissions.len() as u64
        };

        let wanted = self.include_on_attempt.load(Ordering::SeqCst);
        let status = if wanted != 0 && attempt == wanted {
            BundleStatus {
                included: true,
                block: Some(bundle.target_block),
                reason: None,
            }
        } else {
            BundleStatus {
                included: false,
                block: None,
                reason: Some("not included in target window".to_string()),
            }
        };
        self.statuses.insert(hash.clone(), status);
        Ok(hash)
    }

    async fn bundle_status(&self, bundle_hash: &str) -> Result<BundleStatus, MevError> {
        self.statuses
            .get(bundle_hash)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MevError::BundleRejected {
                reason: format!("unknown bundle {bundle_hash}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleBuilder;

    #[tokio::test]
    async fn mock_relay_includes_only_the_selected_attempt() {
        let relay = MockRelay::new();
        relay.include_on_attempt(2);
        let bundle = BundleBuilder::new(100).add_transaction(vec![0x01]).build();

        let first = relay.submit_bundle(&bundle).await.unwrap();
        let second = relay.submit_bundle(&bundle.retargeted(101)).await.unwrap();

        assert!(!relay.bundle_status(&first).await.unwrap().included);
        let status = relay.bundle_status(&second).await.unwrap();
        assert!(status.included);
        assert_eq!(status.block, Some(101));
        assert_eq!(relay.submitted_target_blocks(), vec![100, 101]);
    }
}
