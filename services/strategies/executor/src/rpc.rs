//! Blockchain RPC abstraction and the ethers-backed implementation.
//!
//! The ethers client keeps pooled connections warm and walks an ordered list
//! of backup endpoints when the primary fails or times out. Results are
//! idempotent by transaction hash, so a retried submit is harmless.

use crate::ExecutionError;
use async_trait::async_trait;
use dashmap::DashMap;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    BlockNumber, Bytes, Filter, NameOrAddress, TransactionRequest, H160, H256, U256,
};
use parking_lot::Mutex;
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use types::{EvmAddress, TxDraft};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeData {
    pub gas_price_wei: u128,
    pub max_fee_per_gas_wei: u128,
    pub max_priority_fee_per_gas_wei: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: [u8; 32],
    pub block_number: u64,
    pub gas_used: u64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub address: EvmAddress,
    pub topics: Vec<[u8; 32]>,
    pub data: Vec<u8>,
}

/// The RPC capability set the executor consumes.
#[async_trait]
pub trait BlockchainRpc: Send + Sync {
    async fn get_block_number(&self) -> Result<u64, ExecutionError>;
    async fn get_fee_data(&self) -> Result<FeeData, ExecutionError>;
    async fn estimate_gas(&self, tx: &TxDraft) -> Result<u64, ExecutionError>;
    async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<[u8; 32], ExecutionError>;
    async fn get_transaction_receipt(
        &self,
        tx_hash: [u8; 32],
    ) -> Result<Option<TxReceipt>, ExecutionError>;
    async fn get_logs(
        &self,
        address: EvmAddress,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>, ExecutionError>;
    async fn call(&self, tx: &TxDraft) -> Result<Vec<u8>, ExecutionError>;
    async fn get_transaction_count(&self, address: EvmAddress) -> Result<u64, ExecutionError>;
}

/// HTTP JSON-RPC client over ethers with primary/backup failover.
pub struct EthersRpc {
    providers: Vec<Provider<Http>>,
}

impl EthersRpc {
    pub fn new(
        primary_url: &str,
        backup_urls: &[String],
        request_timeout: Duration,
    ) -> Result<Self, ExecutionError> {
        // Pooled connections shave connection setup off the submit path.
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(5)
            .timeout(request_timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| ExecutionError::RpcUnavailable {
                reason: format!("http client construction failed: {e}"),
            })?;

        let mut providers = Vec::with_capacity(1 + backup_urls.len());
        for url in std::iter::once(primary_url).chain(backup_urls.iter().map(String::as_str)) {
            let parsed: Url = url.parse().map_err(|e| ExecutionError::RpcUnavailable {
                reason: format!("invalid RPC url {url}: {e}"),
            })?;
            providers.push(Provider::new(Http::new_with_client(
                parsed,
                client.clone(),
            )));
        }
        info!(
            endpoints = providers.len(),
            "⚡ RPC client initialized with failover"
        );
        Ok(Self { providers })
    }

    /// Run an operation against the primary, walking backups on failure.
    async fn with_failover<T, F, Fut>(&self, op: F) -> Result<T, ExecutionError>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ethers::providers::ProviderError>>,
    {
        let mut last_error = String::new();
        for (index, provider) in self.providers.iter().enumerate() {
            match op(provider.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if index == 0 {
                        warn!(error = %e, "primary RPC failed, trying backups");
                    } else {
                        debug!(backup = index, error = %e, "backup RPC failed");
                    }
                    last_error = e.to_string();
                }
            }
        }
        Err(ExecutionError::RpcUnavailable { reason: last_error })
    }

    fn draft_to_request(tx: &TxDraft) -> TransactionRequest {
        TransactionRequest {
            to: Some(NameOrAddress::Address(H160::from(tx.to))),
            data: Some(Bytes::from(tx.data.clone())),
            value: Some(U256::from(tx.value)),
            ..Default::default()
        }
    }
}

#[async_trait]
impl BlockchainRpc for EthersRpc {
    async fn get_block_number(&self) -> Result<u64, ExecutionError> {
        self.with_failover(|p| async move { p.get_block_number().await })
            .await
            .map(|n| n.as_u64())
    }

    async fn get_fee_data(&self) -> Result<FeeData, ExecutionError> {
        let gas_price = self
            .with_failover(|p| async move { p.get_gas_price().await })
            .await?;
        let price = gas_price.as_u128();
        Ok(FeeData {
            gas_price_wei: price,
            // Legacy-compatible defaults; EIP-1559 fields track the base fee.
            max_fee_per_gas_wei: price.saturating_mul(2),
            max_priority_fee_per_gas_wei: price / 10,
        })
    }

    async fn estimate_gas(&self, tx: &TxDraft) -> Result<u64, ExecutionError> {
        let request: TypedTransaction = Self::draft_to_request(tx).into();
        self.with_failover(|p| {
            let request = request.clone();
            async move { p.estimate_gas(&request, None).await }
        })
        .await
        .map(|gas| gas.as_u64())
    }

    async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<[u8; 32], ExecutionError> {
        let bytes = Bytes::from(raw);
        self.with_failover(|p| {
            let bytes = bytes.clone();
            async move {
                let pending = p.send_raw_transaction(bytes).await?;
                Ok(pending.tx_hash())
            }
        })
        .await
        .map(|hash: H256| hash.0)
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: [u8; 32],
    ) -> Result<Option<TxReceipt>, ExecutionError> {
        let receipt = self
            .with_failover(|p| async move { p.get_transaction_receipt(H256(tx_hash)).await })
            .await?;
        Ok(receipt.map(|r| TxReceipt {
            tx_hash,
            block_number: r.block_number.unwrap_or_default().as_u64(),
            gas_used: r.gas_used.unwrap_or_default().as_u64(),
            success: r.status.map(|s| s.as_u64() == 1).unwrap_or(false),
        }))
    }

    async fn get_logs(
        &self,
        address: EvmAddress,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>, ExecutionError> {
        let filter = Filter::new()
            .address(H160::from(address))
            .from_block(BlockNumber::Number(from_block.into()))
            .to_block(BlockNumber::Number(to_block.into()));
        let logs = self
            .with_failover(|p| {
                let filter = filter.clone();
                async move { p.get_logs(&filter).await }
            })
            .await?;
        Ok(logs
            .into_iter()
            .map(|log| LogEntry {
                address: log.address.0,
                topics: log.topics.iter().map(|t| t.0).collect(),
                data: log.data.to_vec(),
            })
            .collect())
    }

    async fn call(&self, tx: &TxDraft) -> Result<Vec<u8>, ExecutionError> {
        let request: TypedTransaction = Self::draft_to_request(tx).into();
        self.with_failover(|p| {
            let request = request.clone();
            async move { p.call(&request, None).await }
        })
        .await
        .map(|bytes| bytes.to_vec())
    }

    async fn get_transaction_count(&self, address: EvmAddress) -> Result<u64, ExecutionError> {
        self.with_failover(|p| async move { p.get_transaction_count(H160::from(address), None).await })
            .await
            .map(|n| n.as_u64())
    }
}

/// In-process RPC double for engine tests.
///
/// `auto_confirm` mints a receipt for every submitted transaction one block
/// after the current head; `revert_all` flips those receipts to failures;
/// `auto_mine` advances the head on every block-number read so block-wait
/// loops terminate without a background miner.
pub struct MockRpc {
    block: AtomicU64,
    gas_price_wei: AtomicU64,
    submitted: Mutex<Vec<Vec<u8>>>,
    receipts: DashMap<[u8; 32], TxReceipt>,
    nonces: DashMap<EvmAddress, u64>,
    auto_confirm: AtomicBool,
    revert_all: AtomicBool,
    fail_submission: AtomicBool,
    auto_mine: AtomicBool,
}

impl MockRpc {
    pub fn new(start_block: u64, gas_price_wei: u64) -> Self {
        Self {
            block: AtomicU64::new(start_block),
            gas_price_wei: AtomicU64::new(gas_price_wei),
            submitted: Mutex::new(Vec::new()),
            receipts: DashMap::new(),
            nonces: DashMap::new(),
            auto_confirm: AtomicBool::new(true),
            revert_all: AtomicBool::new(false),
            fail_submission: AtomicBool::new(false),
            auto_mine: AtomicBool::new(false),
        }
    }

    pub fn set_auto_confirm(&self, on: bool) {
        self.auto_confirm.store(on, Ordering::SeqCst);
    }

    pub fn set_revert_all(&self, on: bool) {
        self.revert_all.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_submission(&self, on: bool) {
        self.fail_submission.store(on, Ordering::SeqCst);
    }

    pub fn set_auto_mine(&self, on: bool) {
        self.auto_mine.store(on, Ordering::SeqCst);
    }

    pub fn advance_block(&self, by: u64) {
        self.block.fetch_add(by, Ordering::SeqCst);
    }

    pub fn set_nonce(&self, address: EvmAddress, nonce: u64) {
        self.nonces.insert(address, nonce);
    }

    pub fn submitted_transactions(&self) -> Vec<Vec<u8>> {
        self.submitted.lock().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submitted.lock().len()
    }

    fn hash_of(raw: &[u8]) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update(raw);
        let digest = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&digest);
        hash
    }
}

#[async_trait]
impl BlockchainRpc for MockRpc {
    async fn get_block_number(&self) -> Result<u64, ExecutionError> {
        if self.auto_mine.load(Ordering::SeqCst) {
            return Ok(self.block.fetch_add(1, Ordering::SeqCst) + 1);
        }
        Ok(self.block.load(Ordering::SeqCst))
    }

    async fn get_fee_data(&self) -> Result<FeeData, ExecutionError> {
        let price = self.gas_price_wei.load(Ordering::SeqCst) as u128;
        Ok(FeeData {
            gas_price_wei: price,
            max_fee_per_gas_wei: price * 2,
            max_priority_fee_per_gas_wei: price / 10,
        })
    }

    async fn estimate_gas(&self, _tx: &TxDraft) -> Result<u64, ExecutionError> {
        Ok(300_000)
    }

    async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<[u8; 32], ExecutionError> {
        if self.fail_submission.load(Ordering::SeqCst) {
            return Err(ExecutionError::SubmissionFailed {
                reason: "mock submission failure".to_string(),
            });
        }
        let hash = Self::hash_of(&raw);
        self.submitted.lock().push(raw);

        if self.auto_confirm.load(Ordering::SeqCst) {
            let block = self.block.load(Ordering::SeqCst) + 1;
            self.receipts.insert(
                hash,
                TxReceipt {
                    tx_hash: hash,
                    block_number: block,
                    gas_used: 250_000,
                    success: !self.revert_all.load(Ordering::SeqCst),
                },
            );
        }
        Ok(hash)
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: [u8; 32],
    ) -> Result<Option<TxReceipt>, ExecutionError> {
        Ok(self.receipts.get(&tx_hash).map(|entry| *entry.value()))
    }

    async fn get_logs(
        &self,
        _address: EvmAddress,
        _from_block: u64,
        _to_block: u64,
    ) -> Result<Vec<LogEntry>, ExecutionError> {
        Ok(Vec::new())
    }

    async fn call(&self, _tx: &TxDraft) -> Result<Vec<u8>, ExecutionError> {
        Ok(Vec::new())
    }

    async fn get_transaction_count(&self, address: EvmAddress) -> Result<u64, ExecutionError> {
        Ok(self
            .nonces
            .get(&address)
            .map(|entry| *entry.value())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::ChainId;

    fn draft() -> TxDraft {
        TxDraft {
            chain: ChainId::POLYGON,
            to: [0xaa; 20],
            data: vec![0x01],
            value: 0,
        }
    }

    #[tokio::test]
    async fn mock_confirms_submissions_idempotently() {
        let rpc = MockRpc::new(100, 30_000_000_000);
        let hash = rpc.send_raw_transaction(vec![0x01, 0x02]).await.unwrap();

        let receipt = rpc.get_transaction_receipt(hash).await.unwrap().unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.block_number, 101);

        // Same payload hashes to the same tx, so retries are idempotent.
        let replay = rpc.send_raw_transaction(vec![0x01, 0x02]).await.unwrap();
        assert_eq!(replay, hash);
    }

    #[tokio::test]
    async fn auto_mine_advances_the_head() {
        let rpc = MockRpc::new(100, 1);
        rpc.set_auto_mine(true);
        let first = rpc.get_block_number().await.unwrap();
        let second = rpc.get_block_number().await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn call_and_estimate_have_defaults() {
        let rpc = MockRpc::new(1, 1);
        assert_eq!(rpc.estimate_gas(&draft()).await.unwrap(), 300_000);
        assert!(rpc.call(&draft()).await.unwrap().is_empty());
    }
}
