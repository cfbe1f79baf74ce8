//! The execution engine: strategy dispatch, monitoring, reconciliation.

use crate::fallback::scale_amount;
use crate::flash_loan::{self, FlashLoanRegistry};
use crate::nonce::NonceManager;
use crate::rpc::{BlockchainRpc, TxReceipt};
use crate::signer::TxSigner;
use crate::ExecutionError;
use config::ExecutorConfig;
use coordinator::{Metrics, WorkflowCoordinator};
use dashmap::DashMap;
use mev::{Bundle, BundleBuilder, BundleRelay};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use types::{
    ChainId, Clock, Execution, ExecutionId, ExecutionStatus, Fingerprint, Route, Submission,
    SubmissionStrategy, ThreatLevel, TxDraft, WorkflowId,
};

/// Loan sizing handed in by the flash-loan planning path.
#[derive(Debug, Clone, PartialEq)]
pub struct FlashLoanPlan {
    pub provider: types::EvmAddress,
    pub asset: types::EvmAddress,
    pub amount: u128,
    pub loan_fee_usd: Decimal,
    pub gas_cost_usd: Decimal,
}

pub struct Executor {
    rpc: Arc<dyn BlockchainRpc>,
    signer: Arc<dyn TxSigner>,
    relay: Arc<dyn BundleRelay>,
    nonces: NonceManager,
    flash_providers: FlashLoanRegistry,
    coordinator: Option<Arc<WorkflowCoordinator>>,
    metrics: Option<Arc<Metrics>>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
    native_prices: DashMap<ChainId, Decimal>,
    executions: DashMap<ExecutionId, Execution>,
    inflight: DashMap<(WorkflowId, Fingerprint), ExecutionId>,
    stopped: DashMap<WorkflowId, ()>,
    next_id: AtomicU64,
}

impl Executor {
    pub fn new(
        rpc: Arc<dyn BlockchainRpc>,
        signer: Arc<dyn TxSigner>,
        relay: Arc<dyn BundleRelay>,
        flash_providers: FlashLoanRegistry,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            rpc,
            signer,
            relay,
            nonces: NonceManager::new(),
            flash_providers,
            coordinator: None,
            metrics: None,
            clock,
            config,
            native_prices: DashMap::new(),
            executions: DashMap::new(),
            inflight: DashMap::new(),
            stopped: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_coordinator(mut self, coordinator: Arc<WorkflowCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn set_native_price(&self, chain: ChainId, price_usd: Decimal) {
        self.native_prices.insert(chain, price_usd);
    }

    /// Cooperative stop: the engine checks this before each suspension point
    /// and aborts pending work for the workflow.
    pub fn mark_stopped(&self, workflow_id: &WorkflowId) {
        self.stopped.insert(workflow_id.clone(), ());
    }

    pub fn status(&self, id: ExecutionId) -> Option<Execution> {
        self.executions.get(&id).map(|entry| entry.value().clone())
    }

    /// Current chain head, for delay targeting and strategy selection.
    pub async fn current_block(&self) -> Result<u64, ExecutionError> {
        self.rpc.get_block_number().await
    }

    /// Prevailing network fees, for gas competitiveness decisions.
    pub async fn current_fees(&self) -> Result<crate::rpc::FeeData, ExecutionError> {
        self.rpc.get_fee_data().await
    }

    /// Submit a route. Idempotent by `(workflow, route fingerprint)`: a
    /// replayed call returns the original execution, whatever its state.
    pub async fn execute(
        &self,
        workflow_id: &WorkflowId,
        route: &Route,
        submission: Submission,
        expected_profit_usd: Decimal,
        flash: Option<FlashLoanPlan>,
    ) -> Result<Execution, ExecutionError> {
        let key = (workflow_id.clone(), route.fingerprint);
        if let Some(existing) = self.inflight.get(&key) {
            let id = *existing.value();
            drop(existing);
            if let Some(execution) = self.status(id) {
                debug!(execution = %id, "duplicate execute call, returning existing");
                return Ok(execution);
            }
        }

        let now_ns = self.clock.now_ns();
        if submission.deadline_ns <= now_ns {
            return Err(ExecutionError::ExpiredDeadline);
        }
        self.check_not_stopped(workflow_id)?;

        // Flash preconditions run before anything is signed or sent: an
        // unprofitable loan must never reach the chain.
        if let Some(plan) = &flash {
            self.flash_providers.get(&plan.provider)?;
            flash_loan::check_loan_viability(
                expected_profit_usd,
                plan.loan_fee_usd,
                plan.gas_cost_usd,
            )?;
        }

        let id = ExecutionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut execution = Execution::new(
            id,
            route.opportunity_id,
            workflow_id.clone(),
            submission,
            now_ns,
        );
        self.inflight.insert(key, id);
        self.executions.insert(id, execution.clone());
        if let Some(metrics) = &self.metrics {
            metrics.inflight_executions.inc();
        }
        info!(
            execution = %id,
            workflow = %workflow_id,
            strategy = execution.submission.strategy.as_str(),
            "⚡ executing route"
        );

        let outcome = self
            .run(workflow_id, route, &mut execution, &flash, expected_profit_usd)
            .await;
        if let Err(e) = outcome {
            // Pre-submission failures land in Failed; later stages already
            // set their terminal status.
            if execution.status == ExecutionStatus::Pending {
                execution.status = ExecutionStatus::Failed;
            }
            if execution.error.is_none() {
                execution.error = Some(e.to_string());
            }
            error!(execution = %id, error = %e, "execution failed");
        }

        self.executions.insert(id, execution.clone());
        if let Some(metrics) = &self.metrics {
            metrics.inflight_executions.dec();
        }
        self.mirror(&execution).await;
        Ok(execution)
    }

    async fn run(
        &self,
        workflow_id: &WorkflowId,
        route: &Route,
        execution: &mut Execution,
        flash: &Option<FlashLoanPlan>,
        expected_profit_usd: Decimal,
    ) -> Result<(), ExecutionError> {
        match execution.submission.strategy {
            SubmissionStrategy::Direct | SubmissionStrategy::Protected => {
                if execution.submission.strategy == SubmissionStrategy::Protected {
                    debug!(execution = %execution.id, "mempool watcher armed for protected submission");
                }
                self.submit_and_monitor(workflow_id, route, execution, flash, expected_profit_usd)
                    .await
            }
            SubmissionStrategy::Delayed => {
                let target = execution
                    .submission
                    .target_block
                    .ok_or_else(|| ExecutionError::SubmissionFailed {
                        reason: "delayed submission without target block".to_string(),
                    })?;
                self.wait_for_block(workflow_id, target, execution.submission.deadline_ns)
                    .await?;
                self.submit_and_monitor(workflow_id, route, execution, flash, expected_profit_usd)
                    .await
            }
            SubmissionStrategy::PrivateBundle => {
                self.bundle_path(workflow_id, route, execution, flash, expected_profit_usd)
                    .await
            }
        }
    }

    /// Single-transaction path: sign, send (public mempool), monitor.
    async fn submit_and_monitor(
        &self,
        workflow_id: &WorkflowId,
        route: &Route,
        execution: &mut Execution,
        flash: &Option<FlashLoanPlan>,
        expected_profit_usd: Decimal,
    ) -> Result<(), ExecutionError> {
        let draft = self.effective_draft(&execution.submission.tx, flash);
        let nonce = self
            .nonces
            .next_nonce(&*self.rpc, route.chain, self.signer.address())
            .await?;
        let raw = self
            .signer
            .sign_tx(
                &draft,
                nonce,
                execution.submission.gas_price_wei,
                execution.submission.gas_limit,
            )
            .await?;

        // Last stop check before the point of no return.
        self.check_not_stopped(workflow_id)?;

        match self.rpc.send_raw_transaction(raw).await {
            Ok(tx_hash) => {
                execution.status = ExecutionStatus::Submitted;
                execution.tx_hash = Some(tx_hash);
                info!(execution = %execution.id, tx = %hex::encode(tx_hash), "transaction submitted");
            }
            Err(e) => {
                // The reserved nonce would leave a gap; resync before anyone
                // else reserves.
                self.nonces.resync(route.chain, self.signer.address());
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(format!("submission failed: {e}"));
                return Ok(());
            }
        }

        let submitted_at_ns = self.clock.now_ns();
        self.monitor_inclusion(execution, route, expected_profit_usd, submitted_at_ns)
            .await
    }

    /// Atomic bundle path with bounded re-bundling and a protected fallback.
    async fn bundle_path(
        &self,
        workflow_id: &WorkflowId,
        route: &Route,
        execution: &mut Execution,
        flash: &Option<FlashLoanPlan>,
        expected_profit_usd: Decimal,
    ) -> Result<(), ExecutionError> {
        let raws = self.sign_bundle_legs(route, execution, flash).await?;
        let head = self.rpc.get_block_number().await?;
        let mut target = execution
            .submission
            .target_block
            .unwrap_or(head + 1)
            .max(head + 1);

        let submitted_at_ns = self.clock.now_ns();
        for attempt in 0..=self.config.max_retries {
            self.check_not_stopped(workflow_id).map_err(|e| {
                execution.error = Some("STOPPED".to_string());
                e
            })?;

            let bundle = build_bundle(&raws, target, self.signer.address());
            let bundle_hash = match self.relay.submit_bundle(&bundle).await {
                Ok(hash) => hash,
                Err(e) => {
                    // Relay outage: skip straight to the protected fallback.
                    warn!(execution = %execution.id, error = %e, "relay submission failed");
                    break;
                }
            };
            execution.status = ExecutionStatus::Submitted;
            execution.submission.bundle_id = Some(bundle_hash.clone());
            execution.submission.target_block = Some(target);
            debug!(execution = %execution.id, attempt, target, "bundle submitted");

            match self
                .poll_bundle_window(&bundle_hash, target, execution.submission.deadline_ns)
                .await?
            {
                Some(block) => {
                    execution.status = ExecutionStatus::Confirmed;
                    execution.block_number = Some(block);
                    execution.gas_used = Some(route.gas_estimate);
                    execution.confirmed_at_ns = Some(self.clock.now_ns());
                    self.reconcile(execution, route, expected_profit_usd, submitted_at_ns);
                    return Ok(());
                }
                None => {
                    warn!(execution = %execution.id, attempt, target, "bundle missed target window");
                    let head = self.rpc.get_block_number().await?;
                    target = head + 1;
                }
            }
        }

        // Every bundle attempt missed: fall back to a protected public
        // submission at competitive gas.
        warn!(execution = %execution.id, "bundle attempts exhausted, falling back to protected");
        self.nonces.resync(route.chain, self.signer.address());
        execution.submission.strategy = SubmissionStrategy::Protected;
        execution.submission.gas_price_wei = scale_gas_price(
            execution.submission.gas_price_wei,
            ThreatLevel::High.gas_multiplier(),
        );
        execution.status = ExecutionStatus::Pending;
        self.submit_and_monitor(workflow_id, route, execution, flash, expected_profit_usd)
            .await
    }

    /// Sign the bundle legs: `[route]` or `[borrow, route, repay]`.
    async fn sign_bundle_legs(
        &self,
        route: &Route,
        execution: &Execution,
        flash: &Option<FlashLoanPlan>,
    ) -> Result<Vec<Vec<u8>>, ExecutionError> {
        let submission = &execution.submission;
        let mut drafts: Vec<TxDraft> = Vec::new();

        if let Some(plan) = flash {
            let provider = self.flash_providers.get(&plan.provider)?;
            drafts.push(TxDraft {
                chain: route.chain,
                to: plan.provider,
                data: flash_loan::borrow_calldata(
                    &self.signer.address(),
                    &plan.asset,
                    plan.amount,
                    &submission.tx.data,
                ),
                value: 0,
            });
            drafts.push(submission.tx.clone());
            drafts.push(flash_loan::repay_draft(
                route.chain,
                plan.asset,
                provider,
                plan.amount,
            ));
        } else {
            drafts.push(submission.tx.clone());
        }

        let mut raws = Vec::with_capacity(drafts.len());
        for draft in &drafts {
            let nonce = self
                .nonces
                .next_nonce(&*self.rpc, route.chain, self.signer.address())
                .await?;
            raws.push(
                self.signer
                    .sign_tx(draft, nonce, submission.gas_price_wei, submission.gas_limit)
                    .await?,
            );
        }
        Ok(raws)
    }

    /// Poll a bundle until inclusion or until the chain passes the target
    /// window. `Ok(Some(block))` is inclusion; `Ok(None)` is a miss.
    async fn poll_bundle_window(
        &self,
        bundle_hash: &str,
        target: u64,
        deadline_ns: u64,
    ) -> Result<Option<u64>, ExecutionError> {
        let poll = Duration::from_millis(self.config.receipt_poll_interval_ms);
        loop {
            match self.relay.bundle_status(bundle_hash).await {
                Ok(status) if status.included => {
                    return Ok(Some(status.block.unwrap_or(target)));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(bundle = bundle_hash, error = %e, "relay status poll failed");
                }
            }

            let head = self.rpc.get_block_number().await?;
            if head > target + self.config.bundle_inclusion_window {
                return Ok(None);
            }
            if self.clock.now_ns() >= deadline_ns {
                return Ok(None);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Receipt polling until inclusion, revert, or deadline.
    async fn monitor_inclusion(
        &self,
        execution: &mut Execution,
        route: &Route,
        expected_profit_usd: Decimal,
        submitted_at_ns: u64,
    ) -> Result<(), ExecutionError> {
        let Some(tx_hash) = execution.tx_hash else {
            return Ok(());
        };
        let poll = Duration::from_millis(self.config.receipt_poll_interval_ms);
        let deadline_ns = execution.submission.deadline_ns;

        loop {
            match self.rpc.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    self.finish_with_receipt(
                        execution,
                        route,
                        receipt,
                        expected_profit_usd,
                        submitted_at_ns,
                    );
                    return Ok(());
                }
                Ok(None) => {}
                Err(e) => {
                    // Transient: keep polling, the deadline bounds us.
                    warn!(execution = %execution.id, error = %e, "receipt poll failed");
                }
            }

            if self.clock.now_ns() >= deadline_ns {
                execution.status = ExecutionStatus::TimedOut;
                execution.error = Some("no inclusion before deadline".to_string());
                warn!(execution = %execution.id, "execution timed out");
                return Ok(());
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn finish_with_receipt(
        &self,
        execution: &mut Execution,
        route: &Route,
        receipt: TxReceipt,
        expected_profit_usd: Decimal,
        submitted_at_ns: u64,
    ) {
        execution.block_number = Some(receipt.block_number);
        execution.gas_used = Some(receipt.gas_used);
        if receipt.success {
            execution.status = ExecutionStatus::Confirmed;
            execution.confirmed_at_ns = Some(self.clock.now_ns());
            self.reconcile(execution, route, expected_profit_usd, submitted_at_ns);
            info!(
                execution = %execution.id,
                block = receipt.block_number,
                profit_usd = %execution.actual_profit_usd.unwrap_or_default(),
                "✅ execution confirmed"
            );
        } else {
            execution.status = ExecutionStatus::Reverted;
            execution.error = Some("execution reverted on chain".to_string());
            warn!(execution = %execution.id, block = receipt.block_number, "❌ execution reverted");
        }
    }

    /// Record realized profit net of actual gas at inclusion and observe the
    /// submission-to-inclusion latency.
    fn reconcile(
        &self,
        execution: &mut Execution,
        route: &Route,
        expected_profit_usd: Decimal,
        submitted_at_ns: u64,
    ) {
        let gas_used = execution.gas_used.unwrap_or(route.gas_estimate);
        let native = self
            .native_prices
            .get(&route.chain)
            .map(|entry| *entry.value())
            .unwrap_or(Decimal::ONE);
        let gas_cost_usd = Decimal::from(gas_used)
            * Decimal::from_u128(execution.submission.gas_price_wei).unwrap_or_default()
            / dec!(1000000000000000000)
            * native;
        execution.actual_profit_usd = Some(expected_profit_usd - gas_cost_usd);

        if let Some(metrics) = &self.metrics {
            if let Some(confirmed_at_ns) = execution.confirmed_at_ns {
                let latency_secs =
                    confirmed_at_ns.saturating_sub(submitted_at_ns) as f64 / 1_000_000_000.0;
                metrics.submission_to_inclusion_seconds.observe(latency_secs);
            }
        }
    }

    /// Mirror the terminal record into the coordinator (by value).
    async fn mirror(&self, execution: &Execution) {
        if let Some(coordinator) = &self.coordinator {
            if let Err(e) = coordinator.record_execution(execution).await {
                warn!(execution = %execution.id, error = %e, "failed to mirror execution");
            }
        } else if let Some(metrics) = &self.metrics {
            metrics
                .executions_total
                .with_label_values(&[execution.status.as_str()])
                .inc();
        }
    }

    async fn wait_for_block(
        &self,
        workflow_id: &WorkflowId,
        target: u64,
        deadline_ns: u64,
    ) -> Result<(), ExecutionError> {
        let poll = Duration::from_millis(self.config.receipt_poll_interval_ms);
        loop {
            self.check_not_stopped(workflow_id)?;
            let head = self.rpc.get_block_number().await?;
            if head >= target {
                return Ok(());
            }
            if self.clock.now_ns() >= deadline_ns {
                return Err(ExecutionError::ExpiredDeadline);
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn check_not_stopped(&self, workflow_id: &WorkflowId) -> Result<(), ExecutionError> {
        if self.stopped.contains_key(workflow_id) {
            return Err(ExecutionError::Stopped);
        }
        Ok(())
    }

    /// For non-bundle strategies, a flash-funded route collapses into the
    /// borrow entry; the provider callback runs the swaps and repayment.
    fn effective_draft(&self, route_tx: &TxDraft, flash: &Option<FlashLoanPlan>) -> TxDraft {
        match flash {
            Some(plan) => TxDraft {
                chain: route_tx.chain,
                to: plan.provider,
                data: flash_loan::borrow_calldata(
                    &self.signer.address(),
                    &plan.asset,
                    plan.amount,
                    &route_tx.data,
                ),
                value: 0,
            },
            None => route_tx.clone(),
        }
    }

    /// Scale a retried amount per the fallback policy (exposed for the
    /// strategy engine's alternative-route path).
    pub fn scaled_retry_amount(amount: u128, scale_bps: u32) -> u128 {
        scale_amount(amount, scale_bps)
    }
}

fn build_bundle(raws: &[Vec<u8>], target_block: u64, refund: types::EvmAddress) -> Bundle {
    let mut builder = BundleBuilder::new(target_block).refund_to(refund);
    for raw in raws {
        builder = builder.add_transaction(raw.clone());
    }
    builder.build()
}

fn scale_gas_price(base_wei: u128, multiplier: Decimal) -> u128 {
    use rust_decimal::prelude::ToPrimitive;
    (Decimal::from(base_wei.min(u64::MAX as u128) as u64) * multiplier)
        .to_u128()
        .unwrap_or(base_wei)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::MockRpc;
    use crate::signer::LocalSigner;
    use config::FlashLoanProviderConfig;
    use mev::MockRelay;
    use types::{
        DexProtocol, Fingerprint, OpportunityId, PoolId, PoolRef, RouteLeg, SimClock,
    };

    const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const GWEI: u128 = 1_000_000_000;
    const PROVIDER: &str = "0x794a61358d6845594f94dc1db02a252b5b4814ad";

    struct Fixture {
        clock: Arc<SimClock>,
        rpc: Arc<MockRpc>,
        relay: Arc<MockRelay>,
        executor: Executor,
    }

    fn fixture(config: ExecutorConfig) -> Fixture {
        let clock = SimClock::new(1_000_000_000_000);
        let rpc = Arc::new(MockRpc::new(100, 30_000_000_000));
        let relay = Arc::new(MockRelay::new());
        let signer = Arc::new(LocalSigner::new(TEST_KEY, 137).unwrap());
        let flash = FlashLoanRegistry::from_config(&[FlashLoanProviderConfig {
            name: "aave_v3".to_string(),
            address: PROVIDER.to_string(),
            fee_bps: 9,
        }])
        .unwrap();

        let executor = Executor::new(
            rpc.clone(),
            signer,
            relay.clone(),
            flash,
            clock.clone(),
            config,
        );
        Fixture {
            clock,
            rpc,
            relay,
            executor,
        }
    }

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            receipt_poll_interval_ms: 1,
            max_retries: 1,
            ..ExecutorConfig::default()
        }
    }

    fn route() -> Route {
        let leg = |byte: u8| RouteLeg {
            pool: PoolRef {
                pool: PoolId(byte as u64),
                dex: DexProtocol::UniswapV2,
                address: [byte; 20],
            },
            token_in: [0x01; 20],
            token_out: [0x02; 20],
            amount_in: 1_000_000,
            expected_amount_out: 1_010_000,
            min_amount_out: 1_004_950,
            fee_bps: 30,
            gas_estimate: 120_000,
        };
        Route {
            opportunity_id: OpportunityId(9),
            chain: ChainId::POLYGON,
            legs: vec![leg(1), leg(2)],
            amount_in: 1_000_000,
            expected_amount_out: 1_010_000,
            min_amount_out_end: 1_004_950,
            price_impact_bps: 40,
            slippage_bps: 50,
            max_amount_in: 1_000_000,
            gas_estimate: 261_000,
            deadline_ns: u64::MAX,
            fingerprint: Fingerprint([0x42; 32]),
        }
    }

    fn submission(strategy: SubmissionStrategy, deadline_ns: u64) -> Submission {
        Submission {
            strategy,
            tx: TxDraft {
                chain: ChainId::POLYGON,
                to: [0xaa; 20],
                data: vec![0xca, 0x11],
                value: 0,
            },
            gas_price_wei: 30 * GWEI,
            gas_limit: 500_000,
            target_block: None,
            bundle_id: None,
            deadline_ns,
            slippage_adjustment_bps: 0,
        }
    }

    #[tokio::test]
    async fn direct_path_confirms_and_reconciles() {
        let f = fixture(fast_config());
        f.executor.set_native_price(ChainId::POLYGON, dec!(0.75));
        let deadline = f.clock.now_ns() + 60_000_000_000;

        let execution = f
            .executor
            .execute(
                &WorkflowId::from("wf-1"),
                &route(),
                submission(SubmissionStrategy::Direct, deadline),
                dec!(40),
                None,
            )
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Confirmed);
        assert!(execution.tx_hash.is_some());
        assert_eq!(execution.block_number, Some(101));
        // Reconciled profit = expected − actual gas cost (250k gas @30 gwei
        // @$0.75 native ≈ $0.0056).
        let profit = execution.actual_profit_usd.unwrap();
        assert!(profit < dec!(40) && profit > dec!(39.99));
        assert_eq!(f.rpc.submission_count(), 1);
    }

    #[tokio::test]
    async fn execute_is_idempotent_per_workflow_and_fingerprint() {
        let f = fixture(fast_config());
        let deadline = f.clock.now_ns() + 60_000_000_000;
        let wf = WorkflowId::from("wf-1");

        let first = f
            .executor
            .execute(
                &wf,
                &route(),
                submission(SubmissionStrategy::Direct, deadline),
                dec!(40),
                None,
            )
            .await
            .unwrap();
        let second = f
            .executor
            .execute(
                &wf,
                &route(),
                submission(SubmissionStrategy::Direct, deadline),
                dec!(40),
                None,
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(f.rpc.submission_count(), 1, "no double submission");

        // A different workflow with the same route is a fresh execution.
        let other = f
            .executor
            .execute(
                &WorkflowId::from("wf-2"),
                &route(),
                submission(SubmissionStrategy::Direct, deadline),
                dec!(40),
                None,
            )
            .await
            .unwrap();
        assert_ne!(other.id, first.id);
    }

    #[tokio::test]
    async fn reverted_transaction_is_terminal() {
        let f = fixture(fast_config());
        f.rpc.set_revert_all(true);
        let deadline = f.clock.now_ns() + 60_000_000_000;

        let execution = f
            .executor
            .execute(
                &WorkflowId::from("wf-1"),
                &route(),
                submission(SubmissionStrategy::Direct, deadline),
                dec!(40),
                None,
            )
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Reverted);
        assert!(execution.status.is_terminal());
        assert!(execution.error.as_deref().unwrap().contains("reverted"));
    }

    #[tokio::test]
    async fn missing_inclusion_times_out_at_the_deadline() {
        let f = fixture(fast_config());
        f.rpc.set_auto_confirm(false);
        let deadline = f.clock.now_ns() + 1_000_000_000; // 1s on the sim clock

        let clock = f.clock.clone();
        let executor = Arc::new(f.executor);
        let task_executor = executor.clone();
        let handle = tokio::spawn(async move {
            task_executor
                .execute(
                    &WorkflowId::from("wf-1"),
                    &route(),
                    submission(SubmissionStrategy::Direct, deadline),
                    dec!(40),
                    None,
                )
                .await
        });

        // Let it submit and start polling, then push the clock past the
        // deadline.
        tokio::time::sleep(Duration::from_millis(30)).await;
        clock.advance(Duration::from_secs(2));

        let execution = handle.await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::TimedOut);
    }

    #[tokio::test]
    async fn submission_failure_lands_in_failed() {
        let f = fixture(fast_config());
        f.rpc.set_fail_submission(true);
        let deadline = f.clock.now_ns() + 60_000_000_000;

        let execution = f
            .executor
            .execute(
                &WorkflowId::from("wf-1"),
                &route(),
                submission(SubmissionStrategy::Direct, deadline),
                dec!(40),
                None,
            )
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn unprofitable_flash_loan_never_reaches_the_chain() {
        let f = fixture(fast_config());
        let deadline = f.clock.now_ns() + 60_000_000_000;

        let provider: [u8; 20] = hex::decode(PROVIDER.trim_start_matches("0x"))
            .unwrap()
            .try_into()
            .unwrap();
        // Profit only 0.10 above the loan fee; gas pushes it under water.
        let plan = FlashLoanPlan {
            provider,
            asset: [0x01; 20],
            amount: 1_000_000_000,
            loan_fee_usd: dec!(7.0),
            gas_cost_usd: dec!(3.0),
        };

        let err = f
            .executor
            .execute(
                &WorkflowId::from("wf-1"),
                &route(),
                submission(SubmissionStrategy::PrivateBundle, deadline),
                dec!(7.1),
                Some(plan),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::UnprofitableLoan { .. }));
        assert_eq!(err.kind(), types::ErrorKind::NoProfitableRoute);
        assert_eq!(f.rpc.submission_count(), 0, "no transaction sent");
        assert_eq!(f.relay.submission_count(), 0, "no bundle sent");
    }

    #[tokio::test]
    async fn bundle_misses_rebundle_once_then_fall_back_to_protected() {
        let f = fixture(fast_config()); // max_retries = 1 → two bundle attempts
        f.rpc.set_auto_mine(true); // block head advances so windows pass
        f.relay.include_on_attempt(0); // every bundle misses
        let deadline = f.clock.now_ns() + 600_000_000_000;

        let execution = f
            .executor
            .execute(
                &WorkflowId::from("wf-1"),
                &route(),
                submission(SubmissionStrategy::PrivateBundle, deadline),
                dec!(40),
                None,
            )
            .await
            .unwrap();

        assert_eq!(f.relay.submission_count(), 2, "initial bundle + one re-bundle");
        assert_eq!(f.rpc.submission_count(), 1, "protected fallback tx");
        assert_eq!(execution.submission.strategy, SubmissionStrategy::Protected);
        // Fallback gas = 30 gwei × 1.30.
        assert_eq!(execution.submission.gas_price_wei, 39 * GWEI);
        assert_eq!(execution.status, ExecutionStatus::Confirmed);
    }

    #[tokio::test]
    async fn included_bundle_confirms_without_public_submission() {
        let f = fixture(fast_config());
        f.rpc.set_auto_mine(true);
        f.relay.include_on_attempt(1);
        let deadline = f.clock.now_ns() + 600_000_000_000;

        let execution = f
            .executor
            .execute(
                &WorkflowId::from("wf-1"),
                &route(),
                submission(SubmissionStrategy::PrivateBundle, deadline),
                dec!(40),
                None,
            )
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Confirmed);
        assert!(execution.submission.bundle_id.is_some());
        assert_eq!(f.rpc.submission_count(), 0, "bundle path bypasses mempool");
    }

    #[tokio::test]
    async fn flash_bundle_carries_borrow_route_repay() {
        let f = fixture(fast_config());
        f.rpc.set_auto_mine(true);
        f.relay.include_on_attempt(1);
        let deadline = f.clock.now_ns() + 600_000_000_000;

        let provider: [u8; 20] = hex::decode(PROVIDER.trim_start_matches("0x"))
            .unwrap()
            .try_into()
            .unwrap();
        let plan = FlashLoanPlan {
            provider,
            asset: [0x01; 20],
            amount: 1_000_000_000,
            loan_fee_usd: dec!(0.9),
            gas_cost_usd: dec!(1.0),
        };

        let execution = f
            .executor
            .execute(
                &WorkflowId::from("wf-1"),
                &route(),
                submission(SubmissionStrategy::PrivateBundle, deadline),
                dec!(40),
                Some(plan),
            )
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Confirmed);
        assert_eq!(f.relay.submission_count(), 1);
    }

    #[tokio::test]
    async fn stopped_workflow_aborts_before_submission() {
        let f = fixture(fast_config());
        let wf = WorkflowId::from("wf-halt");
        f.executor.mark_stopped(&wf);
        let deadline = f.clock.now_ns() + 60_000_000_000;

        let err = f
            .executor
            .execute(
                &wf,
                &route(),
                submission(SubmissionStrategy::Direct, deadline),
                dec!(40),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Stopped));
        assert_eq!(f.rpc.submission_count(), 0);
    }

    #[tokio::test]
    async fn expired_deadline_is_rejected_upfront() {
        let f = fixture(fast_config());
        let past = f.clock.now_ns().saturating_sub(1);

        let err = f
            .executor
            .execute(
                &WorkflowId::from("wf-1"),
                &route(),
                submission(SubmissionStrategy::Direct, past),
                dec!(40),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ExpiredDeadline));
    }
}
