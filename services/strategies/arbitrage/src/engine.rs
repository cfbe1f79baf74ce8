//! Strategy engine: the coordination hub wiring discovery through execution.
//!
//! Each emitted opportunity becomes a workflow: at-most-once started through
//! the coordinator, planned under a bounded planner pool, threat-analyzed,
//! and executed on a per-chain FIFO lane that preserves nonce order. The
//! engine polls workflow state before suspension points so a stop request
//! lands between stages, never mid-submission.

use anyhow::{anyhow, Context, Result};
use arbx_amm::AdapterRegistry;
use config::CoreConfig;
use coordinator::{Metrics, WorkflowCoordinator};
use dashmap::DashMap;
use discovery::OpportunityDetector;
use executor::{Executor as ExecutionEngine, ExecutionError, FlashLoanPlan};
use mev::{MempoolSignal, PoolAnomaly, ProtectionController, ThreatAnalyzer};
use parking_lot::RwLock;
use router::{Planner, RouterError};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sha3_selector::selector;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info, warn};
use types::{
    ChainId, Clock, EvmAddress, Execution, ExecutionStatus, Opportunity, PoolUpdate, Route,
    Submission, TxDraft, WorkflowId, WorkflowStatus,
};

/// Planner pool size per chain.
const PLANNER_CONCURRENCY: usize = 4;
/// Stateless analyzer concurrency.
const ANALYZER_CONCURRENCY: usize = 8;

mod sha3_selector {
    use sha3::{Digest, Keccak256};

    pub fn selector(signature: &str) -> [u8; 4] {
        let mut hasher = Keccak256::new();
        hasher.update(signature.as_bytes());
        let digest = hasher.finalize();
        [digest[0], digest[1], digest[2], digest[3]]
    }
}

struct ExecutionJob {
    workflow_id: WorkflowId,
    route: Route,
    submission: Submission,
    expected_profit_usd: Decimal,
    flash: Option<FlashLoanPlan>,
    reply: oneshot::Sender<Result<Execution, ExecutionError>>,
}

pub struct StrategyEngine {
    config: CoreConfig,
    detector: Arc<OpportunityDetector>,
    planner: Arc<Planner>,
    analyzer: Arc<ThreatAnalyzer>,
    controller: Arc<ProtectionController>,
    executors: HashMap<ChainId, Arc<ExecutionEngine>>,
    coordinator: Arc<WorkflowCoordinator>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    planner_permits: Arc<Semaphore>,
    analyzer_permits: Arc<Semaphore>,
    mempool_signals: Arc<RwLock<Vec<MempoolSignal>>>,
    pool_anomalies: Arc<RwLock<Vec<PoolAnomaly>>>,
    prices: DashMap<(ChainId, EvmAddress), (Decimal, u8)>,
    chain_lanes: DashMap<ChainId, mpsc::Sender<ExecutionJob>>,
    arb_contract: EvmAddress,
}

impl StrategyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoreConfig,
        detector: Arc<OpportunityDetector>,
        planner: Arc<Planner>,
        analyzer: Arc<ThreatAnalyzer>,
        controller: Arc<ProtectionController>,
        executors: HashMap<ChainId, Arc<ExecutionEngine>>,
        coordinator: Arc<WorkflowCoordinator>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let arb_contract = parse_address(&config.executor.arb_contract)
            .context("invalid executor.arb_contract address")?;
        Ok(Self {
            config,
            detector,
            planner,
            analyzer,
            controller,
            executors,
            coordinator,
            clock,
            metrics,
            planner_permits: Arc::new(Semaphore::new(PLANNER_CONCURRENCY)),
            analyzer_permits: Arc::new(Semaphore::new(ANALYZER_CONCURRENCY)),
            mempool_signals: Arc::new(RwLock::new(Vec::new())),
            pool_anomalies: Arc::new(RwLock::new(Vec::new())),
            prices: DashMap::new(),
            chain_lanes: DashMap::new(),
            arb_contract,
        })
    }

    /// Feed a market-data price tick to every price consumer.
    pub fn update_token_price(
        &self,
        chain: ChainId,
        token: EvmAddress,
        price_usd: Decimal,
        decimals: u8,
    ) {
        self.prices.insert((chain, token), (price_usd, decimals));
        self.detector.update_token_price(chain, token, price_usd);
        self.planner
            .update_token_price(chain, token, price_usd, decimals);
    }

    /// Feed a pool update straight into discovery.
    pub fn on_pool_update(&self, update: PoolUpdate) {
        self.detector.on_pool_update(update);
    }

    /// Replace the current mempool signal snapshot.
    pub fn set_mempool_signals(&self, signals: Vec<MempoolSignal>) {
        *self.mempool_signals.write() = signals;
    }

    pub fn set_pool_anomalies(&self, anomalies: Vec<PoolAnomaly>) {
        *self.pool_anomalies.write() = anomalies;
    }

    /// Main loop: drain the discovery buffer, one workflow per opportunity.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!("🚀 strategy engine running");
        let buffer = self.detector.buffer();
        loop {
            let opportunity = buffer.recv().await;
            let engine = self.clone();
            tokio::spawn(async move {
                engine.handle_opportunity(opportunity).await;
            });
        }
    }

    /// One opportunity, one workflow, end to end.
    pub async fn handle_opportunity(&self, opportunity: Opportunity) {
        let workflow_id = WorkflowId::new(format!(
            "wf-{}",
            &opportunity.fingerprint.to_hex()[..16]
        ));

        let started = self
            .coordinator
            .start_workflow(
                &workflow_id,
                serde_json::json!({
                    "kind": format!("{:?}", opportunity.kind),
                    "chain": opportunity.chain.0,
                    "fingerprint": opportunity.fingerprint.to_hex(),
                }),
            )
            .await;
        if let Err(e) = started {
            // Single-flight: a sibling replica already owns this fingerprint.
            debug!(workflow = %workflow_id, error = %e, "skipping opportunity");
            return;
        }
        if let Err(e) = self.coordinator.record_opportunity(&opportunity).await {
            warn!(error = %e, "failed to cache opportunity");
        }

        match self.drive(&workflow_id, &opportunity).await {
            Ok(summary) => {
                info!(workflow = %workflow_id, summary, "workflow completed");
                if let Err(e) = self
                    .coordinator
                    .complete_workflow(&workflow_id, Some(summary))
                    .await
                {
                    warn!(workflow = %workflow_id, error = %e, "completion write failed");
                }
            }
            Err(e) => {
                warn!(workflow = %workflow_id, error = %e, "workflow errored");
                if let Err(persist) = self
                    .coordinator
                    .fail_workflow(&workflow_id, e.to_string())
                    .await
                {
                    warn!(workflow = %workflow_id, error = %persist, "error write failed");
                }
            }
        }
    }

    async fn drive(&self, workflow_id: &WorkflowId, opportunity: &Opportunity) -> Result<String> {
        use types::{AgentKind, AgentState};

        self.coordinator
            .set_agent_state(workflow_id, AgentKind::Detector, AgentState::Active)
            .await
            .ok();
        self.coordinator.activate_workflow(workflow_id).await?;

        // Plan under the bounded planner pool.
        let route = {
            let _permit = self.planner_permits.acquire().await?;
            self.coordinator
                .set_agent_state(workflow_id, AgentKind::Router, AgentState::Active)
                .await
                .ok();
            match self.planner.plan(opportunity) {
                Ok(route) => route,
                Err(e) => return Ok(format!("no route: {}", e.kind().as_str())),
            }
        };
        self.check_not_stopped(workflow_id).await?;

        // Threat analysis and strategy selection.
        let executor = self.executor_for(opportunity.chain)?;
        let (submission, expected_profit) = {
            let _permit = self.analyzer_permits.acquire().await?;
            self.coordinator
                .set_agent_state(workflow_id, AgentKind::Guardian, AgentState::Active)
                .await
                .ok();

            let fees = executor.current_fees().await?;
            let current_block = executor.current_block().await?;
            let value_usd = self.route_value_usd(&route).unwrap_or(Decimal::ZERO);
            let analysis = {
                let signals = self.mempool_signals.read();
                let anomalies = self.pool_anomalies.read();
                self.analyzer.analyze(
                    &route,
                    value_usd,
                    fees.gas_price_wei,
                    &signals,
                    &anomalies,
                )
            };

            let draft = self.route_draft(&route);
            match self.controller.choose(
                &analysis,
                draft,
                fees.gas_price_wei,
                self.config.executor.gas_limit,
                current_block,
                self.clock.now_ns(),
                self.config.router.base_deadline_minutes,
            ) {
                Ok(submission) => (submission, opportunity.expected_profit_usd),
                Err(e) => return Ok(format!("protection abort: {}", e.kind().as_str())),
            }
        };
        self.check_not_stopped(workflow_id).await?;

        let flash = self.flash_plan(opportunity, &route)?;
        self.coordinator
            .set_agent_state(workflow_id, AgentKind::Executor, AgentState::Active)
            .await
            .ok();

        // First attempt on the chain lane.
        let execution = self
            .submit_on_lane(
                opportunity.chain,
                workflow_id.clone(),
                route.clone(),
                submission.clone(),
                expected_profit,
                flash.clone(),
            )
            .await?;

        if execution.status == ExecutionStatus::Confirmed {
            return Ok(format!(
                "confirmed in block {} profit ${}",
                execution.block_number.unwrap_or_default(),
                execution.actual_profit_usd.unwrap_or_default().round_dp(2)
            ));
        }

        // Non-MEV failure: one alternative-route retry at amount × 1.10.
        let policy = executor::FallbackPolicy::new(
            self.config.mev.emergency_stop,
            self.config.executor.max_retries,
        );
        let action = policy.decide(
            executor::FallbackTrigger::ExecutionFailure,
            self.controller.level(),
            0,
            &route,
        );
        let executor::FallbackAction::UseAlternativeRoute {
            exclude,
            amount_scale_bps,
        } = action
        else {
            return Ok(format!("terminal: {}", execution.status.as_str()));
        };

        self.check_not_stopped(workflow_id).await?;
        let retry_amount = ExecutionEngine::scaled_retry_amount(route.amount_in, amount_scale_bps);
        let alternative = match self
            .planner
            .plan_excluding(opportunity, &exclude, retry_amount)
        {
            Ok(route) => route,
            Err(RouterError::Expired) => {
                return Ok(format!("terminal: {}", execution.status.as_str()))
            }
            Err(e) => return Ok(format!("no alternative route: {}", e.kind().as_str())),
        };

        let mut retry_submission = submission;
        retry_submission.tx = self.route_draft(&alternative);
        let retried = self
            .submit_on_lane(
                opportunity.chain,
                workflow_id.clone(),
                alternative,
                retry_submission,
                expected_profit,
                flash,
            )
            .await?;

        Ok(match retried.status {
            ExecutionStatus::Confirmed => format!(
                "confirmed on alternative route in block {} profit ${}",
                retried.block_number.unwrap_or_default(),
                retried.actual_profit_usd.unwrap_or_default().round_dp(2)
            ),
            other => format!("terminal after retry: {}", other.as_str()),
        })
    }

    /// Queue work on the per-chain FIFO lane (concurrency 1 per chain keeps
    /// submission order aligned with nonce order).
    async fn submit_on_lane(
        &self,
        chain: ChainId,
        workflow_id: WorkflowId,
        route: Route,
        submission: Submission,
        expected_profit_usd: Decimal,
        flash: Option<FlashLoanPlan>,
    ) -> Result<Execution> {
        let sender = self.lane_for(chain)?;
        let (reply, receiver) = oneshot::channel();
        sender
            .send(ExecutionJob {
                workflow_id,
                route,
                submission,
                expected_profit_usd,
                flash,
                reply,
            })
            .await
            .map_err(|_| anyhow!("chain lane for {chain} is closed"))?;
        receiver
            .await
            .map_err(|_| anyhow!("chain lane dropped the job"))?
            .map_err(|e| anyhow!("execution failed: {e}"))
    }

    fn lane_for(&self, chain: ChainId) -> Result<mpsc::Sender<ExecutionJob>> {
        if let Some(sender) = self.chain_lanes.get(&chain) {
            return Ok(sender.clone());
        }
        let executor = self.executor_for(chain)?;
        let (sender, mut receiver) = mpsc::channel::<ExecutionJob>(64);
        tokio::spawn(async move {
            // Single consumer: jobs run strictly in arrival order.
            while let Some(job) = receiver.recv().await {
                let result = executor
                    .execute(
                        &job.workflow_id,
                        &job.route,
                        job.submission,
                        job.expected_profit_usd,
                        job.flash,
                    )
                    .await;
                let _ = job.reply.send(result);
            }
        });
        self.chain_lanes.insert(chain, sender.clone());
        Ok(sender)
    }

    fn executor_for(&self, chain: ChainId) -> Result<Arc<ExecutionEngine>> {
        self.executors
            .get(&chain)
            .cloned()
            .ok_or_else(|| anyhow!("no executor configured for chain {chain}"))
    }

    /// Stop check at suspension points; observing Stopped aborts with the
    /// cooperative reason.
    async fn check_not_stopped(&self, workflow_id: &WorkflowId) -> Result<()> {
        if let Ok(Some(state)) = self.coordinator.get_workflow_state(workflow_id).await {
            if state.status == WorkflowStatus::Stopped {
                for executor in self.executors.values() {
                    executor.mark_stopped(workflow_id);
                }
                return Err(anyhow!("STOPPED"));
            }
        }
        Ok(())
    }

    /// Encode the route for the arbitrage executor contract:
    /// `executeRoute((address,address,address,uint256,uint256)[],uint256)`.
    fn route_draft(&self, route: &Route) -> TxDraft {
        use ethers::abi::{encode, Token};
        use ethers::types::{H160, U256};

        let legs: Vec<Token> = route
            .legs
            .iter()
            .map(|leg| {
                Token::Tuple(vec![
                    Token::Address(H160::from(leg.pool.address)),
                    Token::Address(H160::from(leg.token_in)),
                    Token::Address(H160::from(leg.token_out)),
                    Token::Uint(U256::from(leg.amount_in)),
                    Token::Uint(U256::from(leg.min_amount_out)),
                ])
            })
            .collect();

        let mut data =
            selector("executeRoute((address,address,address,uint256,uint256)[],uint256)").to_vec();
        data.extend(encode(&[
            Token::Array(legs),
            Token::Uint(U256::from(route.deadline_ns / 1_000_000_000)),
        ]));

        TxDraft {
            chain: route.chain,
            to: self.arb_contract,
            data,
            value: 0,
        }
    }

    /// Size the flash loan for flash-funded kinds: borrow the route input,
    /// price the fee in USD via the entry token.
    fn flash_plan(
        &self,
        opportunity: &Opportunity,
        route: &Route,
    ) -> Result<Option<FlashLoanPlan>> {
        if !opportunity.kind.is_flash_loan() {
            return Ok(None);
        }
        let provider_config = self
            .config
            .executor
            .flash_loan_providers
            .first()
            .ok_or_else(|| anyhow!("flash-funded opportunity but no providers configured"))?;
        let provider = parse_address(&provider_config.address)?;

        let entry = opportunity
            .token_path
            .first()
            .ok_or_else(|| anyhow!("opportunity has no token path"))?;
        let (price, decimals) = self
            .prices
            .get(&(opportunity.chain, entry.address))
            .map(|entry| *entry.value())
            .unwrap_or((Decimal::ONE, entry.decimals));

        let fee_units = executor::flash_loan::loan_fee(route.amount_in, provider_config.fee_bps);
        let unit = Decimal::from(10u128.pow(decimals.min(28) as u32));
        let loan_fee_usd = Decimal::from_u128(fee_units).unwrap_or_default() / unit * price;
        let gas_cost_usd = self.gas_cost_usd(opportunity.chain, route.gas_estimate);

        Ok(Some(FlashLoanPlan {
            provider,
            asset: entry.address,
            amount: route.amount_in,
            loan_fee_usd,
            gas_cost_usd,
        }))
    }

    fn route_value_usd(&self, route: &Route) -> Option<Decimal> {
        let entry = route.entry_token()?;
        let (price, decimals) = self.prices.get(&(route.chain, *entry)).map(|e| *e.value())?;
        let unit = Decimal::from(10u128.pow(decimals.min(28) as u32));
        Some(Decimal::from_u128(route.amount_in)? / unit * price)
    }

    fn gas_cost_usd(&self, chain: ChainId, gas_units: u64) -> Decimal {
        let native = self
            .config
            .chains
            .iter()
            .find(|c| c.chain_id == chain.0)
            .map(|c| c.native_token_price_usd)
            .unwrap_or(dec!(1));
        Decimal::from(gas_units)
            * Decimal::from(self.config.router.gas_price_gwei)
            * dec!(0.000000001)
            * native
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }
}

fn parse_address(hex_address: &str) -> Result<EvmAddress> {
    let stripped = hex_address.trim_start_matches("0x");
    let bytes = hex::decode(stripped).context("address is not hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("address must be 20 bytes"))
}
