use anyhow::{Context, Result};
use arbitrage_strategy::{logging, StrategyEngine};
use arbx_amm::AdapterRegistry;
use arbx_gateway::Gateway;
use clap::Parser;
use config::CoreConfig;
use coordinator::{MemoryKv, Metrics, WebhookProcessor, WorkflowCoordinator};
use discovery::OpportunityDetector;
use executor::{EthersRpc, Executor, FlashLoanRegistry, LocalSigner};
use market_state::{PoolRegistry, TokenRegistry};
use mev::{HttpBundleRelay, ProtectionController, ThreatAnalyzer};
use router::Planner;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use types::{ChainId, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "arbitragex", about = "Cross-venue arbitrage core")]
struct Args {
    /// Path to a TOML configuration file; defaults plus env otherwise.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => CoreConfig::from_file(path).context("loading configuration file")?,
        None => CoreConfig::from_env(),
    };
    config.validate().context("validating configuration")?;
    info!("🚀 starting ArbitrageX core");

    let clock = Arc::new(SystemClock);
    let metrics = Arc::new(Metrics::new().context("registering metrics")?);

    // Coordination substrate. The in-memory KV serves single-node deploys;
    // edge deployments swap in a durable KvStore implementation here.
    let kv = Arc::new(MemoryKv::new(clock.clone()));
    let backend = Arc::new(
        coordinator::BackendClient::new(config.backend.clone())?.with_metrics(metrics.clone()),
    );
    let coordinator = Arc::new(
        WorkflowCoordinator::new(kv.clone(), clock.clone(), config.coordinator.clone())
            .with_metrics(metrics.clone())
            .with_backend(backend),
    );

    // Liveness heartbeat under `system:health`.
    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                let active = coordinator
                    .list_active_workflows()
                    .await
                    .map(|ids| ids.len())
                    .unwrap_or(0);
                let health = serde_json::json!({ "status": "ok", "active_workflows": active });
                if let Err(e) = coordinator.record_health(health).await {
                    tracing::warn!(error = %e, "health heartbeat failed");
                }
            }
        });
    }
    let webhooks = Arc::new(
        WebhookProcessor::new(coordinator.clone(), kv.clone()).with_metrics(metrics.clone()),
    );

    // Market state and discovery.
    let pools = Arc::new(PoolRegistry::new());
    let tokens = Arc::new(TokenRegistry::new());
    let adapters = Arc::new(AdapterRegistry::standard());
    let detector = Arc::new(
        OpportunityDetector::new(
            pools.clone(),
            tokens.clone(),
            adapters.clone(),
            clock.clone(),
            config.discovery.clone(),
        )
        .with_metrics(metrics.clone()),
    );

    // Planning and protection.
    let planner = Arc::new(
        Planner::new(
            pools.clone(),
            adapters.clone(),
            clock.clone(),
            config.router.clone(),
        )
        .with_metrics(metrics.clone()),
    );
    let analyzer = Arc::new(ThreatAnalyzer::new(config.mev.clone()));
    let controller = Arc::new(
        ProtectionController::new(config.mev.clone())
            .map_err(|e| anyhow::anyhow!("{e}"))?
            .with_metrics(metrics.clone()),
    );

    // One execution engine per configured chain, each owning its nonces.
    let mut executors: HashMap<ChainId, Arc<Executor>> = HashMap::new();
    for chain_config in &config.chains {
        let chain = ChainId(chain_config.chain_id);
        let rpc = Arc::new(
            EthersRpc::new(
                &chain_config.rpc_url,
                &chain_config.backup_rpc_urls,
                Duration::from_secs(30),
            )
            .map_err(|e| anyhow::anyhow!("{e}"))?,
        );
        let signer = Arc::new(
            LocalSigner::new(&config.executor.signer_private_key, chain_config.chain_id)
                .map_err(|e| anyhow::anyhow!("{e}"))?,
        );
        let relay = Arc::new(
            HttpBundleRelay::new(chain_config.relay_url.clone(), Duration::from_secs(10))
                .map_err(|e| anyhow::anyhow!("{e}"))?,
        );
        let flash = FlashLoanRegistry::from_config(&config.executor.flash_loan_providers)
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        let executor = Arc::new(
            Executor::new(
                rpc,
                signer,
                relay,
                flash,
                clock.clone(),
                config.executor.clone(),
            )
            .with_coordinator(coordinator.clone())
            .with_metrics(metrics.clone()),
        );
        executor.set_native_price(chain, chain_config.native_token_price_usd);
        planner.set_native_price(chain, chain_config.native_token_price_usd);
        executors.insert(chain, executor);
        info!(chain = chain_config.chain_id, "chain executor initialized");
    }

    let strategy = Arc::new(StrategyEngine::new(
        config.clone(),
        detector,
        planner,
        analyzer,
        controller,
        executors,
        coordinator.clone(),
        clock,
        metrics.clone(),
    )?);

    // Exposed HTTP surface: metrics, workflow control, webhooks.
    let gateway = Arc::new(Gateway::new(
        coordinator,
        webhooks,
        metrics,
        config.gateway.clone(),
    ));
    tokio::spawn(async move {
        if let Err(e) = gateway.serve().await {
            tracing::error!(error = %e, "gateway server exited");
        }
    });

    info!("✅ all components initialized, entering strategy loop");
    strategy.run().await
}
