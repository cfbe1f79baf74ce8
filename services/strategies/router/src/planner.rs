//! Beam-search route planning with exact adapter math.

use arbx_amm::{solve_exact_output, AdapterRegistry, AmmError};
use config::RouterConfig;
use coordinator::Metrics;
use dashmap::DashMap;
use market_state::PoolRegistry;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, trace};
use types::opportunity::compute_fingerprint;
use types::{
    ChainId, Clock, ErrorKind, EvmAddress, Opportunity, OpportunityId, OpportunityKind, PoolId,
    PoolSnapshot, Route, RouteLeg,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("insufficient liquidity along every candidate sequence")]
    InsufficientLiquidity,

    #[error("price impact {impact_bps} bps exceeds cap {cap_bps} bps")]
    PriceImpactTooHigh { impact_bps: u32, cap_bps: u32 },

    #[error("no candidate sequence clears gas and profit floors")]
    NoProfitableRoute,

    #[error("pool snapshot for {pool} is stale")]
    StalePool { pool: PoolId },

    #[error("opportunity expired before planning")]
    Expired,

    #[error("no USD price for the entry token")]
    PriceUnavailable,
}

impl RouterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::InsufficientLiquidity => ErrorKind::InsufficientLiquidity,
            RouterError::PriceImpactTooHigh { .. } => ErrorKind::PriceImpactTooHigh,
            RouterError::NoProfitableRoute => ErrorKind::NoProfitableRoute,
            RouterError::StalePool { .. } => ErrorKind::Stale,
            RouterError::Expired => ErrorKind::ExpiredDeadline,
            RouterError::PriceUnavailable => ErrorKind::Validation,
        }
    }
}

/// Partial route under beam expansion.
#[derive(Clone)]
struct BeamState {
    legs: Vec<RouteLeg>,
    amount: u128,
    impact_bps: u32,
    gas: u64,
    used: HashSet<PoolId>,
}

pub struct Planner {
    pools: Arc<PoolRegistry>,
    adapters: Arc<AdapterRegistry>,
    clock: Arc<dyn Clock>,
    config: RouterConfig,
    /// USD price per whole token, fed by the market-data stream.
    token_prices: DashMap<(ChainId, EvmAddress), Decimal>,
    /// USD price of each chain's native gas token.
    native_prices: DashMap<ChainId, Decimal>,
    /// Token decimals, for unit conversion in profit math.
    token_decimals: DashMap<(ChainId, EvmAddress), u8>,
    metrics: Option<Arc<Metrics>>,
}

impl Planner {
    pub fn new(
        pools: Arc<PoolRegistry>,
        adapters: Arc<AdapterRegistry>,
        clock: Arc<dyn Clock>,
        config: RouterConfig,
    ) -> Self {
        Self {
            pools,
            adapters,
            clock,
            config,
            token_prices: DashMap::new(),
            native_prices: DashMap::new(),
            token_decimals: DashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn update_token_price(
        &self,
        chain: ChainId,
        token: EvmAddress,
        price_usd: Decimal,
        decimals: u8,
    ) {
        self.token_prices.insert((chain, token), price_usd);
        self.token_decimals.insert((chain, token), decimals);
    }

    pub fn set_native_price(&self, chain: ChainId, price_usd: Decimal) {
        self.native_prices.insert(chain, price_usd);
    }

    /// Concretize a candidate opportunity into an executable route.
    pub fn plan(&self, opportunity: &Opportunity) -> Result<Route, RouterError> {
        self.plan_excluding(opportunity, &[], opportunity.amount_in)
    }

    /// Re-plan with a pool blacklist and an input override; the fallback path
    /// uses this to route around a burned pool set.
    pub fn plan_excluding(
        &self,
        opportunity: &Opportunity,
        exclude: &[PoolId],
        amount_in: u128,
    ) -> Result<Route, RouterError> {
        let started = Instant::now();
        let now_ns = self.clock.now_ns();
        if opportunity.is_expired(now_ns) {
            return Err(RouterError::Expired);
        }

        let token_path: Vec<EvmAddress> =
            opportunity.token_path.iter().map(|t| t.address).collect();
        let result = self.search(
            opportunity.chain,
            &token_path,
            amount_in,
            exclude,
            Some(opportunity),
        );

        if let Some(metrics) = &self.metrics {
            metrics
                .plan_duration_seconds
                .observe(started.elapsed().as_secs_f64());
        }
        result
    }

    /// Solve for the input that yields `amount_out` of `token_out`, walking
    /// up to `max_hops` pools. Used to size flash loans.
    pub fn plan_exact_output(
        &self,
        opportunity_id: OpportunityId,
        chain: ChainId,
        token_in: EvmAddress,
        token_out: EvmAddress,
        amount_out: u128,
        max_hops: usize,
        max_amount_in: u128,
    ) -> Result<Route, RouterError> {
        let started = Instant::now();
        let max_hops = max_hops.clamp(1, 3).min(self.config.max_hops.max(1));
        let now_ns = self.clock.now_ns();

        let sequences = self.enumerate_paths(chain, &token_in, &token_out, max_hops, now_ns);
        if sequences.is_empty() {
            return Err(RouterError::InsufficientLiquidity);
        }

        let mut best: Option<Route> = None;
        for sequence in sequences {
            match self.solve_sequence(
                opportunity_id,
                chain,
                &token_in,
                &sequence,
                amount_out,
                max_amount_in,
                now_ns,
            ) {
                Ok(route) => {
                    let better = best
                        .as_ref()
                        .map_or(true, |held| route.amount_in < held.amount_in);
                    if better {
                        best = Some(route);
                    }
                }
                Err(e) => {
                    trace!(error = %e, "exact-output sequence failed");
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .plan_duration_seconds
                .observe(started.elapsed().as_secs_f64());
        }
        best.ok_or(RouterError::InsufficientLiquidity)
    }

    /// Re-simulate a route leg-by-leg and return the terminal output.
    pub fn simulate(&self, route: &Route) -> Result<u128, RouterError> {
        let mut amount = route.amount_in;
        for leg in &route.legs {
            let snapshot = self
                .pools
                .get(leg.pool.pool)
                .map_err(|_| RouterError::StalePool { pool: leg.pool.pool })?;
            let adapter = self
                .adapters
                .for_pool(&snapshot)
                .map_err(|_| RouterError::InsufficientLiquidity)?;
            let quote = adapter
                .quote_exact_in(&snapshot, &leg.token_in, amount)
                .map_err(|_| RouterError::InsufficientLiquidity)?;
            amount = quote.amount_out;
        }
        Ok(amount)
    }

    /// Beam search over candidate pools along a fixed token path.
    fn search(
        &self,
        chain: ChainId,
        token_path: &[EvmAddress],
        amount_in: u128,
        exclude: &[PoolId],
        opportunity: Option<&Opportunity>,
    ) -> Result<Route, RouterError> {
        let now_ns = self.clock.now_ns();
        let staleness_ttl_ns = 30u64.saturating_mul(1_000_000_000);
        let excluded: HashSet<PoolId> = exclude.iter().copied().collect();

        let mut beam = vec![BeamState {
            legs: Vec::new(),
            amount: amount_in,
            impact_bps: 0,
            gas: 0,
            used: HashSet::new(),
        }];
        let mut saw_liquidity_failure = false;

        for hop in token_path.windows(2) {
            let (from, to) = (&hop[0], &hop[1]);
            let candidates: Vec<Arc<PoolSnapshot>> = self
                .pools
                .fresh_pools_for_pair(from, to, now_ns, staleness_ttl_ns)
                .into_iter()
                .filter(|p| p.chain == chain)
                .filter(|p| !excluded.contains(&p.id))
                .filter(|p| p.tvl_usd >= self.config.min_liquidity_usd)
                .collect();
            if candidates.is_empty() {
                return Err(RouterError::InsufficientLiquidity);
            }

            let mut next_beam: Vec<BeamState> = Vec::new();
            for state in &beam {
                for pool in &candidates {
                    if state.used.contains(&pool.id) {
                        continue;
                    }
                    let Ok(adapter) = self.adapters.for_pool(pool) else {
                        continue;
                    };
                    let quote = match adapter.quote_exact_in(pool, from, state.amount) {
                        Ok(quote) => quote,
                        Err(AmmError::InsufficientLiquidity { .. })
                        | Err(AmmError::ZeroLiquidity) => {
                            saw_liquidity_failure = true;
                            continue;
                        }
                        Err(e) => {
                            // Adapter failure kills this sequence only.
                            debug!(pool = %pool.id, error = %e, "sequence dropped");
                            continue;
                        }
                    };

                    let mut next = state.clone();
                    next.legs.push(RouteLeg {
                        pool: types::PoolRef {
                            pool: pool.id,
                            dex: pool.dex,
                            address: pool.address,
                        },
                        token_in: *from,
                        token_out: *to,
                        amount_in: state.amount,
                        expected_amount_out: quote.amount_out,
                        min_amount_out: Route::min_out(
                            quote.amount_out,
                            self.config.max_slippage_bps,
                        ),
                        fee_bps: quote.fee_bps,
                        gas_estimate: quote.gas_estimate,
                    });
                    next.amount = quote.amount_out;
                    next.impact_bps = next.impact_bps.saturating_add(quote.price_impact_bps);
                    next.gas = next.gas.saturating_add(quote.gas_estimate);
                    next.used.insert(pool.id);
                    next_beam.push(next);
                }
            }

            // Keep the top `beam_width` states by running amount.
            next_beam.sort_by(|a, b| b.amount.cmp(&a.amount));
            next_beam.truncate(self.config.beam_width);
            if next_beam.is_empty() {
                return Err(if saw_liquidity_failure {
                    RouterError::InsufficientLiquidity
                } else {
                    RouterError::NoProfitableRoute
                });
            }
            beam = next_beam;
        }

        self.pick_winner(beam, chain, token_path, amount_in, opportunity, now_ns)
    }

    fn pick_winner(
        &self,
        beam: Vec<BeamState>,
        chain: ChainId,
        token_path: &[EvmAddress],
        amount_in: u128,
        opportunity: Option<&Opportunity>,
        now_ns: u64,
    ) -> Result<Route, RouterError> {
        let mut impact_reject: Option<RouterError> = None;
        let mut best: Option<(BeamState, Decimal)> = None;

        for state in beam {
            if state.impact_bps > self.config.max_price_impact_bps {
                impact_reject = Some(RouterError::PriceImpactTooHigh {
                    impact_bps: state.impact_bps,
                    cap_bps: self.config.max_price_impact_bps,
                });
                continue;
            }

            // Cycle profit floor in token terms.
            let required_out = amount_in.saturating_mul(10_000 + self.config.min_profit_bps as u128)
                / 10_000;
            let min_out_end = Route::min_out(state.amount, self.config.max_slippage_bps);
            if min_out_end < required_out {
                continue;
            }

            // Net USD profit must clear gas plus the safety margin.
            let entry = token_path[0];
            let profit_usd = self
                .profit_usd(chain, &entry, amount_in, state.amount)
                .ok_or(RouterError::PriceUnavailable)?;
            let gas_cost = self.gas_cost_usd(chain, state.gas);
            let net = profit_usd - gas_cost - self.config.safety_margin_usd;
            if net <= Decimal::ZERO {
                continue;
            }

            let better = match &best {
                None => true,
                Some((held, held_net)) => {
                    net > *held_net
                        || (net == *held_net && state.gas < held.gas)
                        || (net == *held_net
                            && state.gas == held.gas
                            && state.impact_bps < held.impact_bps)
                }
            };
            if better {
                best = Some((state, net));
            }
        }

        let Some((winner, _net)) = best else {
            return Err(impact_reject.unwrap_or(RouterError::NoProfitableRoute));
        };

        // The fingerprint derives from the pools actually chosen, not the
        // candidate's: an alternative route around a burned pool set must be
        // a distinct execution for the idempotence key.
        let legs: Vec<types::PoolRef> = winner.legs.iter().map(|l| l.pool).collect();
        let kind = opportunity.map(|o| o.kind).unwrap_or(if legs.len() <= 2 {
            OpportunityKind::TwoLeg
        } else {
            OpportunityKind::Triangular
        });
        let fingerprint = fingerprint_for_path(kind, chain, &legs, token_path, amount_in);

        Ok(Route {
            opportunity_id: opportunity.map(|o| o.id).unwrap_or_default(),
            chain,
            amount_in,
            expected_amount_out: winner.amount,
            min_amount_out_end: Route::min_out(winner.amount, self.config.max_slippage_bps),
            price_impact_bps: winner.impact_bps,
            slippage_bps: self.config.max_slippage_bps,
            max_amount_in: amount_in,
            gas_estimate: winner.gas.saturating_add(21_000),
            deadline_ns: now_ns
                + self
                    .config
                    .base_deadline_minutes
                    .saturating_mul(60_000_000_000),
            legs: winner.legs,
            fingerprint,
        })
    }

    /// Pool sequences from `token_in` to `token_out` within `max_hops`.
    fn enumerate_paths(
        &self,
        chain: ChainId,
        token_in: &EvmAddress,
        token_out: &EvmAddress,
        max_hops: usize,
        now_ns: u64,
    ) -> Vec<Vec<Arc<PoolSnapshot>>> {
        let staleness_ttl_ns = 30u64.saturating_mul(1_000_000_000);
        let mut sequences = Vec::new();

        // Direct hop.
        for pool in self
            .pools
            .fresh_pools_for_pair(token_in, token_out, now_ns, staleness_ttl_ns)
        {
            if pool.chain == chain && pool.tvl_usd >= self.config.min_liquidity_usd {
                sequences.push(vec![pool]);
            }
        }
        if max_hops < 2 {
            return sequences;
        }

        // Two hops through an intermediate token.
        for first in self.pools.pools_for_token(token_in) {
            if first.chain != chain
                || first.is_stale(now_ns, staleness_ttl_ns)
                || first.tvl_usd < self.config.min_liquidity_usd
            {
                continue;
            }
            let Some(mid) = first.other_token(token_in) else {
                continue;
            };
            if mid == *token_out {
                continue; // already covered as a direct hop
            }
            for second in self
                .pools
                .fresh_pools_for_pair(&mid, token_out, now_ns, staleness_ttl_ns)
            {
                if second.chain == chain
                    && second.id != first.id
                    && second.tvl_usd >= self.config.min_liquidity_usd
                {
                    sequences.push(vec![first.clone(), second]);
                }
            }
        }
        sequences
    }

    #[allow(clippy::too_many_arguments)]
    fn solve_sequence(
        &self,
        opportunity_id: OpportunityId,
        chain: ChainId,
        token_in: &EvmAddress,
        sequence: &[Arc<PoolSnapshot>],
        amount_out: u128,
        max_amount_in: u128,
        now_ns: u64,
    ) -> Result<Route, RouterError> {
        let quote_chain = |amount: u128| -> Result<u128, AmmError> {
            let mut current_token = *token_in;
            let mut current_amount = amount;
            for pool in sequence {
                let adapter = self.adapters.for_pool(pool)?;
                let quote = adapter.quote_exact_in(pool, &current_token, current_amount)?;
                current_amount = quote.amount_out;
                current_token = pool
                    .other_token(&current_token)
                    .ok_or(AmmError::TokenNotInPool)?;
            }
            Ok(current_amount)
        };

        let solution = solve_exact_output(
            amount_out,
            max_amount_in,
            self.config.epsilon_out,
            quote_chain,
        )
        .map_err(|e| match e {
            AmmError::InsufficientLiquidity { .. } | AmmError::ZeroLiquidity => {
                RouterError::InsufficientLiquidity
            }
            _ => RouterError::NoProfitableRoute,
        })?;

        // Forward pass to materialize legs at the solved input.
        let mut legs = Vec::with_capacity(sequence.len());
        let mut current_token = *token_in;
        let mut amount = solution.amount_in;
        let mut impact_bps = 0u32;
        let mut gas = 0u64;
        let mut path = vec![*token_in];

        for pool in sequence {
            let adapter = self
                .adapters
                .for_pool(pool)
                .map_err(|_| RouterError::InsufficientLiquidity)?;
            let quote = adapter
                .quote_exact_in(pool, &current_token, amount)
                .map_err(|_| RouterError::InsufficientLiquidity)?;
            let next_token = pool
                .other_token(&current_token)
                .ok_or(RouterError::InsufficientLiquidity)?;

            legs.push(RouteLeg {
                pool: types::PoolRef {
                    pool: pool.id,
                    dex: pool.dex,
                    address: pool.address,
                },
                token_in: current_token,
                token_out: next_token,
                amount_in: amount,
                expected_amount_out: quote.amount_out,
                min_amount_out: Route::min_out(quote.amount_out, self.config.max_slippage_bps),
                fee_bps: quote.fee_bps,
                gas_estimate: quote.gas_estimate,
            });
            impact_bps = impact_bps.saturating_add(quote.price_impact_bps);
            gas = gas.saturating_add(quote.gas_estimate);
            amount = quote.amount_out;
            current_token = next_token;
            path.push(next_token);
        }

        if impact_bps > self.config.max_price_impact_bps {
            return Err(RouterError::PriceImpactTooHigh {
                impact_bps,
                cap_bps: self.config.max_price_impact_bps,
            });
        }

        let pool_refs: Vec<types::PoolRef> = legs.iter().map(|l| l.pool).collect();
        Ok(Route {
            opportunity_id,
            chain,
            amount_in: solution.amount_in,
            expected_amount_out: amount,
            min_amount_out_end: Route::min_out(amount, self.config.max_slippage_bps),
            price_impact_bps: impact_bps,
            slippage_bps: self.config.max_slippage_bps,
            max_amount_in,
            gas_estimate: gas.saturating_add(21_000),
            deadline_ns: now_ns
                + self
                    .config
                    .base_deadline_minutes
                    .saturating_mul(60_000_000_000),
            legs,
            fingerprint: fingerprint_for_path(
                if pool_refs.len() <= 2 {
                    OpportunityKind::TwoLeg
                } else {
                    OpportunityKind::Triangular
                },
                chain,
                &pool_refs,
                &path,
                solution.amount_in,
            ),
        })
    }

    fn profit_usd(
        &self,
        chain: ChainId,
        entry: &EvmAddress,
        amount_in: u128,
        amount_out: u128,
    ) -> Option<Decimal> {
        let price = *self.token_prices.get(&(chain, *entry))?.value();
        let decimals = *self.token_decimals.get(&(chain, *entry))?.value();
        let unit = Decimal::from(10u128.pow(decimals.min(28) as u32));
        let delta = if amount_out >= amount_in {
            Decimal::from_u128(amount_out - amount_in)?
        } else {
            -Decimal::from_u128(amount_in - amount_out)?
        };
        Some(delta / unit * price)
    }

    fn gas_cost_usd(&self, chain: ChainId, gas_units: u64) -> Decimal {
        let native = self
            .native_prices
            .get(&chain)
            .map(|entry| *entry.value())
            .unwrap_or(dec!(1));
        Decimal::from(gas_units)
            * Decimal::from(self.config.gas_price_gwei)
            * dec!(0.000000001)
            * native
    }
}

/// Fingerprint over the concrete pools and token path of a planned route.
fn fingerprint_for_path(
    kind: OpportunityKind,
    chain: ChainId,
    legs: &[types::PoolRef],
    token_path: &[EvmAddress],
    amount_in: u128,
) -> types::Fingerprint {
    // Only addresses matter for hashing; symbols and decimals do not.
    let tokens: Vec<types::Token> = token_path
        .iter()
        .map(|address| types::Token {
            chain,
            address: *address,
            symbol: String::new(),
            decimals: 18,
        })
        .collect();
    compute_fingerprint(kind, chain, legs, &tokens, amount_in)
}
