//! Pool adapter SPI and the per-protocol implementations.
//!
//! One adapter per DEX protocol variant. The contract: every method is
//! deterministic for a fixed `(pool snapshot, params)` pair, so the planner
//! can re-simulate a route and land on identical numbers.

use crate::v2_math;
use crate::v3_math::{self, V3State};
use crate::AmmError;
use ethers::abi::{self, Token as AbiToken};
use ethers::types::{H160, U256};
use once_cell::sync::Lazy;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use std::sync::Arc;
use types::{ChainId, DexProtocol, EvmAddress, PoolLiquidity, PoolSnapshot};

/// One quoted hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub amount_in: u128,
    pub amount_out: u128,
    pub price_impact_bps: u32,
    pub fee_bps: u32,
    pub gas_estimate: u64,
}

/// Parameters for on-chain swap calldata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapParams {
    pub token_in: EvmAddress,
    pub token_out: EvmAddress,
    pub amount_in: u128,
    pub min_amount_out: u128,
    pub recipient: EvmAddress,
    pub deadline_secs: u64,
}

/// Decoded pool log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    SyncV2 {
        reserve0: u128,
        reserve1: u128,
    },
    SwapV2 {
        amount0_in: u128,
        amount1_in: u128,
        amount0_out: u128,
        amount1_out: u128,
    },
    SwapV3 {
        sqrt_price_x96: u128,
        liquidity: u128,
        tick: i32,
    },
}

/// Flat capability set every DEX integration provides. No inheritance, no
/// base behavior: a protocol either implements the whole surface or is not
/// routable.
pub trait PoolAdapter: Send + Sync {
    fn protocol(&self) -> DexProtocol;

    fn quote_exact_in(
        &self,
        pool: &PoolSnapshot,
        token_in: &EvmAddress,
        amount_in: u128,
    ) -> Result<Quote, AmmError>;

    fn quote_exact_out(
        &self,
        pool: &PoolSnapshot,
        token_out: &EvmAddress,
        amount_out: u128,
    ) -> Result<Quote, AmmError>;

    fn build_swap_calldata(
        &self,
        pool: &PoolSnapshot,
        params: &SwapParams,
    ) -> Result<Vec<u8>, AmmError>;

    fn decode_event(&self, topic0: &[u8; 32], data: &[u8]) -> Result<PoolEvent, AmmError>;
}

fn event_topic(signature: &str) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(signature.as_bytes());
    let digest = hasher.finalize();
    let mut topic = [0u8; 32];
    topic.copy_from_slice(&digest);
    topic
}

fn selector(signature: &str) -> [u8; 4] {
    let topic = event_topic(signature);
    [topic[0], topic[1], topic[2], topic[3]]
}

static SYNC_V2_TOPIC: Lazy<[u8; 32]> = Lazy::new(|| event_topic("Sync(uint112,uint112)"));
static SWAP_V2_TOPIC: Lazy<[u8; 32]> =
    Lazy::new(|| event_topic("Swap(address,uint256,uint256,uint256,uint256,address)"));
static SWAP_V3_TOPIC: Lazy<[u8; 32]> =
    Lazy::new(|| event_topic("Swap(address,address,int256,int256,uint160,uint128,int24)"));

/// Read the low 128 bits of the `index`-th 32-byte ABI word.
fn word_u128(data: &[u8], index: usize) -> Result<u128, AmmError> {
    let start = index * 32;
    let end = start + 32;
    if data.len() < end {
        return Err(AmmError::MalformedEvent {
            expected: end,
            got: data.len(),
        });
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&data[start + 16..end]);
    Ok(u128::from_be_bytes(bytes))
}

fn to_decimal(value: u128, context: &'static str) -> Result<Decimal, AmmError> {
    Decimal::from_u128(value).ok_or(AmmError::Overflow { context })
}

/// Constant-product pools: UniswapV2, SushiswapV2.
#[derive(Debug, Clone, Copy)]
pub struct V2SwapAdapter {
    protocol: DexProtocol,
}

impl V2SwapAdapter {
    /// Gas for approve + swap on a V2 pair.
    pub const SWAP_GAS: u64 = 120_000;

    pub fn new(protocol: DexProtocol) -> Self {
        debug_assert!(protocol.is_v2());
        Self { protocol }
    }

    /// Directional reserves for a swap selling `token_in`.
    fn sides(
        pool: &PoolSnapshot,
        token_in: &EvmAddress,
    ) -> Result<(Decimal, Decimal), AmmError> {
        let zero_for_one = pool
            .zero_for_one(token_in)
            .ok_or(AmmError::TokenNotInPool)?;
        let (reserve0, reserve1) = match pool.liquidity {
            PoolLiquidity::V2 { reserve0, reserve1 } => (reserve0, reserve1),
            PoolLiquidity::V3 { .. } => {
                return Err(AmmError::InvalidInput {
                    context: "V2 adapter received concentrated-liquidity pool".to_string(),
                })
            }
        };
        let r0 = to_decimal(reserve0, "v2 reserve0")?;
        let r1 = to_decimal(reserve1, "v2 reserve1")?;
        Ok(if zero_for_one { (r0, r1) } else { (r1, r0) })
    }
}

impl PoolAdapter for V2SwapAdapter {
    fn protocol(&self) -> DexProtocol {
        self.protocol
    }

    fn quote_exact_in(
        &self,
        pool: &PoolSnapshot,
        token_in: &EvmAddress,
        amount_in: u128,
    ) -> Result<Quote, AmmError> {
        let (reserve_in, reserve_out) = Self::sides(pool, token_in)?;
        let amount = to_decimal(amount_in, "v2 amount_in")?;

        let out = v2_math::out_given_in(amount, reserve_in, reserve_out, pool.fee_bps)?;
        let impact = v2_math::price_impact_bps(amount, reserve_in, reserve_out)?;

        Ok(Quote {
            amount_in,
            amount_out: out.to_u128().unwrap_or(0),
            price_impact_bps: impact,
            fee_bps: pool.fee_bps,
            gas_estimate: Self::SWAP_GAS,
        })
    }

    fn quote_exact_out(
        &self,
        pool: &PoolSnapshot,
        token_out: &EvmAddress,
        amount_out: u128,
    ) -> Result<Quote, AmmError> {
        let token_in = pool
            .other_token(token_out)
            .ok_or(AmmError::TokenNotInPool)?;
        let (reserve_in, reserve_out) = Self::sides(pool, &token_in)?;
        let wanted = to_decimal(amount_out, "v2 amount_out")?;

        let needed = v2_math::in_given_out(wanted, reserve_in, reserve_out, pool.fee_bps)?;
        let impact = v2_math::price_impact_bps(needed, reserve_in, reserve_out)?;

        Ok(Quote {
            amount_in: needed.to_u128().unwrap_or(u128::MAX),
            amount_out,
            price_impact_bps: impact,
            fee_bps: pool.fee_bps,
            gas_estimate: Self::SWAP_GAS,
        })
    }

    fn build_swap_calldata(
        &self,
        _pool: &PoolSnapshot,
        params: &SwapParams,
    ) -> Result<Vec<u8>, AmmError> {
        let mut calldata = selector(
            "swapExactTokensForTokens(uint256,uint256,address[],address,uint256)",
        )
        .to_vec();
        calldata.extend(abi::encode(&[
            AbiToken::Uint(U256::from(params.amount_in)),
            AbiToken::Uint(U256::from(params.min_amount_out)),
            AbiToken::Array(vec![
                AbiToken::Address(H160::from(params.token_in)),
                AbiToken::Address(H160::from(params.token_out)),
            ]),
            AbiToken::Address(H160::from(params.recipient)),
            AbiToken::Uint(U256::from(params.deadline_secs)),
        ]));
        Ok(calldata)
    }

    fn decode_event(&self, topic0: &[u8; 32], data: &[u8]) -> Result<PoolEvent, AmmError> {
        if *topic0 == *SYNC_V2_TOPIC {
            Ok(PoolEvent::SyncV2 {
                reserve0: word_u128(data, 0)?,
                reserve1: word_u128(data, 1)?,
            })
        } else if *topic0 == *SWAP_V2_TOPIC {
            Ok(PoolEvent::SwapV2 {
                amount0_in: word_u128(data, 0)?,
                amount1_in: word_u128(data, 1)?,
                amount0_out: word_u128(data, 2)?,
                amount1_out: word_u128(data, 3)?,
            })
        } else {
            Err(AmmError::UnknownEvent)
        }
    }
}

/// Concentrated-liquidity pools: UniswapV3, QuickswapV3.
#[derive(Debug, Clone, Copy)]
pub struct V3SwapAdapter {
    protocol: DexProtocol,
}

impl V3SwapAdapter {
    /// Gas for a single-hop exactInputSingle.
    pub const SWAP_GAS: u64 = 140_000;

    pub fn new(protocol: DexProtocol) -> Self {
        debug_assert!(protocol.is_v3());
        Self { protocol }
    }

    fn state(pool: &PoolSnapshot) -> Result<V3State, AmmError> {
        match pool.liquidity {
            PoolLiquidity::V3 {
                sqrt_price_x96,
                liquidity,
                tick,
            } => Ok(V3State::with_fee_bps(
                sqrt_price_x96,
                liquidity,
                tick,
                pool.fee_bps,
            )),
            PoolLiquidity::V2 { .. } => Err(AmmError::InvalidInput {
                context: "V3 adapter received constant-product pool".to_string(),
            }),
        }
    }
}

impl PoolAdapter for V3SwapAdapter {
    fn protocol(&self) -> DexProtocol {
        self.protocol
    }

    fn quote_exact_in(
        &self,
        pool: &PoolSnapshot,
        token_in: &EvmAddress,
        amount_in: u128,
    ) -> Result<Quote, AmmError> {
        let zero_for_one = pool
            .zero_for_one(token_in)
            .ok_or(AmmError::TokenNotInPool)?;
        let state = Self::state(pool)?;

        let outcome = v3_math::swap_exact_in(&state, amount_in, zero_for_one)?;
        let impact = v3_math::price_impact_bps(&state, amount_in, zero_for_one)?;

        Ok(Quote {
            amount_in,
            amount_out: outcome.amount_out,
            price_impact_bps: impact,
            fee_bps: pool.fee_bps,
            gas_estimate: Self::SWAP_GAS,
        })
    }

    fn quote_exact_out(
        &self,
        pool: &PoolSnapshot,
        token_out: &EvmAddress,
        amount_out: u128,
    ) -> Result<Quote, AmmError> {
        let token_in = pool
            .other_token(token_out)
            .ok_or(AmmError::TokenNotInPool)?;
        let zero_for_one = pool
            .zero_for_one(&token_in)
            .ok_or(AmmError::TokenNotInPool)?;
        let state = Self::state(pool)?;

        // No closed form within a tick once fees enter; bracket by doubling,
        // then bisect.
        let mut hi = amount_out.max(1);
        let mut reached = None;
        for _ in 0..40 {
            match v3_math::swap_exact_in(&state, hi, zero_for_one) {
                Ok(outcome) if outcome.amount_out >= amount_out => {
                    reached = Some(hi);
                    break;
                }
                Ok(_) => {}
                Err(AmmError::ZeroLiquidity) => return Err(AmmError::ZeroLiquidity),
                Err(_) => break,
            }
            hi = hi.saturating_mul(2);
        }
        let hi = reached.ok_or(AmmError::InsufficientLiquidity {
            requested: amount_out,
            available: 0,
        })?;

        let epsilon = (amount_out / 10_000).max(1);
        let solution = crate::exact_output::solve_exact_output(amount_out, hi, epsilon, |x| {
            Ok(v3_math::swap_exact_in(&state, x, zero_for_one)?.amount_out)
        })?;

        let impact = v3_math::price_impact_bps(&state, solution.amount_in, zero_for_one)?;
        Ok(Quote {
            amount_in: solution.amount_in,
            amount_out: solution.amount_out,
            price_impact_bps: impact,
            fee_bps: pool.fee_bps,
            gas_estimate: Self::SWAP_GAS,
        })
    }

    fn build_swap_calldata(
        &self,
        pool: &PoolSnapshot,
        params: &SwapParams,
    ) -> Result<Vec<u8>, AmmError> {
        let mut calldata = selector(
            "exactInputSingle((address,address,uint24,address,uint256,uint256,uint256,uint160))",
        )
        .to_vec();
        calldata.extend(abi::encode(&[AbiToken::Tuple(vec![
            AbiToken::Address(H160::from(params.token_in)),
            AbiToken::Address(H160::from(params.token_out)),
            AbiToken::Uint(U256::from(pool.fee_bps.saturating_mul(100))),
            AbiToken::Address(H160::from(params.recipient)),
            AbiToken::Uint(U256::from(params.deadline_secs)),
            AbiToken::Uint(U256::from(params.amount_in)),
            AbiToken::Uint(U256::from(params.min_amount_out)),
            AbiToken::Uint(U256::zero()), // no sqrt price limit
        ])]));
        Ok(calldata)
    }

    fn decode_event(&self, topic0: &[u8; 32], data: &[u8]) -> Result<PoolEvent, AmmError> {
        if *topic0 != *SWAP_V3_TOPIC {
            return Err(AmmError::UnknownEvent);
        }
        // words: amount0, amount1, sqrtPriceX96, liquidity, tick
        let sqrt_price_x96 = word_u128(data, 2)?;
        let liquidity = word_u128(data, 3)?;
        let tick = word_u128(data, 4)? as i32;
        Ok(PoolEvent::SwapV3 {
            sqrt_price_x96,
            liquidity,
            tick,
        })
    }
}

/// Adapter table keyed by `(chain, protocol)` with per-protocol defaults.
#[derive(Default)]
pub struct AdapterRegistry {
    by_chain: HashMap<(ChainId, DexProtocol), Arc<dyn PoolAdapter>>,
    defaults: HashMap<DexProtocol, Arc<dyn PoolAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the standard EVM adapters for every V2/V3 variant.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for protocol in [DexProtocol::UniswapV2, DexProtocol::SushiswapV2] {
            registry.register_default(protocol, Arc::new(V2SwapAdapter::new(protocol)));
        }
        for protocol in [DexProtocol::UniswapV3, DexProtocol::QuickswapV3] {
            registry.register_default(protocol, Arc::new(V3SwapAdapter::new(protocol)));
        }
        registry
    }

    pub fn register(
        &mut self,
        chain: ChainId,
        protocol: DexProtocol,
        adapter: Arc<dyn PoolAdapter>,
    ) {
        self.by_chain.insert((chain, protocol), adapter);
    }

    pub fn register_default(&mut self, protocol: DexProtocol, adapter: Arc<dyn PoolAdapter>) {
        self.defaults.insert(protocol, adapter);
    }

    /// Chain-specific adapter if registered, otherwise the protocol default.
    pub fn get(
        &self,
        chain: ChainId,
        protocol: DexProtocol,
    ) -> Result<Arc<dyn PoolAdapter>, AmmError> {
        self.by_chain
            .get(&(chain, protocol))
            .or_else(|| self.defaults.get(&protocol))
            .cloned()
            .ok_or(AmmError::UnsupportedProtocol { dex: protocol })
    }

    pub fn for_pool(&self, pool: &PoolSnapshot) -> Result<Arc<dyn PoolAdapter>, AmmError> {
        self.get(pool.chain, pool.dex)
    }
}
