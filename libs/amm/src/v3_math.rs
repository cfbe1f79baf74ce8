//! Concentrated-liquidity swap math, within-tick model.
//!
//! Swaps are modeled inside the active tick range: accurate for the trade
//! sizes the planner allows (impact-capped well below a tick crossing) and
//! deliberately conservative beyond it.

use crate::AmmError;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub const MIN_TICK: i32 = -887272;
pub const MAX_TICK: i32 = 887272;
pub const MIN_SQRT_RATIO: u128 = 4295128739;
pub const MAX_SQRT_RATIO: u128 = 340282366920938463463374607431768211455;

const Q96: u128 = 1 << 96;

/// Active-tick state of a concentrated-liquidity pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V3State {
    pub sqrt_price_x96: u128,
    pub liquidity: u128,
    pub tick: i32,
    /// Fee in hundredths of a bip (3000 = 0.30%).
    pub fee_pips: u32,
}

impl V3State {
    /// Build from pool fee in basis points (30 bps → 3000 pips).
    pub fn with_fee_bps(sqrt_price_x96: u128, liquidity: u128, tick: i32, fee_bps: u32) -> Self {
        Self {
            sqrt_price_x96,
            liquidity,
            tick,
            fee_pips: fee_bps.saturating_mul(100),
        }
    }
}

/// Result of a simulated swap: output, post-trade sqrt price, post-trade tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V3SwapOutcome {
    pub amount_out: u128,
    pub sqrt_price_after_x96: u128,
    pub tick_after: i32,
}

/// Simulate an exact-input swap within the active tick.
pub fn swap_exact_in(
    state: &V3State,
    amount_in: u128,
    zero_for_one: bool,
) -> Result<V3SwapOutcome, AmmError> {
    if state.liquidity == 0 {
        return Err(AmmError::ZeroLiquidity);
    }
    if amount_in == 0 {
        return Err(AmmError::InvalidInput {
            context: "amount_in must be positive".to_string(),
        });
    }

    let after_fee = amount_in
        .checked_mul(1_000_000u128.saturating_sub(state.fee_pips as u128))
        .ok_or(AmmError::Overflow {
            context: "v3 fee application",
        })?
        / 1_000_000;

    let (amount_out, sqrt_price_after_x96) = if zero_for_one {
        step_price_down(state.sqrt_price_x96, state.liquidity, after_fee)?
    } else {
        step_price_up(state.sqrt_price_x96, state.liquidity, after_fee)?
    };

    Ok(V3SwapOutcome {
        amount_out,
        sqrt_price_after_x96,
        tick_after: tick_from_sqrt_price(sqrt_price_after_x96),
    })
}

/// token0 → token1: price moves down, output is token1.
fn step_price_down(
    sqrt_price_x96: u128,
    liquidity: u128,
    amount_in: u128,
) -> Result<(u128, u128), AmmError> {
    // ΔsqrtP = Δx · Q96 / L
    let delta = amount_in
        .checked_mul(Q96)
        .ok_or(AmmError::Overflow {
            context: "v3 price delta",
        })?
        / liquidity;

    let new_price = sqrt_price_x96.saturating_sub(delta).max(MIN_SQRT_RATIO);
    let amount_out = amount1_delta(new_price, sqrt_price_x96, liquidity)?;
    Ok((amount_out, new_price))
}

/// token1 → token0: price moves up, output is token0.
fn step_price_up(
    sqrt_price_x96: u128,
    liquidity: u128,
    amount_in: u128,
) -> Result<(u128, u128), AmmError> {
    // Δy moves price up by Δy · Q96 / L
    let delta = amount_in
        .checked_mul(Q96)
        .ok_or(AmmError::Overflow {
            context: "v3 price delta",
        })?
        / liquidity;

    let new_price = sqrt_price_x96
        .saturating_add(delta)
        .min(MAX_SQRT_RATIO);
    let amount_out = amount0_delta(sqrt_price_x96, new_price, liquidity)?;
    Ok((amount_out, new_price))
}

/// token0 owed across a sqrt-price range.
pub fn amount0_delta(
    sqrt_price_lo_x96: u128,
    sqrt_price_hi_x96: u128,
    liquidity: u128,
) -> Result<u128, AmmError> {
    if sqrt_price_lo_x96 > sqrt_price_hi_x96 {
        return amount0_delta(sqrt_price_hi_x96, sqrt_price_lo_x96, liquidity);
    }
    let diff = sqrt_price_hi_x96 - sqrt_price_lo_x96;
    if diff == 0 {
        return Ok(0);
    }

    // amount0 = L · Δ / (sqrtP_lo · sqrtP_hi / Q96); scale down to avoid
    // overflowing the 128-bit intermediate products.
    if diff < (1u128 << 32) && liquidity < (1u128 << 32) {
        let denom = sqrt_price_lo_x96 >> 48;
        if denom == 0 {
            return Err(AmmError::Overflow {
                context: "v3 amount0 denominator",
            });
        }
        return Ok(liquidity * diff / denom);
    }

    let scale = 1u128 << 32;
    let denom = sqrt_price_lo_x96 >> 48;
    if denom == 0 {
        return Err(AmmError::Overflow {
            context: "v3 amount0 denominator",
        });
    }
    Ok((liquidity / scale) * (diff / scale) * (1u128 << 48) / denom)
}

/// token1 owed across a sqrt-price range: `L · Δ / Q96`.
pub fn amount1_delta(
    sqrt_price_lo_x96: u128,
    sqrt_price_hi_x96: u128,
    liquidity: u128,
) -> Result<u128, AmmError> {
    if sqrt_price_lo_x96 > sqrt_price_hi_x96 {
        return amount1_delta(sqrt_price_hi_x96, sqrt_price_lo_x96, liquidity);
    }
    let diff = sqrt_price_hi_x96 - sqrt_price_lo_x96;
    if diff == 0 {
        return Ok(0);
    }

    if diff < (1u128 << 48) && liquidity < (1u128 << 48) {
        return Ok(liquidity * diff / (1u128 << 48));
    }

    liquidity
        .checked_mul(diff)
        .map(|v| v >> 96)
        .ok_or(AmmError::Overflow {
            context: "v3 amount1 product",
        })
}

/// Linear tick approximation; exact log-base-1.0001 is unnecessary for
/// within-tick simulation.
pub fn tick_from_sqrt_price(sqrt_price_x96: u128) -> i32 {
    if sqrt_price_x96 <= MIN_SQRT_RATIO {
        return MIN_TICK;
    }
    if sqrt_price_x96 >= MAX_SQRT_RATIO {
        return MAX_TICK;
    }
    let span = MAX_SQRT_RATIO - MIN_SQRT_RATIO;
    let offset = sqrt_price_x96 - MIN_SQRT_RATIO;
    // scale both by 2^64 before dividing to stay inside u128
    let ratio = (offset >> 64) as i128 * (2 * MAX_TICK as i128) / ((span >> 64) as i128);
    (ratio - MAX_TICK as i128) as i32
}

/// Price impact of a within-tick swap, in basis points.
pub fn price_impact_bps(
    state: &V3State,
    amount_in: u128,
    zero_for_one: bool,
) -> Result<u32, AmmError> {
    let before = sqrt_price_to_price(state.sqrt_price_x96)?;
    let outcome = swap_exact_in(state, amount_in, zero_for_one)?;
    let after = sqrt_price_to_price(outcome.sqrt_price_after_x96)?;
    if before <= Decimal::ZERO {
        return Ok(0);
    }
    let impact = (before - after).abs() / before * dec!(10000);
    Ok(impact.round().try_into().unwrap_or(u32::MAX))
}

/// `price = (sqrtP / 2^96)²`, truncated into `Decimal` range.
pub fn sqrt_price_to_price(sqrt_price_x96: u128) -> Result<Decimal, AmmError> {
    let scaled = Decimal::from_u128(sqrt_price_x96 >> 32).ok_or(AmmError::Overflow {
        context: "sqrt price to decimal",
    })?;
    let sqrt_price = scaled / Decimal::from_u128(Q96 >> 32).unwrap_or(Decimal::MAX);
    Ok(sqrt_price * sqrt_price)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRICE_ONE_X96: u128 = 79228162514264337593543950336;

    fn unit_pool() -> V3State {
        V3State {
            sqrt_price_x96: PRICE_ONE_X96,
            liquidity: 1_000_000_000_000,
            tick: 0,
            fee_pips: 3000,
        }
    }

    #[test]
    fn small_swap_stays_within_tick_and_pays_fee() {
        let outcome = swap_exact_in(&unit_pool(), 1_000_000, true).unwrap();
        assert!(outcome.amount_out > 0);
        assert!(outcome.amount_out < 1_000_000);
        assert!(outcome.sqrt_price_after_x96 < PRICE_ONE_X96);
    }

    #[test]
    fn opposite_direction_moves_price_up() {
        let outcome = swap_exact_in(&unit_pool(), 1_000_000, false).unwrap();
        assert!(outcome.sqrt_price_after_x96 > PRICE_ONE_X96);
    }

    #[test]
    fn zero_liquidity_is_rejected() {
        let mut pool = unit_pool();
        pool.liquidity = 0;
        assert_eq!(
            swap_exact_in(&pool, 1_000, true),
            Err(AmmError::ZeroLiquidity)
        );
    }

    #[test]
    fn amount_deltas_are_positive_over_a_range() {
        let lo = PRICE_ONE_X96;
        let hi = PRICE_ONE_X96 + 1_000_000;
        assert!(amount0_delta(lo, hi, 1_000_000_000).unwrap() > 0);
        assert!(amount1_delta(lo, hi, 1_000_000_000).unwrap() > 0);
    }

    #[test]
    fn fee_bps_to_pips_conversion() {
        let state = V3State::with_fee_bps(PRICE_ONE_X96, 1, 0, 30);
        assert_eq!(state.fee_pips, 3000);
    }

    #[test]
    fn impact_increases_with_trade_size() {
        let pool = unit_pool();
        let small = price_impact_bps(&pool, 1_000_000, true).unwrap();
        let large = price_impact_bps(&pool, 100_000_000, true).unwrap();
        assert!(large >= small);
    }
}
