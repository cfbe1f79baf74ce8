//! Constant-product (x·y=k) swap math with full `Decimal` precision.
//!
//! Fees are taken on input, matching the UniswapV2 pair contract. All
//! functions validate reserves and fail closed rather than saturate.

use crate::AmmError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Directional view of a V2 pool: `reserve_in` backs the token being sold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct V2Side {
    pub reserve_in: Decimal,
    pub reserve_out: Decimal,
    pub fee_bps: u32,
}

fn check_reserves(reserve_in: Decimal, reserve_out: Decimal) -> Result<(), AmmError> {
    if reserve_in <= Decimal::ZERO || reserve_out <= Decimal::ZERO {
        return Err(AmmError::ZeroLiquidity);
    }
    Ok(())
}

/// Output for a given input: `Δy = (x_f · y) / (x + x_f)` with
/// `x_f = Δx · (10⁴ − fee) / 10⁴`.
pub fn out_given_in(
    amount_in: Decimal,
    reserve_in: Decimal,
    reserve_out: Decimal,
    fee_bps: u32,
) -> Result<Decimal, AmmError> {
    if amount_in <= Decimal::ZERO {
        return Err(AmmError::InvalidInput {
            context: format!("amount_in {amount_in} must be positive"),
        });
    }
    check_reserves(reserve_in, reserve_out)?;

    let after_fee = amount_in * Decimal::from(10_000u32.saturating_sub(fee_bps)) / dec!(10000);
    let numerator = after_fee * reserve_out;
    let denominator = reserve_in + after_fee;
    Ok(numerator / denominator)
}

/// Input required for a given output, rounded up so the swap cannot underfill.
pub fn in_given_out(
    amount_out: Decimal,
    reserve_in: Decimal,
    reserve_out: Decimal,
    fee_bps: u32,
) -> Result<Decimal, AmmError> {
    if amount_out <= Decimal::ZERO {
        return Err(AmmError::InvalidInput {
            context: format!("amount_out {amount_out} must be positive"),
        });
    }
    check_reserves(reserve_in, reserve_out)?;
    if amount_out >= reserve_out {
        use rust_decimal::prelude::ToPrimitive;
        return Err(AmmError::InsufficientLiquidity {
            requested: amount_out.to_u128().unwrap_or(u128::MAX),
            available: reserve_out.to_u128().unwrap_or(0),
        });
    }

    let numerator = reserve_in * amount_out * dec!(10000);
    let denominator =
        (reserve_out - amount_out) * Decimal::from(10_000u32.saturating_sub(fee_bps));
    if denominator <= Decimal::ZERO {
        return Err(AmmError::InvalidInput {
            context: "fee consumes the entire input".to_string(),
        });
    }
    Ok(numerator / denominator + Decimal::ONE)
}

/// Marginal price before any trade, quoted as output per input.
pub fn spot_price(reserve_in: Decimal, reserve_out: Decimal) -> Result<Decimal, AmmError> {
    check_reserves(reserve_in, reserve_out)?;
    Ok(reserve_out / reserve_in)
}

/// Price impact of a trade in basis points, fee excluded.
pub fn price_impact_bps(
    amount_in: Decimal,
    reserve_in: Decimal,
    reserve_out: Decimal,
) -> Result<u32, AmmError> {
    check_reserves(reserve_in, reserve_out)?;
    if amount_in <= Decimal::ZERO {
        return Err(AmmError::InvalidInput {
            context: "amount_in must be positive for impact".to_string(),
        });
    }

    let before = reserve_out / reserve_in;
    let out = out_given_in(amount_in, reserve_in, reserve_out, 0)?;
    let after = (reserve_out - out) / (reserve_in + amount_in);
    let impact = (before - after).abs() / before * dec!(10000);
    Ok(impact
        .round()
        .try_into()
        .map_err(|_| AmmError::Overflow {
            context: "price impact bps",
        })?)
}

/// Shortfall from the zero-impact exchange rate, in basis points.
pub fn slippage_bps(
    amount_in: Decimal,
    reserve_in: Decimal,
    reserve_out: Decimal,
    fee_bps: u32,
) -> Result<u32, AmmError> {
    let ideal = amount_in * spot_price(reserve_in, reserve_out)?;
    let actual = out_given_in(amount_in, reserve_in, reserve_out, fee_bps)?;
    if ideal <= Decimal::ZERO {
        return Ok(0);
    }
    let slip = (ideal - actual) / ideal * dec!(10000);
    Ok(slip.round().try_into().unwrap_or(u32::MAX))
}

/// Closed-form input that maximizes profit for the cycle buy→sell.
///
/// Setting d(profit)/d(amount) = 0 over two constant-product hops gives
/// `x* = (sqrt(x_b · y_b · x_s · y_s · f_b · f_s) − x_b · f_b) / f_b`.
/// Returns zero when no profitable input exists. The result is capped at 10%
/// of the constraining reserve; beyond that the model error dominates.
pub fn optimal_arbitrage_input(buy: &V2Side, sell: &V2Side) -> Result<Decimal, AmmError> {
    check_reserves(buy.reserve_in, buy.reserve_out)?;
    check_reserves(sell.reserve_in, sell.reserve_out)?;

    let fee_buy = Decimal::from(10_000u32.saturating_sub(buy.fee_bps)) / dec!(10000);
    let fee_sell = Decimal::from(10_000u32.saturating_sub(sell.fee_bps)) / dec!(10000);

    let radicand = buy.reserve_in
        * buy.reserve_out
        * sell.reserve_in
        * sell.reserve_out
        * fee_buy
        * fee_sell;
    if radicand <= Decimal::ZERO {
        return Ok(Decimal::ZERO);
    }

    let root = decimal_sqrt(radicand)?;
    let optimal = (root - buy.reserve_in * fee_buy) / fee_buy;
    if optimal <= Decimal::ZERO {
        return Ok(Decimal::ZERO);
    }

    let cap = buy.reserve_in.min(sell.reserve_out) * dec!(0.1);
    Ok(optimal.min(cap))
}

/// Newton-method square root; keeps precision on large reserve products.
pub fn decimal_sqrt(value: Decimal) -> Result<Decimal, AmmError> {
    if value < Decimal::ZERO {
        return Err(AmmError::InvalidInput {
            context: "sqrt of negative value".to_string(),
        });
    }
    if value == Decimal::ZERO {
        return Ok(Decimal::ZERO);
    }

    let epsilon = dec!(0.0000000001);
    let mut x = value;
    let mut prev = Decimal::ZERO;
    for _ in 0..100 {
        let next = (x + value / x) / dec!(2);
        if (next - prev).abs() < epsilon {
            return Ok(next);
        }
        prev = x;
        x = next;
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_given_in_matches_constant_product() {
        // 100 in against 1000/2000 reserves at 30 bps: ~181.32 out
        let out = out_given_in(dec!(100), dec!(1000), dec!(2000), 30).unwrap();
        assert!((out - dec!(181.32)).abs() < dec!(0.01));
    }

    #[test]
    fn in_given_out_round_trips_above_out_given_in() {
        let needed = in_given_out(dec!(181), dec!(1000), dec!(2000), 30).unwrap();
        let produced = out_given_in(needed, dec!(1000), dec!(2000), 30).unwrap();
        assert!(produced >= dec!(181));
    }

    #[test]
    fn in_given_out_rejects_draining_the_pool() {
        let err = in_given_out(dec!(2000), dec!(1000), dec!(2000), 30).unwrap_err();
        assert!(matches!(err, AmmError::InsufficientLiquidity { .. }));
    }

    #[test]
    fn zero_reserves_fail_closed() {
        assert_eq!(
            out_given_in(dec!(1), dec!(0), dec!(2000), 30),
            Err(AmmError::ZeroLiquidity)
        );
    }

    #[test]
    fn optimal_input_is_positive_when_prices_diverge() {
        let buy = V2Side {
            reserve_in: dec!(10000),
            reserve_out: dec!(20000),
            fee_bps: 30,
        };
        let sell = V2Side {
            reserve_in: dec!(19000),
            reserve_out: dec!(10500),
            fee_bps: 30,
        };
        let optimal = optimal_arbitrage_input(&buy, &sell).unwrap();
        assert!(optimal > Decimal::ZERO);
        // capped at 10% of constraining reserve
        assert!(optimal <= dec!(1000));
    }

    #[test]
    fn optimal_input_is_zero_on_balanced_pools() {
        let side = V2Side {
            reserve_in: dec!(10000),
            reserve_out: dec!(20000),
            fee_bps: 30,
        };
        let mirrored = V2Side {
            reserve_in: dec!(20000),
            reserve_out: dec!(10000),
            fee_bps: 30,
        };
        let optimal = optimal_arbitrage_input(&side, &mirrored).unwrap();
        assert_eq!(optimal, Decimal::ZERO);
    }

    #[test]
    fn price_impact_grows_with_size() {
        let small = price_impact_bps(dec!(10), dec!(10000), dec!(20000)).unwrap();
        let large = price_impact_bps(dec!(1000), dec!(10000), dec!(20000)).unwrap();
        assert!(large > small);
    }

    #[test]
    fn sqrt_converges() {
        assert!((decimal_sqrt(dec!(100)).unwrap() - dec!(10)).abs() < dec!(0.0001));
        assert!((decimal_sqrt(dec!(2)).unwrap() - dec!(1.41421356)).abs() < dec!(0.0001));
    }
}
