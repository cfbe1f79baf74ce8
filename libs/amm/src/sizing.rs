//! Trade sizing helpers shared by discovery and the planner.

use crate::v2_math::{self, V2Side};
use crate::AmmError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Optimistic profit bound for a two-pool cycle, used as the discovery gate.
///
/// Ignores price impact entirely: trades `amount_in` at the buy pool's spot
/// price, sells at the sell pool's spot price, and deducts both fees. The true
/// executable profit is always at or below this bound, so candidates below
/// `min_profit_floor × gate_factor` can be dropped before any exact math runs.
pub fn quick_profit_upper_bound(
    buy: &V2Side,
    sell: &V2Side,
    amount_in: Decimal,
) -> Result<Decimal, AmmError> {
    if amount_in <= Decimal::ZERO {
        return Err(AmmError::InvalidInput {
            context: "amount_in must be positive".to_string(),
        });
    }

    let buy_price = v2_math::spot_price(buy.reserve_in, buy.reserve_out)?;
    let sell_price = v2_math::spot_price(sell.reserve_in, sell.reserve_out)?;

    let fee_buy = Decimal::from(10_000u32.saturating_sub(buy.fee_bps)) / dec!(10000);
    let fee_sell = Decimal::from(10_000u32.saturating_sub(sell.fee_bps)) / dec!(10000);

    let intermediate = amount_in * buy_price * fee_buy;
    let back = intermediate * sell_price * fee_sell;
    Ok(back - amount_in)
}

/// Profit-maximizing input for a two-pool cycle, exact under constant-product
/// math. Zero means no profitable size exists.
pub fn optimal_cycle_input(buy: &V2Side, sell: &V2Side) -> Result<Decimal, AmmError> {
    v2_math::optimal_arbitrage_input(buy, sell)
}

/// Exact cycle profit for a concrete input, both hops simulated.
pub fn cycle_profit(buy: &V2Side, sell: &V2Side, amount_in: Decimal) -> Result<Decimal, AmmError> {
    let mid = v2_math::out_given_in(amount_in, buy.reserve_in, buy.reserve_out, buy.fee_bps)?;
    let back = v2_math::out_given_in(mid, sell.reserve_in, sell.reserve_out, sell.fee_bps)?;
    Ok(back - amount_in)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skewed_pools() -> (V2Side, V2Side) {
        // Buy pool prices the asset at 2.0, sell pool at ~2.02 inverse.
        let buy = V2Side {
            reserve_in: dec!(1000000),
            reserve_out: dec!(2000000),
            fee_bps: 30,
        };
        let sell = V2Side {
            reserve_in: dec!(2000000),
            reserve_out: dec!(1010000),
            fee_bps: 30,
        };
        (buy, sell)
    }

    #[test]
    fn quick_bound_dominates_exact_profit() {
        let (buy, sell) = skewed_pools();
        for amount in [dec!(100), dec!(1000), dec!(10000)] {
            let bound = quick_profit_upper_bound(&buy, &sell, amount).unwrap();
            let exact = cycle_profit(&buy, &sell, amount).unwrap();
            assert!(
                bound >= exact,
                "bound {bound} must dominate exact {exact} at size {amount}"
            );
        }
    }

    #[test]
    fn quick_bound_is_negative_when_fees_eat_the_edge() {
        let buy = V2Side {
            reserve_in: dec!(1000000),
            reserve_out: dec!(2000000),
            fee_bps: 30,
        };
        // Mirror pool: no spread at all.
        let sell = V2Side {
            reserve_in: dec!(2000000),
            reserve_out: dec!(1000000),
            fee_bps: 30,
        };
        let bound = quick_profit_upper_bound(&buy, &sell, dec!(1000)).unwrap();
        assert!(bound < Decimal::ZERO);
    }

    #[test]
    fn optimal_input_beats_fixed_sizes() {
        let (buy, sell) = skewed_pools();
        let optimal = optimal_cycle_input(&buy, &sell).unwrap();
        assert!(optimal > Decimal::ZERO);

        let best = cycle_profit(&buy, &sell, optimal).unwrap();
        for fraction in [dec!(0.25), dec!(0.5), dec!(2), dec!(4)] {
            let other = optimal * fraction;
            if other > Decimal::ZERO {
                if let Ok(profit) = cycle_profit(&buy, &sell, other) {
                    assert!(best >= profit - dec!(0.01));
                }
            }
        }
    }
}
