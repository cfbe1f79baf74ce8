//! Bisection solver for exact-output planning.
//!
//! Given a monotone quote function (any chain of adapter hops composed by the
//! planner), solves for the input that produces a requested output within
//! `epsilon_out`, in at most [`MAX_SOLVER_ITERATIONS`] iterations.

use crate::AmmError;
use tracing::trace;

/// Iteration cap; doubling precision per iteration makes 16 ample for any
/// realistic amount range.
pub const MAX_SOLVER_ITERATIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExactOutputSolution {
    pub amount_in: u128,
    pub amount_out: u128,
    pub iterations: usize,
}

/// Solve `quote(amount_in) ≈ target_out` over `[1, max_amount_in]`.
///
/// Returns [`AmmError::InsufficientLiquidity`] when the bracket cannot close:
/// even `max_amount_in` does not reach the target output.
pub fn solve_exact_output<F>(
    target_out: u128,
    max_amount_in: u128,
    epsilon_out: u128,
    quote: F,
) -> Result<ExactOutputSolution, AmmError>
where
    F: Fn(u128) -> Result<u128, AmmError>,
{
    if target_out == 0 {
        return Err(AmmError::InvalidInput {
            context: "target_out must be positive".to_string(),
        });
    }
    if max_amount_in == 0 {
        return Err(AmmError::InvalidInput {
            context: "max_amount_in must be positive".to_string(),
        });
    }

    // The bracket must contain the target before bisection starts.
    let at_max = quote(max_amount_in)?;
    if at_max < target_out.saturating_sub(epsilon_out) {
        return Err(AmmError::InsufficientLiquidity {
            requested: target_out,
            available: at_max,
        });
    }

    let mut lo = 1u128;
    let mut hi = max_amount_in;
    let mut best = ExactOutputSolution {
        amount_in: max_amount_in,
        amount_out: at_max,
        iterations: 0,
    };

    for iteration in 1..=MAX_SOLVER_ITERATIONS {
        let mid = lo + (hi - lo) / 2;
        let out = match quote(mid) {
            Ok(out) => out,
            Err(AmmError::InsufficientLiquidity { .. }) | Err(AmmError::ZeroLiquidity) => {
                // Mid overdrains an intermediate hop; shrink from above.
                hi = mid;
                continue;
            }
            Err(e) => return Err(e),
        };

        trace!(iteration, mid, out, target_out, "exact-output bisection step");

        let distance = out.abs_diff(target_out);
        if distance < best.amount_out.abs_diff(target_out) || out >= target_out {
            // Track the closest admissible point that still covers the target.
            if out >= target_out || distance <= epsilon_out {
                best = ExactOutputSolution {
                    amount_in: mid,
                    amount_out: out,
                    iterations: iteration,
                };
            }
        }

        if distance <= epsilon_out {
            return Ok(ExactOutputSolution {
                amount_in: mid,
                amount_out: out,
                iterations: iteration,
            });
        }

        if out < target_out {
            lo = mid + 1;
        } else {
            hi = mid;
        }
        if lo >= hi {
            break;
        }
    }

    // Bisection exhausted: return the best point that covers the target.
    if best.amount_out >= target_out.saturating_sub(epsilon_out) {
        Ok(best)
    } else {
        Err(AmmError::InsufficientLiquidity {
            requested: target_out,
            available: best.amount_out,
        })
    }
}
