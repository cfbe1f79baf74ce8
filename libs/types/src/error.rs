//! Shared error taxonomy.
//!
//! Every crate defines its own `thiserror` enum; each maps into [`ErrorKind`]
//! so the HTTP boundary and retry policy can treat errors uniformly without
//! downcasting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire-level error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Bad input (invalid address, zero amount). Never retried.
    Validation,
    /// Opportunity/workflow/pool absent. Not retried.
    NotFound,
    /// Pool snapshot older than its staleness TTL. Skipped and counted.
    Stale,
    InsufficientLiquidity,
    PriceImpactTooHigh,
    NoProfitableRoute,
    InvalidSignature,
    ExpiredDeadline,
    NonceConflict,
    MevThreatCritical,
    TransactionCancelled,
    /// Private relay unreachable. Transient, retried with backoff.
    RelayUnavailable,
    /// Backend control plane unreachable. Transient, retried with backoff.
    BackendUnavailable,
    /// KV substrate unreachable. Transient; rate limiter and cache fail open.
    KvUnavailable,
    ExecutionReverted,
    TransactionTimedOut,
    /// A named lock is held; caller may retry after the lock TTL.
    LockHeld,
    RateLimited,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Stale => "STALE",
            ErrorKind::InsufficientLiquidity => "INSUFFICIENT_LIQUIDITY",
            ErrorKind::PriceImpactTooHigh => "PRICE_IMPACT_TOO_HIGH",
            ErrorKind::NoProfitableRoute => "NO_PROFITABLE_ROUTE",
            ErrorKind::InvalidSignature => "INVALID_SIGNATURE",
            ErrorKind::ExpiredDeadline => "EXPIRED_DEADLINE",
            ErrorKind::NonceConflict => "NONCE_CONFLICT",
            ErrorKind::MevThreatCritical => "MEV_THREAT_CRITICAL",
            ErrorKind::TransactionCancelled => "TRANSACTION_CANCELLED",
            ErrorKind::RelayUnavailable => "RELAY_UNAVAILABLE",
            ErrorKind::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ErrorKind::KvUnavailable => "KV_UNAVAILABLE",
            ErrorKind::ExecutionReverted => "EXECUTION_REVERTED",
            ErrorKind::TransactionTimedOut => "TRANSACTION_TIMED_OUT",
            ErrorKind::LockHeld => "LOCK_HELD",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// Transient kinds are retried with bounded backoff and set `Retry-After`
    /// on the HTTP surface.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::RelayUnavailable
                | ErrorKind::BackendUnavailable
                | ErrorKind::KvUnavailable
                | ErrorKind::RateLimited
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_exactly_the_retryable_set() {
        assert!(ErrorKind::RelayUnavailable.is_transient());
        assert!(ErrorKind::BackendUnavailable.is_transient());
        assert!(ErrorKind::KvUnavailable.is_transient());
        assert!(!ErrorKind::Validation.is_transient());
        assert!(!ErrorKind::ExecutionReverted.is_transient());
        assert!(!ErrorKind::LockHeld.is_transient());
    }
}
