//! # Execution Engine
//!
//! Signs, submits, monitors, and reconciles arbitrage routes, with ordered
//! fallback strategies when protection or execution fails.
//!
//! ## Architecture Role
//!
//! ```text
//! Submission Decision → [Nonce Assignment] → [Signing] → [Strategy Path] → [Monitoring]
//!         ↓                    ↓                 ↓             ↓               ↓
//! MEV Controller        Per-Chain Owner    EIP-712/Legacy  Direct/Bundle   Receipt Poll
//! Gas Envelope          Gap-Free Order     Local Wallet    Delay/Protect   Reconciliation
//! ```
//!
//! One executor task per chain preserves nonce ordering; `execute` is
//! idempotent by `(workflow, route fingerprint)` so redelivered requests
//! return the original execution.

pub mod engine;
pub mod fallback;
pub mod flash_loan;
pub mod nonce;
pub mod rpc;
pub mod signer;

pub use engine::{Executor, FlashLoanPlan};
pub use fallback::{FallbackAction, FallbackPolicy, FallbackTrigger};
pub use flash_loan::FlashLoanRegistry;
pub use nonce::NonceManager;
pub use rpc::{BlockchainRpc, EthersRpc, FeeData, LogEntry, MockRpc, TxReceipt};
pub use signer::{Eip712Domain, ExecutionPermit, LocalSigner, TxSigner};

use mev::MevError;
use thiserror::Error;
use types::{ChainId, ErrorKind};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("submission failed: {reason}")]
    SubmissionFailed { reason: String },

    #[error("all RPC endpoints failed: {reason}")]
    RpcUnavailable { reason: String },

    #[error("signing failed: {reason}")]
    SigningFailed { reason: String },

    #[error("deadline passed before submission")]
    ExpiredDeadline,

    #[error("nonce conflict for signer on chain {chain}")]
    NonceConflict { chain: ChainId },

    #[error("flash loan provider 0x{} is not registered", hex::encode(.provider))]
    UnknownFlashLoanProvider { provider: [u8; 20] },

    #[error("loan repayment exceeds expected profit: profit {profit_usd}, fee {fee_usd} + gas {gas_usd}")]
    UnprofitableLoan {
        profit_usd: rust_decimal::Decimal,
        fee_usd: rust_decimal::Decimal,
        gas_usd: rust_decimal::Decimal,
    },

    #[error("invalid flash loan provider address '{address}'")]
    InvalidProviderAddress { address: String },

    #[error("workflow stopped")]
    Stopped,

    #[error(transparent)]
    Mev(#[from] MevError),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::SubmissionFailed { .. } => ErrorKind::Internal,
            ExecutionError::RpcUnavailable { .. } => ErrorKind::BackendUnavailable,
            ExecutionError::SigningFailed { .. } => ErrorKind::InvalidSignature,
            ExecutionError::ExpiredDeadline => ErrorKind::ExpiredDeadline,
            ExecutionError::NonceConflict { .. } => ErrorKind::NonceConflict,
            ExecutionError::UnknownFlashLoanProvider { .. } => ErrorKind::Validation,
            ExecutionError::UnprofitableLoan { .. } => ErrorKind::NoProfitableRoute,
            ExecutionError::InvalidProviderAddress { .. } => ErrorKind::Validation,
            ExecutionError::Stopped => ErrorKind::Validation,
            ExecutionError::Mev(e) => e.kind(),
        }
    }
}
