//! # MEV Threat Analysis & Protection
//!
//! Classifies sandwich / front-run / back-run / oracle-manipulation risk for
//! a planned route and chooses the submission strategy: public, protected
//! gas, private bundle, delayed, or abort. The controller is pure given its
//! inputs; side effects are limited to metrics.

pub mod bundle;
pub mod protection;
pub mod relay;
pub mod threat;

pub use bundle::{Bundle, BundleBuilder};
pub use protection::ProtectionController;
pub use relay::{BundleRelay, BundleStatus, HttpBundleRelay, MockRelay};
pub use threat::{MempoolSignal, PoolAnomaly, ThreatAnalyzer};

use thiserror::Error;
use types::ErrorKind;

#[derive(Debug, Error)]
pub enum MevError {
    #[error("transaction cancelled by protection controller")]
    Cancelled,

    #[error("execution aborted under critical MEV threat")]
    Aborted,

    #[error("unknown protection level '{0}'")]
    InvalidLevel(String),

    #[error("relay unavailable: {reason}")]
    RelayUnavailable { reason: String },

    #[error("relay rejected bundle: {reason}")]
    BundleRejected { reason: String },
}

impl MevError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MevError::Cancelled => ErrorKind::TransactionCancelled,
            MevError::Aborted => ErrorKind::MevThreatCritical,
            MevError::InvalidLevel(_) => ErrorKind::Validation,
            MevError::RelayUnavailable { .. } => ErrorKind::RelayUnavailable,
            MevError::BundleRejected { .. } => ErrorKind::Validation,
        }
    }
}
