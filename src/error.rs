use thiserror::Error;
use uuid::Uuid;

use crate::domain::anchor::AnchorStatus;
use crate::domain::payment::PaymentStatus;

pub type Result<T> = std::result::Result<T, AnchorError>;

/// Failure modes of the external ledger, as observed by the orchestrator.
///
/// The ledger enforces hash uniqueness and writer authorization at its own
/// storage layer; these variants only mirror its observable outcomes.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("hash already anchored on the ledger")]
    DuplicateHash,
    #[error("writer identity is not authorized to anchor")]
    Unauthorized,
    #[error("network error: {0}")]
    Network(String),
    #[error("ledger confirmation timed out")]
    Timeout,
    #[error("submission rejected by the ledger: {0}")]
    Rejected(String),
}

impl LedgerError {
    /// Transient failures that the queue may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }
}

#[derive(Debug, Error)]
pub enum AnchorError {
    #[error("payment {0} not found")]
    PaymentNotFound(Uuid),
    #[error("payment {id} cannot be anchored while {status}")]
    InvalidState { id: Uuid, status: PaymentStatus },
    #[error("invalid payment status transition {from} -> {to}")]
    InvalidPaymentTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },
    #[error("invalid anchor status transition {from} -> {to}")]
    InvalidAnchorTransition {
        from: AnchorStatus,
        to: AnchorStatus,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("ledger holds a conflicting anchor for this hash")]
    HashCollision,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("queue unavailable: {0}")]
    Queue(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnchorError {
    /// Whether the queue should reschedule the job instead of dead-lettering.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Ledger(err) => err.is_retryable(),
            _ => false,
        }
    }
}
