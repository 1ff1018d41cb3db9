// ============================================================================
// Error Types
// One taxonomy for book, settlement and collaborator failures
// ============================================================================

use crate::domain::{OrderId, TransactionId};
use crate::interfaces::{LedgerError, StoreError, TransportError};
use crate::numeric::NumericError;
use thiserror::Error;

/// Errors surfaced by the matching engine, escrow contracts and registry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    /// Bad input, rejected before any state change
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("order {0} is already live")]
    DuplicateId(OrderId),

    #[error("order {0} not found")]
    NotFound(OrderId),

    #[error("unknown transaction {0}")]
    UnknownTransaction(TransactionId),

    #[error("transaction {0} was already finalized")]
    AlreadyFinalized(TransactionId),

    #[error("a contract for transaction {0} is already registered")]
    DuplicateContract(TransactionId),

    #[error("invalid contract transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Transient: the poll loop retries with backoff
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// The ledger refused to broadcast the settlement transfer
    #[error("ledger broadcast failed: {0}")]
    BroadcastFailed(String),

    /// Terminal: the ledger never reported the transaction
    #[error("ledger transaction not confirmed within the observation window")]
    ConfirmationTimeout,

    /// Terminal: a conflicting transaction was observed
    #[error("double spend observed for the settlement transaction")]
    DoubleSpendObserved,

    #[error("numeric error: {0}")]
    Numeric(#[from] NumericError),

    #[error("durable store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<LedgerError> for ExchangeError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Unavailable(reason) => ExchangeError::LedgerUnavailable(reason),
            LedgerError::Rejected(reason) => ExchangeError::BroadcastFailed(reason),
        }
    }
}

impl ExchangeError {
    /// Transient failures are retried by re-polling and never fail a
    /// contract directly.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::LedgerUnavailable(_) | ExchangeError::Transport(_)
        )
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;
