// ============================================================================
// Ledger Client Interface
// Broadcasts settlement transfers and reports their confirmation depth
// ============================================================================

use crate::domain::TransactionId;
use crate::numeric::Amount;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Identifier the ledger assigns to a broadcast transaction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LedgerTxId(String);

impl LedgerTxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LedgerTxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address receiving the cryptocurrency side of a trade.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LedgerAddress(String);

impl LedgerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LedgerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the ledger client needs to build and broadcast a transfer.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransferTemplate {
    pub transaction_id: TransactionId,
    pub destination: LedgerAddress,
    pub amount: Amount,
    pub fee: Amount,
}

/// What the ledger currently reports for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    /// Included in the chain with this many confirmations on the current tip
    Confirmations(u32),
    /// Not known to the ledger (not yet propagated, or dropped)
    NotFound,
    /// A conflicting transaction spending the same inputs was observed
    Conflicted,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Transient: node unreachable, RPC timeout, ...
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    /// The transfer was refused by the ledger
    #[error("transaction rejected: {0}")]
    Rejected(String),
}

/// Ledger client collaborator.
///
/// Implementations may block on network I/O; callers never hold engine or
/// registry locks while calling them.
pub trait LedgerClient: Send + Sync {
    /// Build and broadcast a transfer, returning its ledger id
    fn broadcast(&self, template: &TransferTemplate) -> Result<LedgerTxId, LedgerError>;

    /// Query the confirmation state of a broadcast transaction
    fn confirmations(&self, tx_id: &LedgerTxId) -> Result<LedgerStatus, LedgerError>;
}

// ============================================================================
// In-Memory Ledger
// ============================================================================

#[derive(Default)]
struct LedgerState {
    transactions: HashMap<LedgerTxId, LedgerStatus>,
    broadcasts: Vec<TransferTemplate>,
    unavailable: bool,
    reject_broadcasts: bool,
    queries: usize,
}

/// Scripted ledger for tests and demos.
///
/// Broadcast transactions start with zero confirmations; tests move them
/// along with [`InMemoryLedger::set_confirmations`].
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_confirmations(&self, tx_id: &LedgerTxId, confirmations: u32) {
        self.state
            .lock()
            .transactions
            .insert(tx_id.clone(), LedgerStatus::Confirmations(confirmations));
    }

    pub fn mark_conflicted(&self, tx_id: &LedgerTxId) {
        self.state
            .lock()
            .transactions
            .insert(tx_id.clone(), LedgerStatus::Conflicted);
    }

    /// Forget a transaction, as after a reorg that evicted it.
    pub fn drop_transaction(&self, tx_id: &LedgerTxId) {
        self.state.lock().transactions.remove(tx_id);
    }

    pub fn set_available(&self, available: bool) {
        self.state.lock().unavailable = !available;
    }

    pub fn reject_broadcasts(&self, reject: bool) {
        self.state.lock().reject_broadcasts = reject;
    }

    pub fn broadcasts(&self) -> Vec<TransferTemplate> {
        self.state.lock().broadcasts.clone()
    }

    /// Number of confirmation queries answered or refused so far.
    pub fn query_count(&self) -> usize {
        self.state.lock().queries
    }
}

impl LedgerClient for InMemoryLedger {
    fn broadcast(&self, template: &TransferTemplate) -> Result<LedgerTxId, LedgerError> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        if state.reject_broadcasts {
            return Err(LedgerError::Rejected("insufficient funds".to_string()));
        }

        let tx_id = LedgerTxId::new(Uuid::new_v4().simple().to_string());
        state
            .transactions
            .insert(tx_id.clone(), LedgerStatus::Confirmations(0));
        state.broadcasts.push(template.clone());
        Ok(tx_id)
    }

    fn confirmations(&self, tx_id: &LedgerTxId) -> Result<LedgerStatus, LedgerError> {
        let mut state = self.state.lock();
        state.queries += 1;
        if state.unavailable {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        Ok(state
            .transactions
            .get(tx_id)
            .copied()
            .unwrap_or(LedgerStatus::NotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> TransferTemplate {
        TransferTemplate {
            transaction_id: TransactionId::new(),
            destination: LedgerAddress::new("bc1qdest"),
            amount: Amount::ONE,
            fee: Amount::ZERO,
        }
    }

    #[test]
    fn test_broadcast_then_confirm() {
        let ledger = InMemoryLedger::new();
        let tx = ledger.broadcast(&template()).unwrap();

        assert_eq!(ledger.confirmations(&tx), Ok(LedgerStatus::Confirmations(0)));
        ledger.set_confirmations(&tx, 6);
        assert_eq!(ledger.confirmations(&tx), Ok(LedgerStatus::Confirmations(6)));
        assert_eq!(ledger.broadcasts().len(), 1);
        assert_eq!(ledger.query_count(), 2);
    }

    #[test]
    fn test_unknown_and_conflicted() {
        let ledger = InMemoryLedger::new();
        let unknown = LedgerTxId::new("missing");
        assert_eq!(ledger.confirmations(&unknown), Ok(LedgerStatus::NotFound));

        let tx = ledger.broadcast(&template()).unwrap();
        ledger.mark_conflicted(&tx);
        assert_eq!(ledger.confirmations(&tx), Ok(LedgerStatus::Conflicted));

        ledger.drop_transaction(&tx);
        assert_eq!(ledger.confirmations(&tx), Ok(LedgerStatus::NotFound));
    }

    #[test]
    fn test_outage_and_rejection() {
        let ledger = InMemoryLedger::new();
        ledger.set_available(false);
        assert!(matches!(
            ledger.broadcast(&template()),
            Err(LedgerError::Unavailable(_))
        ));
        assert!(matches!(
            ledger.confirmations(&LedgerTxId::new("x")),
            Err(LedgerError::Unavailable(_))
        ));

        ledger.set_available(true);
        ledger.reject_broadcasts(true);
        assert!(matches!(
            ledger.broadcast(&template()),
            Err(LedgerError::Rejected(_))
        ));
        assert!(ledger.broadcasts().is_empty());
    }
}
