// ============================================================================
// Escrow Contract
// State machine for one settlement transfer of a trade
// ============================================================================

use super::record::ContractRecord;
use crate::domain::{ExchangeConfig, PeerId, Side, Trade, TransactionId};
use crate::error::{ExchangeError, ExchangeResult};
use crate::interfaces::{DurableStore, LedgerAddress, LedgerError, LedgerStatus, LedgerTxId};
use crate::numeric::Amount;
use chrono::{DateTime, Utc};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// ============================================================================
// Role and State
// ============================================================================

/// Which way the cryptocurrency moves for this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Role {
    /// This node owns the ask and sends the cryptocurrency
    Sender,
    /// This node owns the bid and receives the cryptocurrency
    Receiver,
}

/// Lifecycle of an escrow contract.
///
/// ```text
/// Created -> Activated -> AwaitingConfirmation -> Confirmed -> Finalized
///                |                 |
///                +-----> Failed <--+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ContractState {
    Created,
    Activated,
    AwaitingConfirmation,
    Confirmed,
    Finalized,
    Failed,
}

impl ContractState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContractState::Finalized | ContractState::Failed)
    }

    /// Activated and not yet resolved: the states the poll loop advances.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ContractState::Activated | ContractState::AwaitingConfirmation
        )
    }

    pub fn can_transition_to(&self, next: ContractState) -> bool {
        use ContractState::*;
        matches!(
            (self, next),
            (Created, Activated)
                | (Activated, AwaitingConfirmation)
                | (AwaitingConfirmation, Confirmed)
                | (Activated, Failed)
                | (AwaitingConfirmation, Failed)
                | (Confirmed, Finalized)
        )
    }
}

impl fmt::Display for ContractState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContractState::Created => "created",
            ContractState::Activated => "activated",
            ContractState::AwaitingConfirmation => "awaiting-confirmation",
            ContractState::Confirmed => "confirmed",
            ContractState::Finalized => "finalized",
            ContractState::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Poll Inputs and Outputs
// ============================================================================

/// What one poll cycle learned about a contract's ledger transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// No ledger transaction is attached yet
    NoLedgerTx,
    Status(LedgerStatus),
    Error(LedgerError),
}

impl From<Result<LedgerStatus, LedgerError>> for Observation {
    fn from(result: Result<LedgerStatus, LedgerError>) -> Self {
        match result {
            Ok(status) => Observation::Status(status),
            Err(err) => Observation::Error(err),
        }
    }
}

/// Result of applying an observation.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStep {
    /// Still inside the observation window
    Waiting { confirmations: u32 },
    /// Ledger error; the next `skip_polls` cycles will not query
    Backoff { skip_polls: u32 },
    Confirmed,
    Failed(ExchangeError),
}

// ============================================================================
// Escrow Contract
// ============================================================================

/// One node's view of the settlement transfer for a trade.
///
/// Both parties hold a contract for the same transaction id with opposite
/// roles. The contract only moves forward; its durable record is written
/// before any state that has side effects becomes visible.
#[derive(Debug, Clone, PartialEq)]
pub struct EscrowContract {
    pub transaction_id: TransactionId,
    pub role: Role,
    /// Cryptocurrency quantity being transferred
    pub crypto_amount: Amount,
    /// Network fee paid by the sender
    pub fee: Amount,
    /// Fiat price per unit agreed in the trade
    pub fiat_price: Amount,
    pub currency: String,
    pub counterparty: PeerId,
    pub destination: Option<LedgerAddress>,
    pub created_at: DateTime<Utc>,

    ledger_tx_id: Option<LedgerTxId>,
    state: ContractState,
    failure: Option<ExchangeError>,
    /// Set once the settlement listener accepted a failure
    compensated: bool,
    /// In-memory state is ahead of the durable record
    record_stale: bool,

    // Poll bookkeeping
    confirmations: u32,
    unobserved_polls: u32,
    ledger_errors: u32,
    skip_polls: u32,
}

impl EscrowContract {
    /// Build the contract for this node's side of `trade`.
    ///
    /// The local party owning the ask sends the cryptocurrency.
    pub fn for_trade(
        trade: &Trade,
        destination: Option<LedgerAddress>,
        fee: Amount,
    ) -> ExchangeResult<Self> {
        let role = match trade.local_side() {
            Some(Side::Ask) => Role::Sender,
            Some(Side::Bid) => Role::Receiver,
            None => {
                return Err(ExchangeError::InvalidOrder(format!(
                    "trade {} has no local party",
                    trade.id
                )))
            }
        };
        let counterparty = trade.counterparty_peer().cloned().ok_or_else(|| {
            ExchangeError::InvalidOrder(format!("trade {} has no remote counterparty", trade.id))
        })?;

        Ok(Self::new(
            trade.id,
            role,
            trade.quantity,
            fee,
            trade.price,
            trade.currency().to_string(),
            counterparty,
            destination,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transaction_id: TransactionId,
        role: Role,
        crypto_amount: Amount,
        fee: Amount,
        fiat_price: Amount,
        currency: String,
        counterparty: PeerId,
        destination: Option<LedgerAddress>,
    ) -> Self {
        Self {
            transaction_id,
            role,
            crypto_amount,
            fee,
            fiat_price,
            currency,
            counterparty,
            destination,
            created_at: Utc::now(),
            ledger_tx_id: None,
            state: ContractState::Created,
            failure: None,
            compensated: false,
            record_stale: false,
            confirmations: 0,
            unobserved_polls: 0,
            ledger_errors: 0,
            skip_polls: 0,
        }
    }

    // ========================================================================
    // Getters
    // ========================================================================

    pub fn state(&self) -> ContractState {
        self.state
    }

    pub fn is_activated(&self) -> bool {
        !matches!(self.state, ContractState::Created)
    }

    pub fn ledger_tx_id(&self) -> Option<&LedgerTxId> {
        self.ledger_tx_id.as_ref()
    }

    /// Why the contract failed, once it has
    pub fn failure(&self) -> Option<&ExchangeError> {
        self.failure.as_ref()
    }

    pub fn is_compensated(&self) -> bool {
        self.compensated
    }

    /// Confirmations seen at the last successful ledger query
    pub fn confirmations(&self) -> u32 {
        self.confirmations
    }

    pub fn unobserved_polls(&self) -> u32 {
        self.unobserved_polls
    }

    /// Fiat owed for the transfer; computed, never stored.
    pub fn fiat_amount(&self) -> ExchangeResult<Amount> {
        Ok(self.crypto_amount.checked_mul(self.fiat_price)?)
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    fn transition(&mut self, next: ContractState) -> ExchangeResult<ContractState> {
        self.ensure_transition(next)?;
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    fn ensure_transition(&self, next: ContractState) -> ExchangeResult<()> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(ExchangeError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Commit point: persist the record, then become Activated.
    ///
    /// Nothing changes in memory when the store write fails.
    pub fn activate(&mut self, store: &dyn DurableStore) -> ExchangeResult<()> {
        self.ensure_transition(ContractState::Activated)?;
        let mut record = self.to_record();
        record.state = ContractState::Activated;
        store.put(&self.transaction_id, &record)?;
        self.transition(ContractState::Activated)?;
        Ok(())
    }

    /// Attach the broadcast ledger transaction.
    ///
    /// Attaching the same id again is accepted; a different id is not.
    /// The transfer already exists on the ledger, so the id is kept in
    /// memory even when the store write fails; the record is then marked
    /// stale and [`EscrowContract::persist`] writes it later.
    pub fn set_ledger_tx_id(
        &mut self,
        tx_id: LedgerTxId,
        store: &dyn DurableStore,
    ) -> ExchangeResult<()> {
        if self.state == ContractState::AwaitingConfirmation
            && self.ledger_tx_id.as_ref() == Some(&tx_id)
        {
            return Ok(());
        }
        self.transition(ContractState::AwaitingConfirmation)?;
        self.ledger_tx_id = Some(tx_id);
        self.unobserved_polls = 0;
        self.persist(store)
    }

    /// Whether the durable record lags behind this contract
    pub fn is_record_stale(&self) -> bool {
        self.record_stale
    }

    /// Write the current state to the store, clearing the stale mark on
    /// success.
    pub fn persist(&mut self, store: &dyn DurableStore) -> ExchangeResult<()> {
        match store.put(&self.transaction_id, &self.to_record()) {
            Ok(()) => {
                self.record_stale = false;
                Ok(())
            }
            Err(err) => {
                self.record_stale = true;
                Err(err.into())
            }
        }
    }

    /// Apply one poll observation.
    ///
    /// Ledger errors never fail the contract; they only grow the backoff.
    /// A transaction the ledger does not know about (or no transaction at
    /// all) uses up the observation window. Seeing the transaction resets
    /// the window.
    pub fn observe(
        &mut self,
        observation: Observation,
        config: &ExchangeConfig,
    ) -> ExchangeResult<PollStep> {
        if !self.state.is_pending() {
            return Err(ExchangeError::InvalidTransition {
                from: self.state.to_string(),
                to: ContractState::Confirmed.to_string(),
            });
        }

        let status = match observation {
            Observation::Error(_) => {
                self.ledger_errors = self.ledger_errors.saturating_add(1);
                let exponent = self.ledger_errors - 1;
                self.skip_polls = 1u32
                    .checked_shl(exponent)
                    .unwrap_or(u32::MAX)
                    .min(config.max_backoff_polls);
                return Ok(PollStep::Backoff {
                    skip_polls: self.skip_polls,
                });
            }
            Observation::NoLedgerTx => LedgerStatus::NotFound,
            Observation::Status(status) => status,
        };
        self.ledger_errors = 0;

        match status {
            LedgerStatus::NotFound => {
                self.unobserved_polls = self.unobserved_polls.saturating_add(1);
                if self.unobserved_polls >= config.max_unconfirmed_polls {
                    return self
                        .fail(ExchangeError::ConfirmationTimeout)
                        .map(PollStep::Failed);
                }
                Ok(PollStep::Waiting {
                    confirmations: self.confirmations,
                })
            }
            LedgerStatus::Conflicted => self
                .fail(ExchangeError::DoubleSpendObserved)
                .map(PollStep::Failed),
            LedgerStatus::Confirmations(count) => {
                self.unobserved_polls = 0;
                // A reorg may lower the count; only the current tip matters
                self.confirmations = count;
                if count >= config.required_confirmations
                    && self.state == ContractState::AwaitingConfirmation
                {
                    self.transition(ContractState::Confirmed)?;
                    return Ok(PollStep::Confirmed);
                }
                Ok(PollStep::Waiting {
                    confirmations: count,
                })
            }
        }
    }

    /// Move to Failed, remembering why. Returns the reason for convenience.
    pub fn fail(&mut self, reason: ExchangeError) -> ExchangeResult<ExchangeError> {
        self.transition(ContractState::Failed)?;
        self.failure = Some(reason.clone());
        Ok(reason)
    }

    pub fn finalize(&mut self) -> ExchangeResult<()> {
        self.transition(ContractState::Finalized)?;
        Ok(())
    }

    pub(crate) fn mark_compensated(&mut self) {
        self.compensated = true;
    }

    /// Consume one cycle of backoff. Returns whether this cycle may query
    /// the ledger.
    pub(crate) fn begin_poll(&mut self) -> bool {
        if self.skip_polls > 0 {
            self.skip_polls -= 1;
            false
        } else {
            true
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn to_record(&self) -> ContractRecord {
        ContractRecord {
            transaction_id: self.transaction_id,
            role: self.role,
            crypto_amount: self.crypto_amount,
            fee: self.fee,
            fiat_price: self.fiat_price,
            currency: self.currency.clone(),
            counterparty: self.counterparty.clone(),
            destination: self.destination.clone(),
            ledger_tx_id: self.ledger_tx_id.clone(),
            state: self.state,
            created_at: self.created_at,
        }
    }

    /// Rebuild a contract from its durable record with fresh poll
    /// bookkeeping.
    pub fn from_record(record: ContractRecord) -> Self {
        Self {
            transaction_id: record.transaction_id,
            role: record.role,
            crypto_amount: record.crypto_amount,
            fee: record.fee,
            fiat_price: record.fiat_price,
            currency: record.currency,
            counterparty: record.counterparty,
            destination: record.destination,
            created_at: record.created_at,
            ledger_tx_id: record.ledger_tx_id,
            state: record.state,
            failure: None,
            compensated: false,
            record_stale: false,
            confirmations: 0,
            unobserved_polls: 0,
            ledger_errors: 0,
            skip_polls: 0,
        }
    }
}
