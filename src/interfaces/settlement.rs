// ============================================================================
// Settlement Listener Interface
// Receives the outcome of escrow contracts reaching a terminal state
// ============================================================================

use crate::error::{ExchangeError, ExchangeResult};
use crate::escrow::EscrowContract;

/// Finalization side effects run by the contract registry.
///
/// The registry only deletes a contract's durable record after the matching
/// callback returned `Ok`; an error keeps the contract for the next poll.
pub trait SettlementListener: Send + Sync {
    /// The settlement transfer reached the required confirmations
    fn on_settled(&self, contract: &EscrowContract) -> ExchangeResult<()>;

    /// The contract failed and its trade must be rolled back
    fn on_failed(&self, contract: &EscrowContract, reason: &ExchangeError) -> ExchangeResult<()>;
}

/// Listener that accepts every outcome
pub struct NoOpSettlementListener;

impl SettlementListener for NoOpSettlementListener {
    fn on_settled(&self, _contract: &EscrowContract) -> ExchangeResult<()> {
        Ok(())
    }

    fn on_failed(&self, _contract: &EscrowContract, _reason: &ExchangeError) -> ExchangeResult<()> {
        Ok(())
    }
}
