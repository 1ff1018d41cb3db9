// ============================================================================
// Transport Interface
// Order and payment messages exchanged with remote peers
// ============================================================================

use crate::domain::{OrderId, PeerId, Side, Trade, TransactionId};
use crate::interfaces::ledger::LedgerTxId;
use crate::numeric::Amount;
use parking_lot::Mutex;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Messages carried between peers. The byte encoding belongs to the
/// transport implementation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PeerMessage {
    /// A peer placed an order
    OrderSubmitted {
        order_id: OrderId,
        side: Side,
        currency: String,
        price: Amount,
        quantity: Amount,
    },

    /// A peer withdrew a resting order
    OrderCancelled { order_id: OrderId },

    /// The sender matched one of its orders against one of the recipient's
    TradeMatched(MatchNotice),

    /// The sender broadcast the settlement transfer for a trade
    PaymentReady {
        transaction_id: TransactionId,
        ledger_tx_id: LedgerTxId,
        amount: Amount,
    },

    /// Settlement of a trade cannot proceed
    PaymentFailed {
        transaction_id: TransactionId,
        reason: String,
    },
}

/// A trade as announced to the counterparty, so that both nodes track it
/// under the same transaction id.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MatchNotice {
    pub transaction_id: TransactionId,
    /// The recipient's order
    pub order_id: OrderId,
    /// The sender's order
    pub counter_order_id: OrderId,
    pub counter_side: Side,
    pub currency: String,
    pub price: Amount,
    pub quantity: Amount,
}

impl MatchNotice {
    /// Describe `trade` to its remote counterparty. `None` unless exactly
    /// one side of the trade is local.
    pub fn for_counterparty(trade: &Trade) -> Option<(PeerId, MatchNotice)> {
        let local_side = trade.local_side()?;
        let peer = trade.counterparty_peer()?.clone();
        let local = trade.order(local_side);
        let remote = trade.order(local_side.opposite());
        Some((
            peer,
            MatchNotice {
                transaction_id: trade.id,
                order_id: remote.id,
                counter_order_id: local.id,
                counter_side: local_side,
                currency: trade.currency().to_string(),
                price: trade.price,
                quantity: trade.quantity,
            },
        ))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),

    #[error("transport closed")]
    Closed,
}

/// Outbound side of the peer-to-peer transport
pub trait Transport: Send + Sync {
    fn send(&self, peer: &PeerId, message: PeerMessage) -> Result<(), TransportError>;

    fn broadcast(&self, message: PeerMessage) -> Result<(), TransportError>;
}

/// Transport that delivers nothing
pub struct NoOpTransport;

impl Transport for NoOpTransport {
    fn send(&self, _peer: &PeerId, _message: PeerMessage) -> Result<(), TransportError> {
        Ok(())
    }

    fn broadcast(&self, _message: PeerMessage) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Keeps every outbound message; `None` as recipient means broadcast.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(Option<PeerId>, PeerMessage)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Option<PeerId>, PeerMessage)> {
        self.sent.lock().clone()
    }

    pub fn take(&self) -> Vec<(Option<PeerId>, PeerMessage)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Transport for RecordingTransport {
    fn send(&self, peer: &PeerId, message: PeerMessage) -> Result<(), TransportError> {
        self.sent.lock().push((Some(peer.clone()), message));
        Ok(())
    }

    fn broadcast(&self, message: PeerMessage) -> Result<(), TransportError> {
        self.sent.lock().push((None, message));
        Ok(())
    }
}
