// ============================================================================
// Event Handler Interface
// Defines the contract for observing order, trade and settlement events
// ============================================================================

use crate::domain::{OrderId, Side, Trade, TransactionId};
use crate::escrow::ContractState;
use crate::numeric::Amount;
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Events emitted by the matching engine and the contract registry
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExchangeEvent {
    /// Order passed validation
    OrderAccepted {
        order_id: OrderId,
        timestamp: DateTime<Utc>,
    },

    /// Order rejected with reason
    OrderRejected {
        order_id: OrderId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Order matched, trade generated
    TradeMatched {
        trade: Trade,
        timestamp: DateTime<Utc>,
    },

    /// Order (or its remainder) added to the book
    OrderRested {
        order_id: OrderId,
        side: Side,
        price: Amount,
        quantity: Amount,
        timestamp: DateTime<Utc>,
    },

    /// Order removed from the book without trading
    OrderCancelled {
        order_id: OrderId,
        timestamp: DateTime<Utc>,
    },

    /// Settlement transfer handed to the ledger
    TradeExecuting {
        transaction_id: TransactionId,
        executed_quantity: Amount,
        timestamp: DateTime<Utc>,
    },

    /// Settlement confirmed, trade complete
    TradeSettled {
        transaction_id: TransactionId,
        timestamp: DateTime<Utc>,
    },

    /// Settlement failed and book state was restored
    TradeRolledBack {
        transaction_id: TransactionId,
        /// Resting order given back its quantity, with that quantity
        restored: Option<(OrderId, Amount)>,
        /// Orders taken off the book because they caused the trade
        removed: Vec<OrderId>,
        timestamp: DateTime<Utc>,
    },

    /// An escrow contract moved to a new state
    ContractStateChanged {
        transaction_id: TransactionId,
        from: ContractState,
        to: ContractState,
        timestamp: DateTime<Utc>,
    },
}

/// Event handler trait for processing exchange events
/// Implementations can handle logging, presentation updates, notifications, etc.
pub trait EventHandler: Send + Sync {
    /// Handle an exchange event
    fn on_event(&self, event: ExchangeEvent);

    /// Batch event handler (optional optimization)
    fn on_events(&self, events: Vec<ExchangeEvent>) {
        for event in events {
            self.on_event(event);
        }
    }
}

/// No-op event handler for testing
pub struct NoOpEventHandler;

impl EventHandler for NoOpEventHandler {
    fn on_event(&self, _event: ExchangeEvent) {
        // Do nothing
    }
}

/// Logging event handler
pub struct LoggingEventHandler;

impl EventHandler for LoggingEventHandler {
    fn on_event(&self, event: ExchangeEvent) {
        tracing::debug!("Exchange event: {:?}", event);
    }
}

/// Forwards events into a channel the presentation layer subscribes to.
pub struct ChannelEventHandler {
    sender: Sender<ExchangeEvent>,
}

impl ChannelEventHandler {
    /// Create a handler and the receiving end of its subscription.
    pub fn unbounded() -> (Self, Receiver<ExchangeEvent>) {
        let (sender, receiver) = channel::unbounded();
        (Self { sender }, receiver)
    }
}

impl EventHandler for ChannelEventHandler {
    fn on_event(&self, event: ExchangeEvent) {
        // A dropped subscriber is not an error for the engine
        if self.sender.send(event).is_err() {
            tracing::trace!("Event subscriber disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_handler() {
        let handler = NoOpEventHandler;
        handler.on_event(ExchangeEvent::OrderAccepted {
            order_id: OrderId::new(),
            timestamp: Utc::now(),
        });
        // Should not panic
    }

    #[test]
    fn test_channel_handler_delivers_in_order() {
        let (handler, receiver) = ChannelEventHandler::unbounded();
        let first = OrderId::new();
        let second = OrderId::new();

        handler.on_events(vec![
            ExchangeEvent::OrderAccepted {
                order_id: first,
                timestamp: Utc::now(),
            },
            ExchangeEvent::OrderCancelled {
                order_id: second,
                timestamp: Utc::now(),
            },
        ]);

        let received: Vec<ExchangeEvent> = receiver.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert!(matches!(received[0], ExchangeEvent::OrderAccepted { order_id, .. } if order_id == first));
        assert!(matches!(received[1], ExchangeEvent::OrderCancelled { order_id, .. } if order_id == second));
    }

    #[test]
    fn test_channel_handler_tolerates_dropped_receiver() {
        let (handler, receiver) = ChannelEventHandler::unbounded();
        drop(receiver);
        handler.on_event(ExchangeEvent::OrderCancelled {
            order_id: OrderId::new(),
            timestamp: Utc::now(),
        });
    }
}
