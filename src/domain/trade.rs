// ============================================================================
// Trade Domain Model
// ============================================================================

use crate::numeric::{Amount, NumericResult};
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

use super::{Order, Owner, PeerId, Side};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Globally unique identifier of a matched trade and its settlement.
///
/// Both peers key their escrow contracts and durable records by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Represents a matched trade between two orders, pending settlement
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Trade {
    pub id: TransactionId,

    /// Bid as it was just before this match
    pub buy_order: Order,

    /// Ask as it was just before this match
    pub sell_order: Order,

    /// Execution price (the resting order's price)
    pub price: Amount,

    /// Matched cryptocurrency quantity
    pub quantity: Amount,

    /// Side of the incoming order that triggered the match
    pub aggressor: Side,

    pub timestamp: DateTime<Utc>,
}

impl Trade {
    pub fn new(
        buy_order: Order,
        sell_order: Order,
        price: Amount,
        quantity: Amount,
        aggressor: Side,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            buy_order,
            sell_order,
            price,
            quantity,
            aggressor,
            timestamp: Utc::now(),
        }
    }

    pub fn currency(&self) -> &str {
        &self.sell_order.currency
    }

    /// Fiat value of the trade (price * quantity)
    pub fn fiat_amount(&self) -> NumericResult<Amount> {
        self.quantity.checked_mul(self.price)
    }

    pub fn order(&self, side: Side) -> &Order {
        match side {
            Side::Bid => &self.buy_order,
            Side::Ask => &self.sell_order,
        }
    }

    /// The order that was resting in the book when the match happened.
    pub fn resting_order(&self) -> &Order {
        self.order(self.aggressor.opposite())
    }

    pub fn aggressor_order(&self) -> &Order {
        self.order(self.aggressor)
    }

    /// Which side this node's party is on, if any.
    pub fn local_side(&self) -> Option<Side> {
        if self.buy_order.is_local() {
            Some(Side::Bid)
        } else if self.sell_order.is_local() {
            Some(Side::Ask)
        } else {
            None
        }
    }

    /// The party facing `side` in this trade.
    pub fn counterparty_of(&self, side: Side) -> &Owner {
        &self.order(side.opposite()).owner
    }

    /// The remote peer this node settles with.
    pub fn counterparty_peer(&self) -> Option<&PeerId> {
        self.local_side()
            .and_then(|side| self.counterparty_of(side).peer())
    }
}
