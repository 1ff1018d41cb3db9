// ============================================================================
// Order Domain Model
// ============================================================================

use crate::error::{ExchangeError, ExchangeResult};
use crate::numeric::Amount;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// ============================================================================
// Value Objects
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OrderId(Uuid);

impl OrderId {
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

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identifier of a remote peer as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bids buy cryptocurrency for fiat, asks sell it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }
}

/// Who placed an order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Owner {
    /// The party running this node
    Local,
    /// A peer reached through the transport
    Remote(PeerId),
}

impl Owner {
    pub fn is_local(&self) -> bool {
        matches!(self, Owner::Local)
    }

    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            Owner::Local => None,
            Owner::Remote(peer) => Some(peer),
        }
    }

    /// Whether an order owned by `self` may trade against one owned by
    /// `other` on this node.
    ///
    /// Owners must differ (no self-trades) and at least one side must be
    /// local: trades between two remote peers are settled on their nodes.
    pub fn can_trade_with(&self, other: &Owner) -> bool {
        self != other && (self.is_local() || other.is_local())
    }
}

// ============================================================================
// Order Entity
// ============================================================================

/// One party's standing offer to exchange cryptocurrency for fiat.
///
/// Everything except the remaining quantity is fixed at creation. The
/// creation sequence is assigned by the matching engine when the order is
/// accepted and drives FIFO priority among equal prices.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Order {
    pub id: OrderId,
    pub side: Side,
    pub owner: Owner,
    pub currency: String,
    /// Fiat price per unit of cryptocurrency
    pub price: Amount,
    pub timestamp: DateTime<Utc>,
    remaining: Amount,
    sequence: u64,
}

impl Order {
    pub fn new(
        side: Side,
        owner: Owner,
        currency: impl Into<String>,
        price: Amount,
        quantity: Amount,
    ) -> Self {
        Self::with_id(OrderId::new(), side, owner, currency, price, quantity)
    }

    /// Create an order under an id chosen elsewhere (e.g. by a remote peer).
    pub fn with_id(
        id: OrderId,
        side: Side,
        owner: Owner,
        currency: impl Into<String>,
        price: Amount,
        quantity: Amount,
    ) -> Self {
        Self {
            id,
            side,
            owner,
            currency: currency.into(),
            price,
            timestamp: Utc::now(),
            remaining: quantity,
            sequence: 0,
        }
    }

    pub fn local(side: Side, currency: impl Into<String>, price: Amount, quantity: Amount) -> Self {
        Self::new(side, Owner::Local, currency, price, quantity)
    }

    pub fn remote(
        peer: PeerId,
        side: Side,
        currency: impl Into<String>,
        price: Amount,
        quantity: Amount,
    ) -> Self {
        Self::new(side, Owner::Remote(peer), currency, price, quantity)
    }

    // ========================================================================
    // Getters
    // ========================================================================

    pub fn remaining(&self) -> Amount {
        self.remaining
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_local(&self) -> bool {
        self.owner.is_local()
    }

    pub fn is_filled(&self) -> bool {
        !self.remaining.is_positive()
    }

    /// Fiat value of the remaining quantity.
    pub fn fiat_value(&self) -> ExchangeResult<Amount> {
        Ok(self.remaining.checked_mul(self.price)?)
    }

    /// Whether this order's price crosses a resting order's price.
    pub fn crosses(&self, resting_price: Amount) -> bool {
        match self.side {
            Side::Bid => self.price >= resting_price,
            Side::Ask => self.price <= resting_price,
        }
    }

    // ========================================================================
    // Quantity Updates
    // ========================================================================

    /// Take `quantity` off the remaining amount.
    ///
    /// Fails without modifying the order when more is requested than is
    /// remaining.
    pub fn fill(&mut self, quantity: Amount) -> ExchangeResult<Amount> {
        if quantity > self.remaining || quantity.is_negative() {
            return Err(ExchangeError::InvalidOrder(format!(
                "cannot fill {} of order {} with {} remaining",
                quantity, self.id, self.remaining
            )));
        }
        self.remaining = self.remaining.checked_sub(quantity)?;
        Ok(self.remaining)
    }

    /// Give back quantity taken by a trade that did not settle.
    pub fn restore(&mut self, quantity: Amount) -> ExchangeResult<Amount> {
        self.remaining = self.remaining.checked_add(quantity)?;
        Ok(self.remaining)
    }

    pub(crate) fn set_remaining(&mut self, quantity: Amount) {
        self.remaining = quantity;
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }
}
