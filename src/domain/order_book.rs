// ============================================================================
// Order Book Domain Model
// ============================================================================

use crate::error::{ExchangeError, ExchangeResult};
use crate::numeric::Amount;
use std::collections::{btree_map, BTreeMap, HashMap};

use super::{Order, OrderId, Side};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// ============================================================================
// Priority Key
// ============================================================================

/// Sort key of a resting order.
///
/// Bids are keyed by the negated price so that ascending iteration yields
/// the highest bid first; asks are keyed by price. The creation sequence
/// breaks ties FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PriorityKey {
    price: Amount,
    sequence: u64,
}

impl PriorityKey {
    fn of(order: &Order) -> Self {
        let price = match order.side {
            Side::Bid => -order.price,
            Side::Ask => order.price,
        };
        Self {
            price,
            sequence: order.sequence(),
        }
    }
}

// ============================================================================
// Order Book Side
// ============================================================================

/// Party-agnostic sorted collection of the orders on one side of the book.
#[derive(Debug, Clone)]
pub struct OrderBook {
    side: Side,
    orders: BTreeMap<PriorityKey, Order>,
    index: HashMap<OrderId, PriorityKey>,
}

impl OrderBook {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            orders: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Insert an order at its priority position.
    pub fn insert(&mut self, order: Order) -> ExchangeResult<()> {
        if order.side != self.side {
            return Err(ExchangeError::InvalidOrder(format!(
                "{:?} order {} inserted into {:?} book",
                order.side, order.id, self.side
            )));
        }
        if !order.remaining().is_positive() {
            return Err(ExchangeError::InvalidOrder(format!(
                "order {} has no remaining quantity",
                order.id
            )));
        }
        if self.index.contains_key(&order.id) {
            return Err(ExchangeError::DuplicateId(order.id));
        }

        let key = PriorityKey::of(&order);
        if self.orders.contains_key(&key) {
            // Sequences are unique per engine; a clash means two orders
            // were inserted without passing through sequencing.
            return Err(ExchangeError::InvalidOrder(format!(
                "order {} reuses creation sequence {}",
                order.id,
                order.sequence()
            )));
        }

        self.index.insert(order.id, key);
        self.orders.insert(key, order);
        Ok(())
    }

    /// Remove and return an order.
    pub fn remove(&mut self, id: &OrderId) -> ExchangeResult<Order> {
        let key = self.index.remove(id).ok_or(ExchangeError::NotFound(*id))?;
        self.orders.remove(&key).ok_or(ExchangeError::NotFound(*id))
    }

    pub fn get(&self, id: &OrderId) -> Option<&Order> {
        self.index.get(id).and_then(|key| self.orders.get(key))
    }

    pub fn contains(&self, id: &OrderId) -> bool {
        self.index.contains_key(id)
    }

    /// Highest-priority order accepted by `predicate`.
    pub fn best_match<P>(&self, predicate: P) -> Option<&Order>
    where
        P: Fn(&Order) -> bool,
    {
        self.orders.values().find(|order| predicate(order))
    }

    /// Take `quantity` from a resting order, removing it once empty.
    ///
    /// Returns the quantity left on the order.
    pub fn fill(&mut self, id: &OrderId, quantity: Amount) -> ExchangeResult<Amount> {
        let key = *self.index.get(id).ok_or(ExchangeError::NotFound(*id))?;
        let order = self
            .orders
            .get_mut(&key)
            .ok_or(ExchangeError::NotFound(*id))?;
        let remaining = order.fill(quantity)?;
        if remaining.is_zero() {
            self.orders.remove(&key);
            self.index.remove(id);
        }
        Ok(remaining)
    }

    /// Add quantity back to a resting order.
    pub fn restore(&mut self, id: &OrderId, quantity: Amount) -> ExchangeResult<Amount> {
        let key = *self.index.get(id).ok_or(ExchangeError::NotFound(*id))?;
        let order = self
            .orders
            .get_mut(&key)
            .ok_or(ExchangeError::NotFound(*id))?;
        order.restore(quantity)
    }

    /// All orders in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &Order> + Clone + '_ {
        self.orders.values()
    }

    /// Orders for one currency, in priority order.
    ///
    /// The returned iterator is lazy and can be cloned to restart it.
    pub fn filter_by_symbol<'a>(&'a self, symbol: &'a str) -> SymbolOrders<'a> {
        SymbolOrders {
            inner: self.orders.values(),
            symbol,
        }
    }

    /// Aggregated (price, quantity) levels for one currency, best first.
    pub fn depth(&self, symbol: &str, num_levels: usize) -> ExchangeResult<Vec<(Amount, Amount)>> {
        let mut levels: Vec<(Amount, Amount)> = Vec::new();
        for order in self.filter_by_symbol(symbol) {
            match levels.last_mut() {
                Some((price, total)) if *price == order.price => {
                    *total = total.checked_add(order.remaining())?;
                },
                _ => {
                    if levels.len() == num_levels {
                        break;
                    }
                    levels.push((order.price, order.remaining()));
                },
            }
        }
        Ok(levels)
    }

    /// Sum of remaining quantity over all orders.
    pub fn total_quantity(&self) -> ExchangeResult<Amount> {
        let mut total = Amount::ZERO;
        for order in self.orders.values() {
            total = total.checked_add(order.remaining())?;
        }
        Ok(total)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

/// Restartable iterator over the orders of one currency.
#[derive(Clone)]
pub struct SymbolOrders<'a> {
    inner: btree_map::Values<'a, PriorityKey, Order>,
    symbol: &'a str,
}

impl<'a> Iterator for SymbolOrders<'a> {
    type Item = &'a Order;

    fn next(&mut self) -> Option<Self::Item> {
        let symbol = self.symbol;
        self.inner.by_ref().find(|order| order.currency == symbol)
    }
}

// ============================================================================
// Order Book Snapshot
// ============================================================================

/// Immutable view of both sides of one currency's book
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OrderBookSnapshot {
    pub currency: String,
    /// Bid levels (price, quantity), best first
    pub bids: Vec<(Amount, Amount)>,
    /// Ask levels (price, quantity), best first
    pub asks: Vec<(Amount, Amount)>,
    /// Current spread (ask - bid)
    pub spread: Option<Amount>,
}

impl OrderBookSnapshot {
    pub fn with_depth(
        currency: String,
        bids: Vec<(Amount, Amount)>,
        asks: Vec<(Amount, Amount)>,
    ) -> ExchangeResult<Self> {
        let spread = match (bids.first(), asks.first()) {
            (Some((bid, _)), Some((ask, _))) => Some(ask.checked_sub(*bid)?),
            _ => None,
        };

        Ok(Self {
            currency,
            bids,
            asks,
            spread,
        })
    }

    pub fn best_bid(&self) -> Option<Amount> {
        self.bids.first().map(|(price, _)| *price)
    }

    pub fn best_ask(&self) -> Option<Amount> {
        self.asks.first().map(|(price, _)| *price)
    }
}
