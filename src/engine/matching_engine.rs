// ============================================================================
// Matching Engine
// Order matching plus the bookkeeping of trades awaiting settlement
// ============================================================================

use super::price_time::{match_order, Trades};
use crate::domain::{
    ExchangeConfig, Order, OrderBook, OrderBookSnapshot, OrderId, Owner, PeerId, Side, Trade,
    TransactionId,
};
use crate::error::{ExchangeError, ExchangeResult};
use crate::escrow::{EscrowContract, Role};
use crate::interfaces::{
    EventHandler, ExchangeEvent, LedgerAddress, LedgerTxId, MatchNotice, SettlementListener,
    TransferTemplate,
};
use crate::numeric::Amount;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// Results
// ============================================================================

/// Outcome of submitting one order
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Trades in execution order
    pub trades: Trades,
    /// The unmatched remainder, now resting in its book
    pub resting: Option<Order>,
}

/// Where the engine stands with a trade between match and settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradePhase {
    /// Matched; nobody has started settling
    Matched,
    /// `start_execute` handed out a contract and transfer template
    Executing,
    /// The ledger transaction is known
    Broadcast,
}

/// A trade that has not settled or rolled back yet.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveTransaction {
    pub trade: Trade,
    pub phase: TradePhase,
    pub ledger_tx_id: Option<LedgerTxId>,
    /// Quantity actually transferred, once known
    pub executed: Option<Amount>,
    /// Local order that received the shortfall, if any
    republished: Option<(OrderId, Amount)>,
}

impl ActiveTransaction {
    fn new(trade: Trade) -> Self {
        Self {
            trade,
            phase: TradePhase::Matched,
            ledger_tx_id: None,
            executed: None,
            republished: None,
        }
    }
}

/// Book changes made by `finish_execute`
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatedOrderState {
    pub transaction_id: TransactionId,
    pub executed: Amount,
    /// Matched quantity that was not transferred
    pub shortfall: Amount,
    /// Local order now carrying the shortfall, with its remaining quantity
    pub republished: Option<(OrderId, Amount)>,
}

/// Book changes made by `rollback`
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackOutcome {
    pub transaction_id: TransactionId,
    /// Resting order given back its executed quantity, with that quantity
    pub restored: Option<(OrderId, Amount)>,
    /// Orders taken off the book because they caused the failed trade
    pub removed: Vec<OrderId>,
}

// ============================================================================
// Book State
// ============================================================================

struct BookState {
    bids: OrderBook,
    asks: OrderBook,
    active: HashMap<TransactionId, ActiveTransaction>,
    /// Makers of active trades that were cancelled after matching
    withdrawn: HashSet<OrderId>,
}

impl BookState {
    fn book(&self, side: Side) -> &OrderBook {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    fn book_mut(&mut self, side: Side) -> &mut OrderBook {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    fn find(&self, id: &OrderId) -> Option<&Order> {
        self.bids.get(id).or_else(|| self.asks.get(id))
    }

    fn remove_any(&mut self, id: &OrderId) -> Option<Order> {
        self.bids.remove(id).or_else(|_| self.asks.remove(id)).ok()
    }

    /// Take an order off the book for good. Active trades it made keep
    /// it from being restored on rollback.
    fn withdraw(&mut self, id: &OrderId) -> Option<Order> {
        let order = self.remove_any(id)?;
        if self
            .active
            .values()
            .any(|active| active.trade.resting_order().id == *id)
        {
            self.withdrawn.insert(*id);
        }
        Some(order)
    }

    fn prune_withdrawn(&mut self) {
        let active = &self.active;
        self.withdrawn.retain(|id| {
            active
                .values()
                .any(|active| active.trade.resting_order().id == *id)
        });
    }

    /// Local orders in creation order
    fn local_orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .bids
            .iter()
            .chain(self.asks.iter())
            .filter(|order| order.is_local())
            .cloned()
            .collect();
        orders.sort_by_key(|order| order.sequence());
        orders
    }
}

// ============================================================================
// Matching Engine
// ============================================================================

/// Matches local and remote interest and tracks the resulting trades until
/// their escrow contracts resolve.
///
/// One coarse lock guards both books and the active trades; it is never
/// held while calling out to the ledger or transport.
pub struct MatchingEngine {
    config: Arc<ExchangeConfig>,

    state: Mutex<BookState>,

    /// Event handler for processing events
    event_handler: Arc<dyn EventHandler>,

    /// Sequence counter for order sequencing
    sequence_counter: AtomicU64,
}

impl MatchingEngine {
    /// Create a new matching engine
    pub fn new(config: Arc<ExchangeConfig>, event_handler: Arc<dyn EventHandler>) -> Self {
        Self {
            config,
            state: Mutex::new(BookState {
                bids: OrderBook::new(Side::Bid),
                asks: OrderBook::new(Side::Ask),
                active: HashMap::new(),
                withdrawn: HashSet::new(),
            }),
            event_handler,
            sequence_counter: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    // ========================================================================
    // Order Entry
    // ========================================================================

    /// Submit an order placed by this node's party
    pub fn submit_local_order(&self, order: Order) -> ExchangeResult<MatchResult> {
        if !order.is_local() {
            return self.reject(order.id, "order is not owned by the local party".to_string());
        }
        self.process(order)
    }

    /// Enter an order announced by a peer. It only trades against local
    /// resting orders.
    pub fn notice_remote_order(&self, order: Order) -> ExchangeResult<MatchResult> {
        if order.is_local() {
            return self.reject(order.id, "remote order carries no peer".to_string());
        }
        self.process(order)
    }

    /// Record a trade a peer matched against one of our resting orders.
    ///
    /// The local order must still be resting with enough quantity, and the
    /// execution price must be acceptable to it. Re-delivery of a known
    /// transaction returns the recorded trade.
    pub fn accept_remote_match(&self, peer: &PeerId, notice: &MatchNotice) -> ExchangeResult<Trade> {
        let trade = {
            let mut state = self.state.lock();
            if let Some(active) = state.active.get(&notice.transaction_id) {
                return Ok(active.trade.clone());
            }

            let local_side = notice.counter_side.opposite();
            let book = state.book_mut(local_side);
            let local = match book.get(&notice.order_id) {
                Some(order) if order.is_local() => order.clone(),
                _ => return Err(ExchangeError::NotFound(notice.order_id)),
            };
            if local.currency != notice.currency
                || !local.crosses(notice.price)
                || notice.quantity > local.remaining()
                || !notice.quantity.is_positive()
            {
                return Err(ExchangeError::InvalidOrder(format!(
                    "match {} does not fit order {}",
                    notice.transaction_id, local.id
                )));
            }

            let counter = Order::with_id(
                notice.counter_order_id,
                notice.counter_side,
                Owner::Remote(peer.clone()),
                notice.currency.clone(),
                notice.price,
                notice.quantity,
            );
            book.fill(&local.id, notice.quantity)?;

            let (buy_order, sell_order) = match local_side {
                Side::Bid => (local, counter),
                Side::Ask => (counter, local),
            };
            // On this book the counter order is what consumed the local one
            let mut trade = Trade::new(
                buy_order,
                sell_order,
                notice.price,
                notice.quantity,
                notice.counter_side,
            );
            trade.id = notice.transaction_id;
            state
                .active
                .insert(trade.id, ActiveTransaction::new(trade.clone()));
            trade
        };

        info!(
            "Trade {} accepted from {}: {} @ {} {}",
            trade.id,
            peer,
            trade.quantity,
            trade.price,
            trade.currency()
        );
        self.event_handler.on_event(ExchangeEvent::TradeMatched {
            trade: trade.clone(),
            timestamp: Utc::now(),
        });
        Ok(trade)
    }

    fn process(&self, mut order: Order) -> ExchangeResult<MatchResult> {
        if let Err(reason) = self.validate_order(&order) {
            return self.reject(order.id, reason);
        }

        let mut events = vec![ExchangeEvent::OrderAccepted {
            order_id: order.id,
            timestamp: Utc::now(),
        }];

        let result = {
            let mut state = self.state.lock();
            if state.find(&order.id).is_some() {
                drop(state);
                return self.reject_with(order.id, ExchangeError::DuplicateId(order.id));
            }

            // Under the lock so book order follows sequence order
            let seq = self.sequence_counter.fetch_add(1, Ordering::AcqRel) + 1;
            order.set_sequence(seq);

            let opposite = state.book_mut(order.side.opposite());
            let trades = match_order(&mut order, opposite)?;

            for trade in &trades {
                state
                    .active
                    .insert(trade.id, ActiveTransaction::new(trade.clone()));
            }

            let resting = if order.remaining().is_positive() {
                state.book_mut(order.side).insert(order.clone())?;
                Some(order)
            } else {
                None
            };
            MatchResult { trades, resting }
        };

        for trade in &result.trades {
            info!(
                "Trade {}: {} @ {} {} (aggressor {:?})",
                trade.id,
                trade.quantity,
                trade.price,
                trade.currency(),
                trade.aggressor
            );
            events.push(ExchangeEvent::TradeMatched {
                trade: trade.clone(),
                timestamp: Utc::now(),
            });
        }
        if let Some(resting) = &result.resting {
            debug!(
                "Order {} rests: {:?} {} @ {}",
                resting.id,
                resting.side,
                resting.remaining(),
                resting.price
            );
            events.push(ExchangeEvent::OrderRested {
                order_id: resting.id,
                side: resting.side,
                price: resting.price,
                quantity: resting.remaining(),
                timestamp: Utc::now(),
            });
        }

        self.event_handler.on_events(events);
        Ok(result)
    }

    fn validate_order(&self, order: &Order) -> Result<(), String> {
        if !order.remaining().is_positive() {
            return Err("Quantity must be positive".to_string());
        }
        if !order.price.is_positive() {
            return Err("Price must be positive".to_string());
        }
        if !self.config.is_known_currency(&order.currency) {
            return Err(format!("Unknown currency {}", order.currency));
        }
        Ok(())
    }

    fn reject<T>(&self, order_id: OrderId, reason: String) -> ExchangeResult<T> {
        self.reject_with(order_id, ExchangeError::InvalidOrder(reason))
    }

    fn reject_with<T>(&self, order_id: OrderId, err: ExchangeError) -> ExchangeResult<T> {
        debug!("Order {} rejected: {}", order_id, err);
        self.event_handler.on_event(ExchangeEvent::OrderRejected {
            order_id,
            reason: err.to_string(),
            timestamp: Utc::now(),
        });
        Err(err)
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancel a resting local order
    pub fn cancel_order(&self, order_id: &OrderId) -> ExchangeResult<Order> {
        let order = {
            let mut state = self.state.lock();
            match state.find(order_id) {
                Some(order) if order.is_local() => {}
                _ => return Err(ExchangeError::NotFound(*order_id)),
            }
            state
                .withdraw(order_id)
                .ok_or(ExchangeError::NotFound(*order_id))?
        };
        self.cancelled(&order);
        Ok(order)
    }

    /// Cancel the local order at `index` in [`MatchingEngine::my_orders`]
    pub fn cancel_order_at(&self, index: usize) -> ExchangeResult<Order> {
        let order = {
            let mut state = self.state.lock();
            let id = state
                .local_orders()
                .get(index)
                .map(|order| order.id)
                .ok_or_else(|| {
                    ExchangeError::InvalidOrder(format!("no local order at index {}", index))
                })?;
            state.withdraw(&id).ok_or(ExchangeError::NotFound(id))?
        };
        self.cancelled(&order);
        Ok(order)
    }

    /// Withdraw an order a peer cancelled. Only that peer's orders qualify.
    pub fn remove_remote_order(&self, peer: &PeerId, order_id: &OrderId) -> ExchangeResult<Order> {
        let order = {
            let mut state = self.state.lock();
            match state.find(order_id) {
                Some(order) if order.owner.peer() == Some(peer) => {}
                _ => return Err(ExchangeError::NotFound(*order_id)),
            }
            state
                .withdraw(order_id)
                .ok_or(ExchangeError::NotFound(*order_id))?
        };
        self.cancelled(&order);
        Ok(order)
    }

    fn cancelled(&self, order: &Order) {
        debug!("Order {} cancelled", order.id);
        self.event_handler.on_event(ExchangeEvent::OrderCancelled {
            order_id: order.id,
            timestamp: Utc::now(),
        });
    }

    // ========================================================================
    // Settlement Lifecycle
    // ========================================================================

    /// Begin settling a trade: build this node's escrow contract and the
    /// transfer to hand to the ledger.
    pub fn start_execute(
        &self,
        transaction_id: &TransactionId,
        destination: LedgerAddress,
    ) -> ExchangeResult<(EscrowContract, TransferTemplate)> {
        let mut state = self.state.lock();
        let active = state
            .active
            .get_mut(transaction_id)
            .ok_or(ExchangeError::UnknownTransaction(*transaction_id))?;
        if active.phase == TradePhase::Broadcast {
            return Err(ExchangeError::AlreadyFinalized(*transaction_id));
        }

        let mut contract = EscrowContract::for_trade(&active.trade, Some(destination.clone()), Amount::ZERO)?;
        if contract.role == Role::Sender {
            contract.fee = self.config.network_fee;
        }
        let template = TransferTemplate {
            transaction_id: *transaction_id,
            destination,
            amount: active.trade.quantity,
            fee: contract.fee,
        };

        active.phase = TradePhase::Executing;
        debug!("Executing trade {} as {:?}", transaction_id, contract.role);
        Ok((contract, template))
    }

    /// Record the transfer that actually happened.
    ///
    /// Whatever part of the matched quantity was not transferred goes back
    /// to the local order: in place while it still rests, otherwise as a new
    /// order at the same price.
    pub fn finish_execute(
        &self,
        transaction_id: &TransactionId,
        actual: Amount,
        ledger_tx_id: LedgerTxId,
    ) -> ExchangeResult<UpdatedOrderState> {
        let update = {
            let mut state = self.state.lock();
            let active = state
                .active
                .get(transaction_id)
                .ok_or(ExchangeError::UnknownTransaction(*transaction_id))?;
            if active.phase == TradePhase::Broadcast {
                return Err(ExchangeError::AlreadyFinalized(*transaction_id));
            }
            let trade = active.trade.clone();
            if actual.is_negative() || actual > trade.quantity {
                return Err(ExchangeError::InvalidOrder(format!(
                    "executed {} outside matched quantity {}",
                    actual, trade.quantity
                )));
            }

            let shortfall = trade.quantity.checked_sub(actual)?;
            let republished = match trade.local_side() {
                Some(side) if shortfall.is_positive() => {
                    Some(self.republish(&mut state, trade.order(side), shortfall)?)
                }
                _ => None,
            };

            if let Some(active) = state.active.get_mut(transaction_id) {
                active.phase = TradePhase::Broadcast;
                active.ledger_tx_id = Some(ledger_tx_id);
                active.executed = Some(actual);
                active.republished = republished.map(|(id, _)| (id, shortfall));
            }

            UpdatedOrderState {
                transaction_id: *transaction_id,
                executed: actual,
                shortfall,
                republished,
            }
        };

        self.event_handler.on_event(ExchangeEvent::TradeExecuting {
            transaction_id: *transaction_id,
            executed_quantity: actual,
            timestamp: Utc::now(),
        });
        if update.shortfall.is_positive() {
            info!(
                "Trade {} executed {} of {}, shortfall republished",
                transaction_id,
                actual,
                update.executed.checked_add(update.shortfall)?
            );
        }
        Ok(update)
    }

    /// Give `quantity` back to the local order of a trade.
    fn republish(
        &self,
        state: &mut BookState,
        snapshot: &Order,
        quantity: Amount,
    ) -> ExchangeResult<(OrderId, Amount)> {
        let book = state.book_mut(snapshot.side);
        if book.contains(&snapshot.id) {
            let remaining = book.restore(&snapshot.id, quantity)?;
            return Ok((snapshot.id, remaining));
        }

        let mut order = Order::new(
            snapshot.side,
            Owner::Local,
            snapshot.currency.clone(),
            snapshot.price,
            quantity,
        );
        order.set_sequence(self.sequence_counter.fetch_add(1, Ordering::AcqRel) + 1);
        let id = order.id;
        book.insert(order)?;
        Ok((id, quantity))
    }

    /// Undo the book effects of a trade whose settlement failed.
    ///
    /// The resting order gets its executed quantity back (re-entering the
    /// book under its original id and priority if it had been consumed), and
    /// whatever the aggressor left on the book is removed. Unknown or
    /// already rolled back transactions are a no-op returning `None`.
    pub fn rollback(&self, transaction_id: &TransactionId) -> ExchangeResult<Option<RollbackOutcome>> {
        let outcome = {
            let mut state = self.state.lock();
            let Some(active) = state.active.remove(transaction_id) else {
                return Ok(None);
            };
            let trade = &active.trade;
            let maker = trade.resting_order();
            let aggressor = trade.aggressor_order();
            let local_side = trade.local_side();

            let mut removed = Vec::new();
            if state.withdraw(&aggressor.id).is_some() {
                removed.push(aggressor.id);
            }

            // Quantity still owed to the maker after any republished shortfall
            let mut owed = trade.quantity;
            if let Some((republished_id, shortfall)) = active.republished {
                if local_side == Some(maker.side) {
                    owed = owed.checked_sub(shortfall)?;
                    if republished_id != maker.id {
                        // Fold the separately republished shortfall back in
                        if let Some(order) = state.remove_any(&republished_id) {
                            owed = owed.checked_add(order.remaining())?;
                        }
                    }
                } else if republished_id != aggressor.id
                    && state.withdraw(&republished_id).is_some()
                {
                    removed.push(republished_id);
                }
            }

            // A cancelled maker stays gone; one consumed by matching returns
            let withdrawn = state.withdrawn.contains(&maker.id);
            let book = state.book_mut(maker.side);
            let restored = if !owed.is_positive() {
                None
            } else if book.contains(&maker.id) {
                book.restore(&maker.id, owed)?;
                Some((maker.id, owed))
            } else if !withdrawn {
                let mut order = maker.clone();
                order.set_remaining(owed);
                book.insert(order)?;
                Some((maker.id, owed))
            } else {
                debug!("Maker {} of trade {} was withdrawn", maker.id, transaction_id);
                None
            };
            state.prune_withdrawn();

            RollbackOutcome {
                transaction_id: *transaction_id,
                restored,
                removed,
            }
        };

        warn!(
            "Trade {} rolled back: restored {:?}, removed {:?}",
            transaction_id, outcome.restored, outcome.removed
        );
        self.event_handler.on_event(ExchangeEvent::TradeRolledBack {
            transaction_id: *transaction_id,
            restored: outcome.restored,
            removed: outcome.removed.clone(),
            timestamp: Utc::now(),
        });
        Ok(Some(outcome))
    }

    /// Forget a trade whose contract finalized. Returns whether it was
    /// still active.
    pub fn settle(&self, transaction_id: &TransactionId) -> bool {
        let settled = {
            let mut state = self.state.lock();
            let settled = state.active.remove(transaction_id).is_some();
            state.prune_withdrawn();
            settled
        };
        if settled {
            info!("Trade {} settled", transaction_id);
            self.event_handler.on_event(ExchangeEvent::TradeSettled {
                transaction_id: *transaction_id,
                timestamp: Utc::now(),
            });
        }
        settled
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Resting local orders in creation order
    pub fn my_orders(&self) -> Vec<Order> {
        self.state.lock().local_orders()
    }

    pub fn get_order(&self, order_id: &OrderId) -> Option<Order> {
        self.state.lock().find(order_id).cloned()
    }

    pub fn active_transaction(&self, transaction_id: &TransactionId) -> Option<ActiveTransaction> {
        self.state.lock().active.get(transaction_id).cloned()
    }

    pub fn active_transactions(&self) -> Vec<ActiveTransaction> {
        let mut active: Vec<ActiveTransaction> =
            self.state.lock().active.values().cloned().collect();
        active.sort_by_key(|tx| tx.trade.timestamp);
        active
    }

    /// Get order book snapshot for one currency
    pub fn snapshot(&self, currency: &str, depth: usize) -> ExchangeResult<OrderBookSnapshot> {
        let state = self.state.lock();
        let bids = state.book(Side::Bid).depth(currency, depth)?;
        let asks = state.book(Side::Ask).depth(currency, depth)?;
        OrderBookSnapshot::with_depth(currency.to_string(), bids, asks)
    }

    /// Total resting quantity as (bids, asks)
    pub fn book_quantities(&self) -> ExchangeResult<(Amount, Amount)> {
        let state = self.state.lock();
        Ok((state.bids.total_quantity()?, state.asks.total_quantity()?))
    }
}

impl SettlementListener for MatchingEngine {
    fn on_settled(&self, contract: &EscrowContract) -> ExchangeResult<()> {
        // Unknown after a restart; the book never saw this trade
        self.settle(&contract.transaction_id);
        Ok(())
    }

    fn on_failed(&self, contract: &EscrowContract, reason: &ExchangeError) -> ExchangeResult<()> {
        warn!("Settlement of {} failed: {}", contract.transaction_id, reason);
        self.rollback(&contract.transaction_id).map(|_| ())
    }
}
