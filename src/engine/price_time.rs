// ============================================================================
// Price/Time Priority Matching (FIFO)
// Crosses one incoming order against the opposite side of the book
// ============================================================================

use crate::domain::{Order, OrderBook, Side, Trade};
use crate::error::ExchangeResult;
use smallvec::SmallVec;

/// Trades produced by one incoming order; most orders hit one or two makers.
pub type Trades = SmallVec<[Trade; 4]>;

/// Match `incoming` against `opposite` until it is filled or nothing
/// tradable crosses.
///
/// Resting orders are taken in book priority (best price, then creation
/// sequence) among those in the same currency whose owner may trade with
/// the incoming owner. Every trade executes at the resting order's price.
///
/// # Example
/// ```text
/// Book:  ask 100 @ 1.0 (A, seq 1)
///        ask 100 @ 2.0 (B, seq 2)
///
/// Incoming: bid 110 @ 1.5
/// Result: 1.0 with A at 100, then 0.5 with B at 100
/// ```
pub(crate) fn match_order(incoming: &mut Order, opposite: &mut OrderBook) -> ExchangeResult<Trades> {
    let mut trades = Trades::new();

    while incoming.remaining().is_positive() {
        let maker = match opposite.best_match(|resting| {
            resting.currency == incoming.currency
                && incoming.crosses(resting.price)
                && incoming.owner.can_trade_with(&resting.owner)
        }) {
            Some(maker) => maker.clone(),
            None => break,
        };

        let quantity = incoming.remaining().min(maker.remaining());

        // Snapshots are taken before either side is filled
        let (buy_order, sell_order) = match incoming.side {
            Side::Bid => (incoming.clone(), maker.clone()),
            Side::Ask => (maker.clone(), incoming.clone()),
        };

        opposite.fill(&maker.id, quantity)?;
        incoming.fill(quantity)?;

        trades.push(Trade::new(
            buy_order,
            sell_order,
            maker.price,
            quantity,
            incoming.side,
        ));
    }

    Ok(trades)
}
