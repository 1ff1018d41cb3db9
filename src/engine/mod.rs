// ============================================================================
// Engine Module
// Contains the core matching engine business logic
// ============================================================================

mod matching_engine;
mod price_time;

pub use matching_engine::{
    ActiveTransaction, MatchResult, MatchingEngine, RollbackOutcome, TradePhase,
    UpdatedOrderState,
};
pub use price_time::Trades;
