// ============================================================================
// Domain Models Module
// Contains all core domain entities and value objects
// ============================================================================

pub mod config;
pub mod order;
pub mod order_book;
pub mod trade;

pub use config::{ExchangeConfig, REQUIRED_CONFIRMATIONS};
pub use order::{Order, OrderId, Owner, PeerId, Side};
pub use order_book::{OrderBook, OrderBookSnapshot, SymbolOrders};
pub use trade::{Trade, TransactionId};
