// ============================================================================
// Peer Exchange Library
// Peer-to-peer order matching with escrowed ledger settlement
// ============================================================================

//! # Peer Exchange
//!
//! Matching and settlement core for a decentralized exchange where each node
//! keeps its own book of local and remote orders, trading a cryptocurrency
//! against fiat currencies.
//!
//! ## Features
//!
//! - **Price/time priority matching** with execution at the resting price
//! - **Escrow contracts** that watch settlement transfers until they confirm
//! - **Crash recovery** from a durable store of pending contracts
//! - **Compensation** that puts failed trades back on the book
//!
//! ## Example
//!
//! ```rust
//! use peer_exchange::prelude::*;
//! use std::sync::Arc;
//!
//! let exchange = Exchange::new(
//!     ExchangeConfig::new(["EUR"]),
//!     Arc::new(InMemoryLedger::new()),
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(NoOpTransport),
//!     Arc::new(NoOpEventHandler),
//!     LedgerAddress::new("bc1qreceive"),
//! )?;
//!
//! // Offer one coin at 25 000 EUR
//! let result = exchange.submit_order(
//!     Side::Ask,
//!     "EUR",
//!     Amount::from_integer(25_000),
//!     Amount::ONE,
//! )?;
//! assert!(result.trades.is_empty());
//! assert_eq!(exchange.engine().my_orders().len(), 1);
//! # Ok::<(), ExchangeError>(())
//! ```

pub mod domain;
pub mod engine;
pub mod error;
pub mod escrow;
pub mod exchange;
pub mod interfaces;
pub mod numeric;
pub mod utils;

pub use error::{ExchangeError, ExchangeResult};
pub use exchange::Exchange;

// Re-exports for convenience
pub mod prelude {
    pub use crate::domain::{
        ExchangeConfig, Order, OrderBookSnapshot, OrderId, Owner, PeerId, Side, Trade,
        TransactionId,
    };
    pub use crate::engine::{MatchResult, MatchingEngine, RollbackOutcome, TradePhase};
    pub use crate::error::{ExchangeError, ExchangeResult};
    pub use crate::escrow::{ContractRegistry, ContractState, EscrowContract, PollReport, Role};
    pub use crate::exchange::Exchange;
    pub use crate::interfaces::{
        DurableStore, EventHandler, ExchangeEvent, InMemoryLedger, InMemoryStore,
        LedgerAddress, LedgerClient, LedgerTxId, LoggingEventHandler, NoOpEventHandler,
        NoOpTransport, PeerMessage, SettlementListener, Transport,
    };
    pub use crate::numeric::Amount;
}
