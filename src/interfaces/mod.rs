// ============================================================================
// Interfaces Module
// Contains the collaborator traits the exchange core talks to
// ============================================================================

mod event_handler;
pub mod ledger;
mod settlement;
pub mod store;
pub mod transport;

pub use event_handler::{
    ChannelEventHandler, EventHandler, ExchangeEvent, LoggingEventHandler, NoOpEventHandler,
};
pub use ledger::{
    InMemoryLedger, LedgerAddress, LedgerClient, LedgerError, LedgerStatus, LedgerTxId,
    TransferTemplate,
};
pub use settlement::{NoOpSettlementListener, SettlementListener};
#[cfg(feature = "serde")]
pub use store::JsonFileStore;
pub use store::{DurableStore, InMemoryStore, StoreError};
pub use transport::{
    MatchNotice, NoOpTransport, PeerMessage, RecordingTransport, Transport, TransportError,
};
