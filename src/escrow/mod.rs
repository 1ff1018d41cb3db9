// ============================================================================
// Escrow Module
// Settlement contracts and the registry that polls them
// ============================================================================

pub mod contract;
#[cfg(feature = "async")]
pub mod driver;
pub mod record;
pub mod registry;

pub use contract::{ContractState, EscrowContract, Observation, PollStep, Role};
pub use record::ContractRecord;
pub use registry::{ContractRegistry, PollReport};

#[cfg(feature = "async")]
pub use driver::run_polling;
