// ============================================================================
// Exchange Configuration
// Tradable currencies and settlement policy for one node
// ============================================================================

use crate::error::{ExchangeError, ExchangeResult};
use crate::numeric::Amount;
use rust_decimal::Decimal;
use std::collections::BTreeSet;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Ledger confirmations required before an escrow contract settles.
pub const REQUIRED_CONFIRMATIONS: u32 = 6;

/// Poll cycles a contract may go without seeing its ledger transaction.
pub const DEFAULT_MAX_UNCONFIRMED_POLLS: u32 = 60;

/// Upper bound, in poll cycles, of the backoff after ledger failures.
pub const DEFAULT_MAX_BACKOFF_POLLS: u32 = 16;

/// Configuration shared by the matching engine and the contract registry
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ExchangeConfig {
    /// Fiat currency symbols orders may be placed in (e.g. "EUR", "USD")
    pub currencies: BTreeSet<String>,

    /// Confirmations on the current chain tip needed to settle
    pub required_confirmations: u32,

    /// Poll cycles without observing the ledger transaction before a
    /// contract fails with a confirmation timeout
    pub max_unconfirmed_polls: u32,

    /// Cap on the exponential backoff applied after ledger errors
    pub max_backoff_polls: u32,

    /// Network fee attached to every outgoing settlement transfer
    pub network_fee: Amount,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            currencies: BTreeSet::new(),
            required_confirmations: REQUIRED_CONFIRMATIONS,
            max_unconfirmed_polls: DEFAULT_MAX_UNCONFIRMED_POLLS,
            max_backoff_polls: DEFAULT_MAX_BACKOFF_POLLS,
            network_fee: Amount::ZERO,
        }
    }
}

impl ExchangeConfig {
    /// Create a configuration trading the given currencies with default
    /// settlement policy
    pub fn new<I, S>(currencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            currencies: currencies.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Builder method: Add a tradable currency
    pub fn with_currency(mut self, symbol: impl Into<String>) -> Self {
        self.currencies.insert(symbol.into());
        self
    }

    /// Builder method: Set required confirmations
    pub fn with_required_confirmations(mut self, confirmations: u32) -> Self {
        self.required_confirmations = confirmations;
        self
    }

    /// Builder method: Set the confirmation observation window
    pub fn with_max_unconfirmed_polls(mut self, polls: u32) -> Self {
        self.max_unconfirmed_polls = polls;
        self
    }

    /// Builder method: Set the ledger backoff cap
    pub fn with_max_backoff_polls(mut self, polls: u32) -> Self {
        self.max_backoff_polls = polls;
        self
    }

    /// Builder method: Set the network fee
    pub fn with_network_fee(mut self, fee: Amount) -> Self {
        self.network_fee = fee;
        self
    }

    pub fn is_known_currency(&self, symbol: &str) -> bool {
        self.currencies.contains(symbol)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ExchangeResult<()> {
        if self.currencies.is_empty() {
            return Err(ExchangeError::Config(
                "at least one currency must be configured".to_string(),
            ));
        }

        if self.currencies.iter().any(|symbol| symbol.trim().is_empty()) {
            return Err(ExchangeError::Config(
                "currency symbols cannot be empty".to_string(),
            ));
        }

        if self.required_confirmations == 0 {
            return Err(ExchangeError::Config(
                "required confirmations must be positive".to_string(),
            ));
        }

        if self.max_unconfirmed_polls == 0 {
            return Err(ExchangeError::Config(
                "observation window must be at least one poll".to_string(),
            ));
        }

        if self.network_fee.is_negative() {
            return Err(ExchangeError::Config(
                "network fee cannot be negative".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse and validate a JSON configuration document
    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> ExchangeResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| ExchangeError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Preset Configurations (Factory Methods)
// ============================================================================

impl ExchangeConfig {
    /// Bitcoin against the major fiat currencies
    /// - 6 confirmations
    /// - 10 000 satoshi network fee
    pub fn bitcoin_fiat() -> Self {
        Self::new(["EUR", "USD", "GBP", "CHF"])
            .with_network_fee(Amount::from_decimal(Decimal::new(1, 4))) // 0.0001 BTC
    }
}
