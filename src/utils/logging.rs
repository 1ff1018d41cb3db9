// ============================================================================
// Logging Bootstrap
// Installs a tracing subscriber for binaries and demos
// ============================================================================

use crate::error::{ExchangeError, ExchangeResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "peer_exchange=info";

/// Install a global fmt subscriber.
///
/// `RUST_LOG` wins over `default_filter`. Fails if a subscriber is already
/// installed or the filter does not parse.
pub fn init_logging(default_filter: &str) -> ExchangeResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .map_err(|e| ExchangeError::Config(format!("bad log filter: {}", e)))?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| ExchangeError::Config(format!("logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // Other tests may have installed a subscriber first
        let _ = init_logging(DEFAULT_FILTER);
        assert!(matches!(
            init_logging(DEFAULT_FILTER),
            Err(ExchangeError::Config(_))
        ));
    }
}
