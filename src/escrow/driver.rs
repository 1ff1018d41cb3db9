// ============================================================================
// Poll Driver
// Periodically advances the registry on a tokio runtime
// ============================================================================

use super::registry::ContractRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

/// Run `poll_all` every `period` until `shutdown` turns true or its sender
/// is dropped.
///
/// Each cycle runs on the blocking pool since ledger clients may block.
pub async fn run_polling(
    registry: Arc<ContractRegistry>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting contract polling every {:?}", period);

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let registry = Arc::clone(&registry);
                match tokio::task::spawn_blocking(move || registry.poll_all()).await {
                    Ok(report) if !report.settled.is_empty() || !report.failed.is_empty() => {
                        info!(
                            "Poll cycle settled {} and rolled back {} contracts",
                            report.settled.len(),
                            report.failed.len()
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("Poll cycle panicked: {}", e),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Contract polling stopped");
}
