use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::CareEngine;

/// Configuration for the background reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often to verify pending local completions (seconds).
    pub interval_secs: u64,
    /// A pending completion contradicted by the ledger for longer than
    /// this is reverted instead of retried (seconds).
    pub grace_secs: i64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            grace_secs: 300,
        }
    }
}

/// Start the overlay reconciler loop.
///
/// Each round verifies every pending local completion against the
/// ledger: confirmed entries are dropped, unsynced ones are re-issued
/// (the ledger call is idempotent), and entries contradicted past the
/// grace window are reverted with a notification so views correct
/// themselves.
///
/// Returns a CancellationToken that stops the worker when cancelled.
pub fn start(engine: Arc<CareEngine>, config: ReconcilerConfig) -> CancellationToken {
    let cancel = CancellationToken::new();

    {
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        let interval = Duration::from_secs(config.interval_secs);
        let grace = config.grace_secs;

        tokio::spawn(async move {
            info!("care reconciler started (interval={interval:?}, grace={grace}s)");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("care reconciler stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        debug!("reconciler scan");
                        match engine.reconcile_pending(grace) {
                            Ok(stats) if stats == Default::default() => {}
                            Ok(stats) => info!(
                                "reconciler: {} confirmed, {} retried, {} reverted",
                                stats.confirmed, stats.retried, stats.reverted
                            ),
                            Err(e) => error!("reconciler error: {e}"),
                        }
                    }
                }
            }
        });
    }

    cancel
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let cfg = ReconcilerConfig::default();
        assert_eq!(cfg.interval_secs, 30);
        assert_eq!(cfg.grace_secs, 300);
    }
}
