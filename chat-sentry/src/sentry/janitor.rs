//! Background sweep of expired admission state.
//!
//! The janitor exists to bound memory growth from long-idle keys; every read
//! path re-checks expiry itself, so decisions never depend on the sweep
//! having run. Started once at process initialization, stopped via the
//! process-wide cancellation token on graceful shutdown.

use super::Sentry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Start the recurring sweep task. The interval comes from the sentry's
/// configuration. Returns the task handle; cancelling `token` stops it.
pub fn start_janitor(sentry: Arc<Sentry>, token: CancellationToken) -> JoinHandle<()> {
    let interval = sentry.sweep_interval();
    tokio::task::spawn(async move {
        info!(
            "Janitor sweeping every {}",
            humantime::format_duration(interval)
        );
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Janitor stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    let report = sentry.sweep();
                    if report.total() > 0 {
                        debug!("Janitor evicted {} expired entries: {report:?}", report.total());
                    }
                }
            }
        }
    })
}
