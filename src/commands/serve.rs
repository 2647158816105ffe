//! Serve command: run embedding workers until interrupted

use crate::app::App;
use crate::error::Result;
use std::time::Duration;
use tracing::{info, warn};

/// Keep the workers running until Ctrl-C, logging queue depth now and then
pub async fn cmd_serve(app: &App, report_every: Duration) -> Result<()> {
    let workers = app.workers().map_or(0, |w| w.stats().workers);
    info!(workers, "Serving; press Ctrl-C to stop");

    let mut ticker = tokio::time::interval(report_every);
    ticker.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Could not listen for Ctrl-C");
                }
                info!("Shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                let stats = app.queue().stats().await?;
                info!(
                    pending = stats.pending,
                    claimed = stats.claimed,
                    failed = stats.failed,
                    "Queue depth"
                );
            }
        }
    }
}
