//! Periodic reconciliation of local usage with the provider
//!
//! Local counters drift from what the provider bills (calls that failed after
//! being billed, usage from other clients of the same account, restarts that
//! lost an unpersisted write). The task replaces every drifted counter with
//! the provider's value once per interval and runs independently of the
//! request path.

use std::sync::Arc;
use std::time::Duration;

use provider::UsageMonitor;
use tracing::{error, info};

use crate::ledger::UsageLedger;

/// Spawn a background task that reconciles the ledger every `interval`.
///
/// Errors are logged and the loop keeps going; the next tick retries.
pub fn spawn_reconcile_task(
    ledger: Arc<UsageLedger>,
    monitor: Arc<dyn UsageMonitor>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; the ledger was just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            reconcile_cycle(&ledger, monitor.as_ref()).await;
        }
    })
}

async fn reconcile_cycle(ledger: &UsageLedger, monitor: &dyn UsageMonitor) {
    info!("running scheduled usage reconciliation");
    match ledger.reconcile_with_provider(monitor).await {
        Ok(report) if report.failed_accounts.is_empty() => {}
        Ok(report) => {
            info!(
                failed = ?report.failed_accounts,
                "reconciliation incomplete, failed accounts retried next cycle"
            );
        }
        Err(e) => error!(error = %e, "usage reconciliation failed"),
    }
}
