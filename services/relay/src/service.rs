//! Translation flow over the quota core
//!
//! `Relay` ties the three pool layers to one request:
//! limit check → lease client → provider call → record usage → identity check.
//! Usage is recorded only after the provider call succeeds. A request
//! rejected at the limit check runs the identity check, since the whole pool
//! is exhausted at that point. An identity rotation is sent to the run loop,
//! which stops the process so a supervisor restarts it under the new
//! identity.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use provider::{Translation, UsageMonitor};
use quota_pool::{
    CredentialPool, IdentityCheck, IdentityPool, ReconcileReport, RotationSignal, UsageLedger,
    UsageSnapshot,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;

/// Shared request-path state.
pub struct Relay {
    pool: Arc<CredentialPool>,
    ledger: Arc<UsageLedger>,
    identity: Arc<IdentityPool>,
    monitor: Arc<dyn UsageMonitor>,
    rotation_tx: mpsc::Sender<RotationSignal>,
    started_at: Instant,
    translations_total: AtomicU64,
    errors_total: AtomicU64,
}

impl Relay {
    pub fn new(
        ledger: Arc<UsageLedger>,
        identity: Arc<IdentityPool>,
        monitor: Arc<dyn UsageMonitor>,
        rotation_tx: mpsc::Sender<RotationSignal>,
    ) -> Self {
        Self {
            pool: ledger.pool().clone(),
            ledger,
            identity,
            monitor,
            rotation_tx,
            started_at: Instant::now(),
            translations_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
        }
    }

    /// Translate `text` on the active account and account for it.
    pub async fn translate(
        &self,
        text: &str,
        target: &str,
        source: Option<&str>,
    ) -> Result<Translation, RelayError> {
        let result = self.translate_inner(text, target, source).await;
        match &result {
            Ok(_) => self.translations_total.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.errors_total.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    async fn translate_inner(
        &self,
        text: &str,
        target: &str,
        source: Option<&str>,
    ) -> Result<Translation, RelayError> {
        if text.trim().is_empty() {
            return Err(RelayError::InvalidRequest("text must not be empty".into()));
        }
        if target.trim().is_empty() {
            return Err(RelayError::InvalidRequest(
                "target language must not be empty".into(),
            ));
        }

        let chars = text.chars().count() as u64;
        if self.ledger.check_limit_exceeded(chars).await {
            warn!(chars, "translation rejected, monthly limit reached");
            self.check_identity().await;
            return Err(RelayError::LimitReached);
        }

        let lease = self.pool.current_client()?;
        let translation = match lease.translator.translate(text, target, source).await {
            Ok(t) => t,
            Err(e) => {
                let class = e.classification();
                warn!(
                    account_id = %lease.account_id,
                    error = %e,
                    error_type = class.label(),
                    "translation call failed"
                );
                crate::metrics::record_upstream_error(class.label());
                return Err(e.into());
            }
        };

        match self.ledger.record_usage_for(&lease, chars).await {
            Ok(outcome) => {
                if let Some(to) = outcome.rotated_to {
                    info!(from = %outcome.account_id, to = %to, "credential account rotated");
                }
            }
            Err(e) => {
                error!(account_id = %lease.account_id, chars, error = %e, "failed to record usage");
            }
        }

        self.check_identity().await;
        Ok(translation)
    }

    /// Run the identity check, forwarding a rotation to the run loop.
    pub async fn check_identity(&self) -> Option<RotationSignal> {
        match self.identity.get_active_identity_or_rotate().await {
            Ok(IdentityCheck::Active(_)) => None,
            Ok(IdentityCheck::ShutdownForRotation(signal)) => {
                self.request_restart(signal);
                Some(signal)
            }
            Err(e) => {
                error!(error = %e, "identity check failed");
                None
            }
        }
    }

    fn request_restart(&self, signal: RotationSignal) {
        crate::metrics::set_rotation_requested();
        match self.rotation_tx.try_send(signal) {
            Ok(()) => warn!(%signal, "identity rotated, requesting restart"),
            Err(TrySendError::Full(_)) => debug!(%signal, "restart already requested"),
            Err(TrySendError::Closed(_)) => {
                error!(%signal, "run loop is gone, cannot request restart")
            }
        }
    }

    pub async fn usage(&self) -> Result<UsageSnapshot, RelayError> {
        Ok(self.ledger.snapshot().await?)
    }

    pub async fn reset_usage(&self) -> Result<(), RelayError> {
        self.ledger.reset_usage().await?;
        info!("usage counters reset by operator");
        Ok(())
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport, RelayError> {
        Ok(self.ledger.reconcile_with_provider(self.monitor.as_ref()).await?)
    }

    /// Operator-requested credential rotation. Returns the new active account.
    pub async fn rotate_account(&self) -> Result<String, RelayError> {
        let active = self.ledger.rotate_active_account().await?;
        info!(account_id = %active, "credential account rotated by operator");
        Ok(active)
    }

    /// Health summary and whether the relay can serve translations.
    pub fn health(&self) -> (bool, serde_json::Value) {
        let healthy = self.pool.is_initialized();
        let body = serde_json::json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "active_account": self.pool.get_active_account().id,
            "active_identity_index": self.identity.active_index(),
            "identities_total": self.identity.identities_total(),
            "pool": self.pool.health(),
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "translations_served": self.translations_total.load(Ordering::Relaxed),
            "errors_total": self.errors_total.load(Ordering::Relaxed),
        });
        (healthy, body)
    }
}
