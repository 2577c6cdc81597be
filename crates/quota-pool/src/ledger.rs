//! Per-account character usage for the current UTC month
//!
//! The ledger owns the `usage_ledger` blob. Counters only grow within a month,
//! except when reconciliation overwrites them with the provider's value. When
//! the wall-clock month differs from the stored month every counter resets to
//! zero, once.
//!
//! Recording usage is the only trigger for credential rotation: when the
//! account that served a call reaches `rotation_threshold`, the ledger asks
//! the pool to rotate away from the index that call was leased at.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Datelike, Utc};
use provider::{MonitorError, UsageMonitor};
use serde::{Deserialize, Serialize};
use state_store::StateStore;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::pool::{ActiveClient, CredentialPool};

/// State store key for the usage ledger.
pub const USAGE_LEDGER_STATE_KEY: &str = "usage_ledger";

/// Source of "now" for month handling. `Utc::now` outside tests.
pub type Clock = fn() -> DateTime<Utc>;

/// Monthly quota configuration shared by every account in the pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaLimits {
    /// Provider quota per account per month, in characters.
    pub hard_limit: u64,
    /// Fraction of `hard_limit` considered safe to use, in (0, 1].
    pub safety_factor: f64,
    /// Per-account count at which the credential pool rotates.
    pub rotation_threshold: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            hard_limit: 500_000,
            safety_factor: 0.98,
            rotation_threshold: 490_000,
        }
    }
}

impl QuotaLimits {
    pub fn safe_limit(&self) -> u64 {
        (self.hard_limit as f64 * self.safety_factor).floor() as u64
    }
}

/// Persisted ledger blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLedgerState {
    /// `YYYY-MM` in UTC. Empty when a stored blob had no month.
    #[serde(default)]
    pub month: String,
    #[serde(default)]
    pub usage_by_account: BTreeMap<String, u64>,
}

/// Result of recording usage for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub account_id: String,
    /// The account's count after this call.
    pub used: u64,
    /// Account active after a threshold crossing, when it differs from
    /// `account_id`.
    pub rotated_to: Option<String>,
}

/// One counter overwritten by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageCorrection {
    pub account_id: String,
    pub local: u64,
    pub provider: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub corrections: Vec<UsageCorrection>,
    /// Accounts whose provider query failed; their counters were left alone.
    pub failed_accounts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountUsage {
    pub account_id: String,
    pub characters: u64,
}

/// Point-in-time view of the ledger for the usage endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub month: String,
    pub active_account_id: String,
    pub active_account_characters: u64,
    pub rotation_threshold: u64,
    pub active_account_percent: f64,
    pub total_characters: u64,
    /// Safe limit times the number of accounts.
    pub total_limit: u64,
    pub total_percent: f64,
    pub hard_limit: u64,
    pub safe_limit: u64,
    pub accounts: Vec<AccountUsage>,
}

/// `YYYY-MM` for `now` in UTC.
pub fn month_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// Midnight UTC on the first day of `now`'s month.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .with_day(1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(now)
}

fn percent(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    (used as f64 / limit as f64 * 10_000.0).round() / 100.0
}

/// Per-account, per-month character counters over a credential pool.
pub struct UsageLedger {
    pool: Arc<CredentialPool>,
    store: Arc<dyn StateStore>,
    limits: QuotaLimits,
    clock: Clock,
    state: Mutex<UsageLedgerState>,
    active_account_id: RwLock<String>,
}

impl UsageLedger {
    pub fn new(pool: Arc<CredentialPool>, store: Arc<dyn StateStore>, limits: QuotaLimits) -> Self {
        let active = pool.get_active_account().id.clone();
        Self {
            pool,
            store,
            limits,
            clock: Utc::now,
            state: Mutex::new(UsageLedgerState::default()),
            active_account_id: RwLock::new(active),
        }
    }

    /// Replace the wall clock, for deterministic month handling.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    /// Cache the active account and load persisted counters.
    pub async fn initialize(&self) -> Result<()> {
        self.set_active(self.pool.get_active_account().id.clone());
        self.reload().await?;
        let state = self.state.lock().await;
        info!(
            month = %state.month,
            active_account = %self.active_account_id(),
            total = state.usage_by_account.values().sum::<u64>(),
            "usage ledger initialized"
        );
        Ok(())
    }

    /// Re-read the persisted blob, resetting on month rollover.
    ///
    /// A missing or malformed blob starts the current month at zero without
    /// writing. Counters for accounts no longer in the pool are dropped.
    pub async fn reload(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.reload_locked(&mut state).await
    }

    async fn reload_locked(&self, state: &mut UsageLedgerState) -> Result<()> {
        let current = month_key((self.clock)());

        let stored = match self.store.get_state(USAGE_LEDGER_STATE_KEY).await? {
            Some(value) => match serde_json::from_value::<UsageLedgerState>(value) {
                Ok(stored) => Some(stored),
                Err(e) => {
                    warn!(error = %e, "ignoring malformed usage ledger, starting from zero");
                    None
                }
            },
            None => None,
        };

        let Some(stored) = stored else {
            *state = self.zeroed(current);
            return Ok(());
        };

        let month = if stored.month.is_empty() {
            current.clone()
        } else {
            stored.month
        };

        if month != current {
            info!(from = %month, to = %current, "new month detected, resetting usage counters");
            return self.reset_locked(state, current).await;
        }

        let mut adopted = self.zeroed(current);
        for (id, used) in stored.usage_by_account {
            match adopted.usage_by_account.get_mut(&id) {
                Some(slot) => *slot = used,
                None => debug!(account_id = %id, "dropping usage for account not in pool"),
            }
        }
        *state = adopted;
        Ok(())
    }

    pub async fn characters_used(&self, account_id: &str) -> u64 {
        let state = self.state.lock().await;
        state.usage_by_account.get(account_id).copied().unwrap_or(0)
    }

    pub async fn total_characters_used(&self) -> u64 {
        self.state.lock().await.usage_by_account.values().sum()
    }

    pub async fn current_month(&self) -> String {
        self.state.lock().await.month.clone()
    }

    pub fn active_account_id(&self) -> String {
        self.active_account_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn safe_limit(&self) -> u64 {
        self.limits.safe_limit()
    }

    pub fn rotation_threshold(&self) -> u64 {
        self.limits.rotation_threshold
    }

    /// True if total usage across the pool plus `additional` would pass the
    /// safe limit. Counters from a month that has already ended count as zero.
    pub async fn check_limit_exceeded(&self, additional: u64) -> bool {
        let state = self.state.lock().await;
        let total = if state.month == month_key((self.clock)()) {
            state.usage_by_account.values().sum::<u64>()
        } else {
            0
        };
        total.saturating_add(additional) > self.limits.safe_limit()
    }

    /// Record usage against the cached active account.
    pub async fn record_usage(&self, char_count: u64) -> Result<RecordOutcome> {
        let account_id = self.active_account_id();
        let index = self
            .pool
            .index_of(&account_id)
            .ok_or_else(|| Error::UnknownAccount(account_id.clone()))?;
        self.record(&account_id, index, char_count).await
    }

    /// Record usage against the account a call was actually made with.
    ///
    /// Rotation triggered here advances away from `lease.index` only, so a
    /// call that finishes after another already rotated the pool does not
    /// rotate it again.
    pub async fn record_usage_for(&self, lease: &ActiveClient, char_count: u64) -> Result<RecordOutcome> {
        if self.pool.index_of(&lease.account_id) != Some(lease.index) {
            return Err(Error::UnknownAccount(lease.account_id.clone()));
        }
        self.record(&lease.account_id, lease.index, char_count).await
    }

    async fn record(&self, account_id: &str, index: usize, char_count: u64) -> Result<RecordOutcome> {
        let used = {
            let mut state = self.state.lock().await;
            let current = month_key((self.clock)());
            if state.month != current {
                info!(from = %state.month, to = %current, "new month detected while recording, resetting usage counters");
                self.reset_locked(&mut state, current).await?;
            }

            let slot = state
                .usage_by_account
                .entry(account_id.to_string())
                .or_insert(0);
            *slot = slot.saturating_add(char_count);
            let used = *slot;

            if let Err(e) = self.persist(&state).await {
                warn!(account_id, error = %e, "failed to persist usage ledger, keeping count in memory");
            }
            used
        };

        metrics::counter!("relay_characters_recorded_total", "account" => account_id.to_string())
            .increment(char_count);
        metrics::gauge!("relay_account_usage_characters", "account" => account_id.to_string())
            .set(used as f64);

        let threshold = self.limits.rotation_threshold;
        info!(account_id, chars = char_count, used, threshold, "recorded usage");

        let mut rotated_to = None;
        if used >= threshold {
            warn!(account_id, used, threshold, "rotation threshold reached");
            match self.pool.rotate_from(index).await {
                Ok(active) => {
                    self.set_active(active.clone());
                    if active != account_id {
                        rotated_to = Some(active);
                    }
                }
                Err(e) => {
                    error!(account_id, error = %e, "credential rotation failed after threshold");
                }
            }
        }

        Ok(RecordOutcome {
            account_id: account_id.to_string(),
            used,
            rotated_to,
        })
    }

    /// Zero every pool account for the current month and persist.
    pub async fn reset_usage(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let current = month_key((self.clock)());
        self.reset_locked(&mut state, current).await
    }

    async fn reset_locked(&self, state: &mut UsageLedgerState, month: String) -> Result<()> {
        let fresh = self.zeroed(month);
        self.persist(&fresh).await?;
        *state = fresh;
        info!(month = %state.month, "usage counters reset");
        Ok(())
    }

    /// Rotate the credential pool outside of a threshold crossing and follow it.
    pub async fn rotate_active_account(&self) -> Result<String> {
        let active = self.pool.rotate_active_account().await?;
        self.set_active(active.clone());
        Ok(active)
    }

    /// Overwrite local counters with provider-reported usage.
    ///
    /// The provider is queried without holding the ledger lock, so usage
    /// recorded meanwhile is replaced by the provider's value. `NotFound` is
    /// zero usage; other monitor errors leave that account's counter as is.
    pub async fn reconcile_with_provider(&self, monitor: &dyn UsageMonitor) -> Result<ReconcileReport> {
        self.reload().await?;

        let now = (self.clock)();
        let month = month_key(now);
        let start = month_start(now);

        let mut observed = Vec::with_capacity(self.pool.accounts().len());
        let mut failed_accounts = Vec::new();
        for account in self.pool.accounts() {
            match monitor.query_usage(account, start, now).await {
                Ok(used) => observed.push((account.id.clone(), used)),
                Err(MonitorError::NotFound) => {
                    debug!(account_id = %account.id, "no provider usage this month, treating as zero");
                    observed.push((account.id.clone(), 0));
                }
                Err(e) => {
                    error!(account_id = %account.id, error = %e, "failed to query provider usage");
                    failed_accounts.push(account.id.clone());
                }
            }
        }

        let mut state = self.state.lock().await;
        if state.month != month {
            warn!(month = %state.month, queried = %month, "month changed during reconciliation, discarding results");
            return Ok(ReconcileReport {
                corrections: Vec::new(),
                failed_accounts,
            });
        }

        let mut corrections = Vec::new();
        for (account_id, provider) in observed {
            let local = state.usage_by_account.get(&account_id).copied().unwrap_or(0);
            if local == provider {
                debug!(account_id = %account_id, used = local, "usage in sync with provider");
                continue;
            }
            warn!(account_id = %account_id, local, provider, "usage drift detected, adopting provider count");
            state.usage_by_account.insert(account_id.clone(), provider);
            metrics::counter!("relay_usage_drift_corrections_total", "account" => account_id.clone())
                .increment(1);
            metrics::gauge!("relay_account_usage_characters", "account" => account_id.clone())
                .set(provider as f64);
            corrections.push(UsageCorrection {
                account_id,
                local,
                provider,
            });
        }

        if corrections.is_empty() {
            info!(failed = failed_accounts.len(), "reconciliation complete, no drift");
        } else {
            self.persist(&state).await?;
            info!(
                corrected = corrections.len(),
                failed = failed_accounts.len(),
                "reconciliation complete, corrected usage persisted"
            );
        }

        Ok(ReconcileReport {
            corrections,
            failed_accounts,
        })
    }

    /// Reload and summarize current usage.
    pub async fn snapshot(&self) -> Result<UsageSnapshot> {
        let mut state = self.state.lock().await;
        self.reload_locked(&mut state).await?;

        let active_account_id = self.active_account_id();
        let active_account_characters = state
            .usage_by_account
            .get(&active_account_id)
            .copied()
            .unwrap_or(0);
        let total_characters: u64 = state.usage_by_account.values().sum();
        let safe_limit = self.limits.safe_limit();
        let total_limit = safe_limit.saturating_mul(self.pool.accounts().len() as u64);
        let accounts = self
            .pool
            .accounts()
            .iter()
            .map(|a| AccountUsage {
                account_id: a.id.clone(),
                characters: state.usage_by_account.get(&a.id).copied().unwrap_or(0),
            })
            .collect();

        Ok(UsageSnapshot {
            month: state.month.clone(),
            active_account_percent: percent(active_account_characters, self.limits.rotation_threshold),
            active_account_id,
            active_account_characters,
            rotation_threshold: self.limits.rotation_threshold,
            total_characters,
            total_limit,
            total_percent: percent(total_characters, total_limit),
            hard_limit: self.limits.hard_limit,
            safe_limit,
            accounts,
        })
    }

    fn zeroed(&self, month: String) -> UsageLedgerState {
        UsageLedgerState {
            month,
            usage_by_account: self.pool.accounts().iter().map(|a| (a.id.clone(), 0)).collect(),
        }
    }

    async fn persist(&self, state: &UsageLedgerState) -> Result<()> {
        let value = serde_json::to_value(state)
            .map_err(|e| state_store::Error::Parse(format!("serializing usage ledger: {e}")))?;
        self.store.set_state(USAGE_LEDGER_STATE_KEY, value).await?;
        Ok(())
    }

    fn set_active(&self, account_id: String) {
        *self
            .active_account_id
            .write()
            .unwrap_or_else(|e| e.into_inner()) = account_id;
    }
}
