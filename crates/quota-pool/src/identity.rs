//! Identity pool: the bot login, rotated when the whole account pool is spent
//!
//! Same optimistic-then-verify rotation as the credential pool, one level up.
//! An identity cannot be swapped inside a running process, so rotation is
//! reported as `IdentityCheck::ShutdownForRotation` and the host exits for a
//! supervisor to restart it under the new identity.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::Secret;
use state_store::StateStore;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::ledger::UsageLedger;
use crate::state::{load_pool_state, save_pool_state};

/// State store key for the identity pool's active index.
pub const IDENTITY_POOL_STATE_KEY: &str = "identity_pool_state";

/// One bot login.
#[derive(Debug, Clone)]
pub struct Identity {
    pub token: Secret<String>,
}

impl Identity {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Secret::new(token.into()),
        }
    }
}

/// Old and new identity index of a rotation, for logging at the exit point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationSignal {
    pub from_index: usize,
    pub to_index: usize,
}

impl fmt::Display for RotationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "identity rotated from index {} to {}",
            self.from_index, self.to_index
        )
    }
}

/// Outcome of checking the identity against total pool usage.
#[derive(Debug, Clone)]
pub enum IdentityCheck {
    /// Keep running with this identity.
    Active(Identity),
    /// The host must shut down and restart under the new identity.
    ShutdownForRotation(RotationSignal),
}

/// Ordered, non-empty list of identities with one active.
pub struct IdentityPool {
    identities: Vec<Identity>,
    store: Arc<dyn StateStore>,
    ledger: Arc<UsageLedger>,
    active_index: AtomicUsize,
    reset_usage_on_rotation: bool,
    /// Signal of the rotation this process is waiting to restart for.
    pending: Mutex<Option<RotationSignal>>,
}

impl IdentityPool {
    pub fn new(
        identities: Vec<Identity>,
        store: Arc<dyn StateStore>,
        ledger: Arc<UsageLedger>,
    ) -> Result<Self> {
        if identities.is_empty() {
            return Err(Error::Configuration(
                "identity pool needs at least one token".into(),
            ));
        }
        Ok(Self {
            identities,
            store,
            ledger,
            active_index: AtomicUsize::new(0),
            reset_usage_on_rotation: true,
            pending: Mutex::new(None),
        })
    }

    /// Whether an identity rotation zeroes the usage ledger (default true).
    pub fn with_reset_usage_on_rotation(mut self, reset: bool) -> Self {
        self.reset_usage_on_rotation = reset;
        self
    }

    pub async fn initialize(&self) -> Result<()> {
        let mut pending = self.pending.lock().await;
        *pending = None;
        let n = self.identities.len();

        let index = match load_pool_state(self.store.as_ref(), IDENTITY_POOL_STATE_KEY).await? {
            Some(state) if state.active_index < n => state.active_index,
            Some(state) => {
                let wrapped = state.active_index % n;
                warn!(
                    stored = state.active_index,
                    identities = n,
                    active_index = wrapped,
                    "persisted identity index out of range, wrapping"
                );
                save_pool_state(self.store.as_ref(), IDENTITY_POOL_STATE_KEY, wrapped).await?;
                wrapped
            }
            None => {
                save_pool_state(self.store.as_ref(), IDENTITY_POOL_STATE_KEY, 0).await?;
                0
            }
        };

        self.active_index.store(index, Ordering::SeqCst);
        info!(identities = n, active_index = index, "identity pool initialized");
        Ok(())
    }

    pub fn get_active_identity(&self) -> &Identity {
        &self.identities[self.active_index()]
    }

    pub fn active_index(&self) -> usize {
        self.active_index.load(Ordering::SeqCst)
    }

    pub fn identities_total(&self) -> usize {
        self.identities.len()
    }

    /// Return the active identity, or rotate it if total usage across the
    /// account pool has passed the safe limit.
    ///
    /// The index is observed at call time. Callers racing on the same
    /// exhaustion all get a shutdown signal, but the persisted index advances
    /// once. After a rotation every later check returns the same signal
    /// without touching the store, until the process restarts. A single
    /// identity rotates to itself.
    pub fn get_active_identity_or_rotate(
        &self,
    ) -> impl Future<Output = Result<IdentityCheck>> + Send + '_ {
        let observed = self.active_index();
        self.check_from(observed)
    }

    async fn check_from(&self, observed: usize) -> Result<IdentityCheck> {
        if let Some(signal) = *self.pending.lock().await {
            return Ok(IdentityCheck::ShutdownForRotation(signal));
        }
        if !self.ledger.check_limit_exceeded(0).await {
            return Ok(IdentityCheck::Active(self.identities[observed].clone()));
        }

        let mut pending = self.pending.lock().await;
        if let Some(signal) = *pending {
            return Ok(IdentityCheck::ShutdownForRotation(signal));
        }
        let n = self.identities.len();

        let current = match load_pool_state(self.store.as_ref(), IDENTITY_POOL_STATE_KEY).await? {
            Some(state) => state.active_index % n,
            None => self.active_index(),
        };

        if current != observed {
            info!(
                observed,
                active_index = current,
                "identity already rotated, requesting shutdown"
            );
            self.active_index.store(current, Ordering::SeqCst);
            let signal = RotationSignal {
                from_index: observed,
                to_index: current,
            };
            *pending = Some(signal);
            return Ok(IdentityCheck::ShutdownForRotation(signal));
        }

        let next = (current + 1) % n;
        save_pool_state(self.store.as_ref(), IDENTITY_POOL_STATE_KEY, next).await?;
        self.active_index.store(next, Ordering::SeqCst);

        if self.reset_usage_on_rotation
            && let Err(e) = self.ledger.reset_usage().await
        {
            error!(error = %e, "failed to reset usage after identity rotation");
        }

        metrics::counter!("relay_identity_rotations_total").increment(1);
        warn!(
            from_index = current,
            to_index = next,
            "account pool exhausted, rotated identity"
        );
        let signal = RotationSignal {
            from_index: current,
            to_index: next,
        };
        *pending = Some(signal);
        Ok(IdentityCheck::ShutdownForRotation(signal))
    }
}
