//! Credential pool and quota rotation for the translation relay
//!
//! Three layers, each holding an `Arc` to the one below:
//!
//! 1. `CredentialPool`: ordered backend accounts, the persisted active index,
//!    and the live translation client. Rotation swaps in a freshly built
//!    client under a lock and never advances more than once per
//!    threshold-crossing event.
//! 2. `UsageLedger`: per-account character counters for the current UTC
//!    month. Records usage after successful calls, rotates the credential pool
//!    when the active account reaches the rotation threshold, and reconciles
//!    against provider-reported usage.
//! 3. `IdentityPool`: bot identities. When total usage across the account
//!    pool passes the safe limit, rotates the identity and returns a
//!    `ShutdownForRotation` signal that the host process turns into a clean
//!    restart.
//!
//! Account lifecycle within a month:
//! 1. Fresh (0 used) → accumulating as calls succeed
//! 2. Rotation threshold reached → pool rotates to the next account
//! 3. Counter keeps its value while inactive; reconciliation may overwrite it
//! 4. Month rolls over → every counter resets to 0

pub mod error;
pub mod identity;
pub mod ledger;
pub mod pool;
pub mod reconcile;
mod state;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
pub use identity::{IDENTITY_POOL_STATE_KEY, Identity, IdentityCheck, IdentityPool, RotationSignal};
pub use ledger::{
    AccountUsage, Clock, QuotaLimits, RecordOutcome, ReconcileReport, USAGE_LEDGER_STATE_KEY,
    UsageCorrection, UsageLedger, UsageLedgerState, UsageSnapshot, month_key, month_start,
};
pub use pool::{ActiveClient, CREDENTIAL_POOL_STATE_KEY, CredentialPool};
pub use reconcile::spawn_reconcile_task;
pub use state::PoolState;
