//! Error types for pool and ledger operations

/// Errors from pool and ledger operations.
///
/// Rotation of the identity pool is not an error; it is reported through
/// `IdentityCheck::ShutdownForRotation`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Fatal at startup: empty pool or unusable configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The active account's client failed to configure.
    #[error("translation client not initialized for account {0}")]
    NotInitialized(String),

    #[error("account not in pool: {0}")]
    UnknownAccount(String),

    #[error("state store error: {0}")]
    State(#[from] state_store::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
