//! Remote collaborators of the quota core: translation and usage monitoring
//!
//! Defines the traits that decouple the credential pool from the concrete
//! translation backend. A `TranslatorFactory` builds one immutable
//! `Translator` per account; the pool swaps whole clients on rotation instead
//! of mutating credentials in place. A `UsageMonitor` reports the provider's
//! authoritative character count for reconciliation.
//!
//! The `http` and `monitoring` modules implement the traits against the
//! Google Cloud Translation v2 REST API and the Cloud Monitoring time series
//! API.

pub mod account;
pub mod classify;
pub mod credentials;
pub mod http;
pub mod monitoring;

pub use account::{Account, CredentialKind, CredentialSource};
pub use classify::classify_status;
pub use credentials::CredentialMaterial;
pub use http::{HttpTranslator, HttpTranslatorFactory};
pub use monitoring::HttpUsageMonitor;

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Classification of upstream errors, used for logging and metric labels.
///
/// The core never retries on its own; callers decide what to do with each class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Timeouts, 5xx, connection errors
    Transient,
    /// Provider-side quota exhausted for the account
    QuotaExceeded,
    /// Invalid credentials or a request the provider will never accept
    Permanent,
}

impl ErrorClassification {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::Transient => "transient",
            ErrorClassification::QuotaExceeded => "quota_exceeded",
            ErrorClassification::Permanent => "permanent",
        }
    }
}

/// Result of a translation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub text: String,
    pub detected_source_language: Option<String>,
}

/// Errors from configuring a client or calling the translation API.
#[derive(Debug, thiserror::Error)]
pub enum TranslationError {
    #[error("credential error: {0}")]
    Credential(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("upstream returned no translations")]
    EmptyResponse,
}

impl TranslationError {
    pub fn classification(&self) -> ErrorClassification {
        match self {
            TranslationError::Credential(_) => ErrorClassification::Permanent,
            TranslationError::Http(_) | TranslationError::EmptyResponse => {
                ErrorClassification::Transient
            }
            TranslationError::Upstream { status, body } => classify_status(*status, body),
        }
    }
}

/// Errors from the usage monitoring API.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// No usage metric exists for the account this month. Treated as zero usage.
    #[error("usage metric not found")]
    NotFound,

    #[error("credential error: {0}")]
    Credential(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("monitoring API returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("malformed monitoring response: {0}")]
    Parse(String),
}

/// Result alias for translation operations.
pub type Result<T> = std::result::Result<T, TranslationError>;

/// Boxed future returned by the dyn-compatible traits below.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A configured translation client bound to exactly one account.
pub trait Translator: Send + Sync {
    /// Account this client bills against.
    fn account_id(&self) -> &str;

    /// Translate `text` into `target`. `source` of `None` asks the provider to detect it.
    fn translate<'a>(
        &'a self,
        text: &'a str,
        target: &'a str,
        source: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Translation>>;
}

/// Builds a fresh `Translator` for an account.
///
/// Fails when the account's credential cannot be read or parsed; the pool
/// then reports itself as not initialized.
pub trait TranslatorFactory: Send + Sync {
    fn configure<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<Arc<dyn Translator>>>;
}

/// Authoritative per-account usage as recorded by the provider.
pub trait UsageMonitor: Send + Sync {
    /// Characters billed to `account` between `month_start` and `now`.
    fn query_usage<'a>(
        &'a self,
        account: &'a Account,
        month_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, std::result::Result<u64, MonitorError>>;
}
