//! Fakes shared by the unit tests in this crate

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use common::Secret;
use provider::{
    Account, BoxFuture, CredentialSource, MonitorError, Translation, TranslationError, Translator,
    TranslatorFactory, UsageMonitor,
};
use state_store::MemoryStateStore;

use crate::ledger::{QuotaLimits, UsageLedger};
use crate::pool::CredentialPool;

pub fn accounts(ids: &[&str]) -> Vec<Account> {
    ids.iter()
        .map(|id| {
            Account::new(
                *id,
                CredentialSource::InlineSecret(Secret::new(format!(r#"{{"api_key":"key-{id}"}}"#))),
            )
        })
        .collect()
}

pub fn october() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
}

pub fn november() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 11, 2, 8, 30, 0).unwrap()
}

/// Translator that prefixes the target language.
pub struct StubTranslator {
    account_id: String,
}

impl Translator for StubTranslator {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn translate<'a>(
        &'a self,
        text: &'a str,
        target: &'a str,
        _source: Option<&'a str>,
    ) -> BoxFuture<'a, provider::Result<Translation>> {
        Box::pin(async move {
            Ok(Translation {
                text: format!("[{target}] {text}"),
                detected_source_language: Some("en".into()),
            })
        })
    }
}

/// Factory that fails for the listed account ids and counts configure calls.
#[derive(Default)]
pub struct StubFactory {
    failing: HashSet<String>,
    pub configured: AtomicUsize,
}

impl StubFactory {
    pub fn failing(ids: &[&str]) -> Self {
        Self {
            failing: ids.iter().map(|s| s.to_string()).collect(),
            configured: AtomicUsize::new(0),
        }
    }

    pub fn configured(&self) -> usize {
        self.configured.load(Ordering::SeqCst)
    }
}

impl TranslatorFactory for StubFactory {
    fn configure<'a>(
        &'a self,
        account: &'a Account,
    ) -> BoxFuture<'a, provider::Result<Arc<dyn Translator>>> {
        Box::pin(async move {
            self.configured.fetch_add(1, Ordering::SeqCst);
            // Yield so concurrent rotations interleave at this suspension point
            tokio::task::yield_now().await;
            if self.failing.contains(&account.id) {
                return Err(TranslationError::Credential(format!(
                    "no credential for {}",
                    account.id
                )));
            }
            let translator: Arc<dyn Translator> = Arc::new(StubTranslator {
                account_id: account.id.clone(),
            });
            Ok(translator)
        })
    }
}

/// Monitor returning canned per-account results.
#[derive(Default)]
pub struct FakeMonitor {
    usage: HashMap<String, u64>,
    not_found: HashSet<String>,
    pub queries: AtomicUsize,
}

impl FakeMonitor {
    pub fn with_usage(mut self, id: &str, used: u64) -> Self {
        self.usage.insert(id.to_string(), used);
        self
    }

    pub fn with_not_found(mut self, id: &str) -> Self {
        self.not_found.insert(id.to_string());
        self
    }
}

impl UsageMonitor for FakeMonitor {
    fn query_usage<'a>(
        &'a self,
        account: &'a Account,
        _month_start: DateTime<Utc>,
        _now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<u64, MonitorError>> {
        Box::pin(async move {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.not_found.contains(&account.id) {
                return Err(MonitorError::NotFound);
            }
            self.usage
                .get(&account.id)
                .copied()
                .ok_or_else(|| MonitorError::Http("connection refused".into()))
        })
    }
}

/// Initialized pool over a memory store.
pub async fn pool(ids: &[&str], store: Arc<MemoryStateStore>) -> Arc<CredentialPool> {
    let pool = CredentialPool::new(accounts(ids), store, Arc::new(StubFactory::default())).unwrap();
    pool.initialize().await.unwrap();
    Arc::new(pool)
}

/// Initialized ledger pinned to October 2026.
pub async fn ledger(
    pool: Arc<CredentialPool>,
    store: Arc<MemoryStateStore>,
    limits: QuotaLimits,
) -> Arc<UsageLedger> {
    let ledger = UsageLedger::new(pool, store, limits).with_clock(october);
    ledger.initialize().await.unwrap();
    Arc::new(ledger)
}
