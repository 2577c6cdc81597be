//! Fakes and fixture builder for the relay's unit tests

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use common::Secret;
use provider::{
    Account, BoxFuture, CredentialSource, MonitorError, Translation, TranslationError, Translator,
    TranslatorFactory, UsageMonitor,
};
use quota_pool::{CredentialPool, Identity, IdentityPool, QuotaLimits, RotationSignal, UsageLedger};
use state_store::MemoryStateStore;
use tokio::sync::mpsc;

use crate::service::Relay;

/// Limits with the usual 0.98 safety factor.
pub fn limits(rotation_threshold: u64, hard_limit: u64) -> QuotaLimits {
    QuotaLimits {
        hard_limit,
        safety_factor: 0.98,
        rotation_threshold,
    }
}

/// Translator that prefixes the target language. The text `fail` makes the
/// provider return a 500.
struct StubTranslator {
    account_id: String,
    calls: Arc<AtomicUsize>,
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
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text == "fail" {
                return Err(TranslationError::Upstream {
                    status: 500,
                    body: "backend error".into(),
                });
            }
            Ok(Translation {
                text: format!("[{target}] {text}"),
                detected_source_language: Some("en".into()),
            })
        })
    }
}

/// Factory that fails for the listed account ids and counts translate calls
/// across every client it built.
#[derive(Default)]
pub struct StubFactory {
    failing: HashSet<String>,
    calls: Arc<AtomicUsize>,
}

impl StubFactory {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TranslatorFactory for StubFactory {
    fn configure<'a>(
        &'a self,
        account: &'a Account,
    ) -> BoxFuture<'a, provider::Result<Arc<dyn Translator>>> {
        Box::pin(async move {
            if self.failing.contains(&account.id) {
                return Err(TranslationError::Credential(format!(
                    "no credential for {}",
                    account.id
                )));
            }
            let translator: Arc<dyn Translator> = Arc::new(StubTranslator {
                account_id: account.id.clone(),
                calls: self.calls.clone(),
            });
            Ok(translator)
        })
    }
}

/// Monitor returning canned per-account usage; other accounts fail.
#[derive(Default)]
pub struct FakeMonitor {
    usage: HashMap<String, u64>,
}

impl FakeMonitor {
    pub fn with_usage(mut self, id: &str, used: u64) -> Self {
        self.usage.insert(id.to_string(), used);
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
            self.usage
                .get(&account.id)
                .copied()
                .ok_or_else(|| MonitorError::Http("connection refused".into()))
        })
    }
}

/// A wired relay over a memory store.
pub struct Fixture {
    pub relay: Arc<Relay>,
    pub ledger: Arc<UsageLedger>,
    pub factory: Arc<StubFactory>,
    pub rotation_rx: mpsc::Receiver<RotationSignal>,
}

impl Fixture {
    pub async fn new(ids: &[&str], limits: QuotaLimits, identities: usize) -> Self {
        Self::builder(ids, limits, identities).build().await
    }

    pub fn builder(ids: &[&str], limits: QuotaLimits, identities: usize) -> FixtureBuilder {
        FixtureBuilder {
            ids: ids.iter().map(|s| s.to_string()).collect(),
            limits,
            identities,
            failing: HashSet::new(),
            monitor: FakeMonitor::default(),
        }
    }
}

pub struct FixtureBuilder {
    ids: Vec<String>,
    limits: QuotaLimits,
    identities: usize,
    failing: HashSet<String>,
    monitor: FakeMonitor,
}

impl FixtureBuilder {
    pub fn failing(mut self, ids: &[&str]) -> Self {
        self.failing = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn monitor(mut self, monitor: FakeMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub async fn build(self) -> Fixture {
        let store = Arc::new(MemoryStateStore::new());
        let factory = Arc::new(StubFactory {
            failing: self.failing,
            calls: Arc::new(AtomicUsize::new(0)),
        });

        let accounts = self
            .ids
            .iter()
            .map(|id| {
                Account::new(
                    id.as_str(),
                    CredentialSource::InlineSecret(Secret::new(format!(
                        r#"{{"api_key":"key-{id}"}}"#
                    ))),
                )
            })
            .collect();
        let pool = CredentialPool::new(accounts, store.clone(), factory.clone()).unwrap();
        pool.initialize().await.unwrap();

        let ledger = Arc::new(UsageLedger::new(Arc::new(pool), store.clone(), self.limits));
        ledger.initialize().await.unwrap();

        let tokens = (0..self.identities)
            .map(|i| Identity::new(format!("bot-token-{i}")))
            .collect();
        let identity = IdentityPool::new(tokens, store, ledger.clone()).unwrap();
        identity.initialize().await.unwrap();

        let (tx, rotation_rx) = mpsc::channel(1);
        let relay = Arc::new(Relay::new(
            ledger.clone(),
            Arc::new(identity),
            Arc::new(self.monitor),
            tx,
        ));

        Fixture {
            relay,
            ledger,
            factory,
            rotation_rx,
        }
    }
}
