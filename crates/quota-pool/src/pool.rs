//! Credential pool: ordered backend accounts and the live translation client
//!
//! The persisted `active_index` is the source of truth for which account is
//! billed. Each rotation builds a fresh `Translator` for the new account and
//! swaps it in whole; callers holding the previous `Arc` finish their request
//! against the old account.
//!
//! Rotation is optimistic: the caller snapshots the index it observed, then
//! `rotate_from` re-reads the persisted index under a lock and only advances
//! if nobody else already moved it. N concurrent threshold crossings therefore
//! advance the pool exactly once.

use std::future::Future;
use std::sync::{Arc, RwLock};

use provider::{Account, Translator, TranslatorFactory};
use state_store::StateStore;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::state::{load_pool_state, save_pool_state};

/// State store key for the credential pool's active index.
pub const CREDENTIAL_POOL_STATE_KEY: &str = "credential_pool_state";

/// Index and client are replaced together so readers never see a client for
/// the wrong account.
struct Active {
    index: usize,
    client: Option<Arc<dyn Translator>>,
}

/// The client a request should use, leased at request start.
#[derive(Clone)]
pub struct ActiveClient {
    pub index: usize,
    pub account_id: String,
    pub translator: Arc<dyn Translator>,
}

impl std::fmt::Debug for ActiveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveClient")
            .field("index", &self.index)
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

/// Ordered, non-empty list of backend accounts with one active account.
pub struct CredentialPool {
    accounts: Vec<Account>,
    store: Arc<dyn StateStore>,
    factory: Arc<dyn TranslatorFactory>,
    state_key: String,
    active: RwLock<Active>,
    rotation_lock: Mutex<()>,
}

impl CredentialPool {
    /// Create a pool over `accounts`. Nothing is read or configured until
    /// `initialize` runs.
    pub fn new(
        accounts: Vec<Account>,
        store: Arc<dyn StateStore>,
        factory: Arc<dyn TranslatorFactory>,
    ) -> Result<Self> {
        if accounts.is_empty() {
            return Err(Error::Configuration(
                "credential pool needs at least one account".into(),
            ));
        }
        info!(accounts = accounts.len(), "credential pool created");
        Ok(Self {
            accounts,
            store,
            factory,
            state_key: CREDENTIAL_POOL_STATE_KEY.to_string(),
            active: RwLock::new(Active {
                index: 0,
                client: None,
            }),
            rotation_lock: Mutex::new(()),
        })
    }

    /// Restore the active index and configure the client for it.
    ///
    /// A missing blob starts at 0 and is persisted. An index past the end of
    /// the list (accounts were removed from config) wraps modulo the pool
    /// size. A client that fails to configure leaves the pool uninitialized
    /// rather than failing startup.
    pub async fn initialize(&self) -> Result<()> {
        let _guard = self.rotation_lock.lock().await;
        let n = self.accounts.len();

        let index = match load_pool_state(self.store.as_ref(), &self.state_key).await? {
            Some(state) if state.active_index < n => state.active_index,
            Some(state) => {
                let wrapped = state.active_index % n;
                warn!(
                    stored = state.active_index,
                    accounts = n,
                    active_index = wrapped,
                    "persisted credential index out of range, wrapping"
                );
                save_pool_state(self.store.as_ref(), &self.state_key, wrapped).await?;
                wrapped
            }
            None => {
                info!("no persisted credential pool state, starting at first account");
                save_pool_state(self.store.as_ref(), &self.state_key, 0).await?;
                0
            }
        };

        let client = self.configure(index).await;
        self.swap(index, client);
        info!(
            active_index = index,
            account_id = %self.accounts[index].id,
            initialized = self.is_initialized(),
            "credential pool initialized"
        );
        Ok(())
    }

    /// Account currently billed for requests.
    pub fn get_active_account(&self) -> &Account {
        &self.accounts[self.active_index()]
    }

    pub fn active_index(&self) -> usize {
        self.read_active().0
    }

    /// True once a client is configured for the active account.
    pub fn is_initialized(&self) -> bool {
        self.read_active().1.is_some()
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn account_ids(&self) -> Vec<String> {
        self.accounts.iter().map(|a| a.id.clone()).collect()
    }

    pub fn index_of(&self, account_id: &str) -> Option<usize> {
        self.accounts.iter().position(|a| a.id == account_id)
    }

    /// Lease the active client for one request.
    pub fn current_client(&self) -> Result<ActiveClient> {
        let (index, client) = self.read_active();
        let account_id = self.accounts[index].id.clone();
        match client {
            Some(translator) => Ok(ActiveClient {
                index,
                account_id,
                translator,
            }),
            None => Err(Error::NotInitialized(account_id)),
        }
    }

    /// Advance to the next account, wrapping at the end of the list.
    ///
    /// The index is observed when this is called, not when the future is
    /// first polled, so a batch of calls issued together against the same
    /// index advances the pool once. Returns the id of the account active
    /// afterwards.
    pub fn rotate_active_account(&self) -> impl Future<Output = Result<String>> + Send + '_ {
        let observed = self.active_index();
        self.rotate_from(observed)
    }

    /// Advance past `observed` unless the pool has already moved on.
    ///
    /// Persists the new index before swapping the client. If the new client
    /// fails to configure the rotation still stands and the pool reports
    /// `NotInitialized` until the next successful rotation or restart.
    pub async fn rotate_from(&self, observed: usize) -> Result<String> {
        let _guard = self.rotation_lock.lock().await;
        let n = self.accounts.len();

        let current = match load_pool_state(self.store.as_ref(), &self.state_key).await {
            Ok(Some(state)) => state.active_index % n,
            Ok(None) => self.active_index(),
            Err(e) => {
                warn!(error = %e, "failed to re-read credential pool state, using in-memory index");
                self.active_index()
            }
        };

        if current != observed {
            info!(
                observed,
                active_index = current,
                "credential pool already rotated, skipping"
            );
            if current != self.active_index() {
                // Another writer moved the persisted index; follow it
                let client = self.configure(current).await;
                self.swap(current, client);
            }
            return Ok(self.accounts[current].id.clone());
        }

        let next = (current + 1) % n;
        save_pool_state(self.store.as_ref(), &self.state_key, next).await?;
        let client = self.configure(next).await;
        self.swap(next, client);

        metrics::counter!("relay_account_rotations_total").increment(1);
        warn!(
            from = %self.accounts[current].id,
            to = %self.accounts[next].id,
            active_index = next,
            "rotated credential account"
        );
        Ok(self.accounts[next].id.clone())
    }

    /// Pool summary for the health endpoint.
    pub fn health(&self) -> serde_json::Value {
        let (index, client) = self.read_active();
        let accounts: Vec<serde_json::Value> = self
            .accounts
            .iter()
            .enumerate()
            .map(|(i, a)| {
                serde_json::json!({
                    "id": a.id,
                    "credential": a.credential.describe(),
                    "active": i == index,
                })
            })
            .collect();

        serde_json::json!({
            "status": if client.is_some() { "healthy" } else { "unhealthy" },
            "accounts_total": self.accounts.len(),
            "active_index": index,
            "active_account": self.accounts[index].id,
            "accounts": accounts,
        })
    }

    async fn configure(&self, index: usize) -> Option<Arc<dyn Translator>> {
        let account = &self.accounts[index];
        match self.factory.configure(account).await {
            Ok(client) => Some(client),
            Err(e) => {
                error!(
                    account_id = %account.id,
                    credential = %account.credential.describe(),
                    error = %e,
                    "failed to configure translation client"
                );
                None
            }
        }
    }

    fn read_active(&self) -> (usize, Option<Arc<dyn Translator>>) {
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        (active.index, active.client.clone())
    }

    fn swap(&self, index: usize, client: Option<Arc<dyn Translator>>) {
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        *active = Active { index, client };
    }
}
