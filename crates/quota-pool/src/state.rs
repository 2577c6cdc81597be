//! Persisted active-index blob shared by both pool managers

use serde::{Deserialize, Serialize};
use state_store::StateStore;
use tracing::warn;

use crate::error::Result;

/// `{ "active_index": n }`, one blob per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    pub active_index: usize,
}

/// Read a pool's state. A blob that does not parse is logged and treated as absent.
pub(crate) async fn load_pool_state(store: &dyn StateStore, key: &str) -> Result<Option<PoolState>> {
    let Some(value) = store.get_state(key).await? else {
        return Ok(None);
    };
    match serde_json::from_value::<PoolState>(value) {
        Ok(state) => Ok(Some(state)),
        Err(e) => {
            warn!(key, error = %e, "ignoring malformed pool state");
            Ok(None)
        }
    }
}

pub(crate) async fn save_pool_state(store: &dyn StateStore, key: &str, active_index: usize) -> Result<()> {
    let value = serde_json::json!({ "active_index": active_index });
    store.set_state(key, value).await?;
    Ok(())
}
