//! File-backed state store
//!
//! Keeps all blobs in a single JSON object file. Every write rewrites the
//! whole file through a temp file + rename so a crash mid-write leaves the
//! previous state intact. A tokio Mutex serializes writers; the in-memory map
//! is the read path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::{StateStore, StoreFuture};

/// JSON file holding every persisted blob, keyed by name.
pub struct FileStateStore {
    path: PathBuf,
    state: Mutex<HashMap<String, serde_json::Value>>,
}

impl FileStateStore {
    /// Load state from the given file path.
    ///
    /// A missing file is a cold start: it is created as `{}` so every pool
    /// starts at index 0 and the ledger starts a fresh month.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading state file: {e}")))?;
            let blobs: HashMap<String, serde_json::Value> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing state file: {e}")))?;
            info!(path = %path.display(), keys = blobs.len(), "loaded persisted state");
            blobs
        } else {
            info!(path = %path.display(), "state file not found, starting with empty state");
            let blobs = HashMap::new();
            write_atomic(&path, &blobs).await?;
            blobs
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names of all stored blobs.
    pub async fn keys(&self) -> Vec<String> {
        self.state.lock().await.keys().cloned().collect()
    }
}

impl StateStore for FileStateStore {
    fn get_state<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<serde_json::Value>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.get(key).cloned())
        })
    }

    fn set_state<'a>(&'a self, key: &'a str, value: serde_json::Value) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let previous = state.insert(key.to_string(), value);
            if let Err(e) = write_atomic(&self.path, &state).await {
                // Keep memory consistent with disk when the write fails
                match previous {
                    Some(v) => state.insert(key.to_string(), v),
                    None => state.remove(key),
                };
                return Err(e);
            }
            debug!(key, "persisted state blob");
            Ok(())
        })
    }
}

/// Write the blob map to `path` atomically with 0600 permissions.
async fn write_atomic(path: &Path, data: &HashMap<String, serde_json::Value>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing state: {e}")))?;

    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        Some(_) => Path::new("."),
        None => return Err(Error::Io("state path has no parent directory".into())),
    };

    let tmp_path = dir.join(format!(".state.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp state file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting state file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp state file: {e}")))?;

    debug!(path = %path.display(), "wrote state file");
    Ok(())
}
