//! Credential material for the HTTP clients
//!
//! The credential document is a JSON object with an `api_key` and an optional
//! `project_id`. It is read from the account's `CredentialSource` each time a
//! client is configured, so a rotated key file is picked up on the next
//! rotation without a restart.

use common::Secret;
use serde::Deserialize;
use tracing::debug;

use crate::account::{Account, CredentialSource};

#[derive(Deserialize)]
struct RawMaterial {
    #[serde(default)]
    project_id: Option<String>,
    api_key: String,
}

/// Parsed credential document for one account.
#[derive(Debug, Clone)]
pub struct CredentialMaterial {
    /// Cloud project the usage metric lives under. Falls back to the account id.
    pub project_id: Option<String>,
    pub api_key: Secret<String>,
}

impl CredentialMaterial {
    /// Parse a credential JSON document.
    pub fn parse(json: &str) -> Result<Self, String> {
        let raw: RawMaterial =
            serde_json::from_str(json).map_err(|e| format!("parsing credential JSON: {e}"))?;
        if raw.api_key.trim().is_empty() {
            return Err("credential api_key is empty".into());
        }
        Ok(Self {
            project_id: raw.project_id.filter(|p| !p.trim().is_empty()),
            api_key: Secret::new(raw.api_key),
        })
    }

    /// Load the material for an account from its credential source.
    pub async fn load(account: &Account) -> Result<Self, String> {
        match &account.credential {
            CredentialSource::FilePath(path) => {
                let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
                    format!("reading credential file {}: {e}", path.display())
                })?;
                debug!(account_id = %account.id, path = %path.display(), "loaded credential file");
                Self::parse(&contents)
            }
            CredentialSource::InlineSecret(secret) => Self::parse(secret.expose()),
        }
    }

    /// Project to query for usage metrics.
    pub fn project_for<'a>(&'a self, account: &'a Account) -> &'a str {
        self.project_id.as_deref().unwrap_or(&account.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parse_with_project() {
        let m = CredentialMaterial::parse(r#"{"project_id":"relay-1","api_key":"k1"}"#).unwrap();
        assert_eq!(m.project_id.as_deref(), Some("relay-1"));
        assert_eq!(m.api_key.expose(), "k1");
    }

    #[test]
    fn parse_rejects_missing_or_empty_key() {
        assert!(CredentialMaterial::parse(r#"{"project_id":"p"}"#).is_err());
        assert!(CredentialMaterial::parse(r#"{"api_key":"  "}"#).is_err());
        assert!(CredentialMaterial::parse("not json").is_err());
    }

    #[test]
    fn project_falls_back_to_account_id() {
        let m = CredentialMaterial::parse(r#"{"api_key":"k"}"#).unwrap();
        let account = Account::new("acct-7", CredentialSource::InlineSecret(Secret::new(String::new())));
        assert_eq!(m.project_for(&account), "acct-7");
    }

    #[tokio::test]
    async fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acct.json");
        tokio::fs::write(&path, r#"{"api_key":"from-file"}"#).await.unwrap();
        let account = Account::new("a", CredentialSource::FilePath(path));
        let m = CredentialMaterial::load(&account).await.unwrap();
        assert_eq!(m.api_key.expose(), "from-file");
    }

    #[tokio::test]
    async fn load_missing_file_fails() {
        let account = Account::new(
            "a",
            CredentialSource::FilePath(PathBuf::from("/nonexistent/relay/acct.json")),
        );
        let err = CredentialMaterial::load(&account).await.unwrap_err();
        assert!(err.contains("reading credential file"), "got: {err}");
    }
}
