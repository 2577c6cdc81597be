//! Backend accounts and their credential sources

use std::path::PathBuf;

use common::Secret;
use serde::Deserialize;

/// How configured credential sources are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// Each source is a path to a credential JSON file.
    FilePath,
    /// Each source names an environment variable holding the credential JSON.
    #[serde(alias = "env_var")]
    EnvVarContents,
}

/// Where an account's credential material lives, resolved once at startup.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// Read when a client is configured. A missing file fails configuration,
    /// not startup.
    FilePath(PathBuf),
    /// Credential JSON captured from the environment at startup.
    InlineSecret(Secret<String>),
}

impl CredentialSource {
    /// Resolve a raw configured source according to `kind`.
    ///
    /// For `EnvVarContents` the named variable must be set and non-empty;
    /// anything else is a fatal configuration error.
    pub fn resolve(kind: CredentialKind, raw: &str) -> common::Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(common::Error::Config(
                "credential source entry is empty".into(),
            ));
        }
        match kind {
            CredentialKind::FilePath => Ok(CredentialSource::FilePath(PathBuf::from(raw))),
            CredentialKind::EnvVarContents => match std::env::var(raw) {
                Ok(contents) if !contents.trim().is_empty() => {
                    Ok(CredentialSource::InlineSecret(Secret::new(contents)))
                }
                _ => Err(common::Error::Config(format!(
                    "credential environment variable {raw} is not set"
                ))),
            },
        }
    }

    /// Label for logs; never includes secret contents.
    pub fn describe(&self) -> String {
        match self {
            CredentialSource::FilePath(path) => format!("file:{}", path.display()),
            CredentialSource::InlineSecret(_) => "inline".to_string(),
        }
    }
}

/// One backend credential/quota unit in the credential pool.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub credential: CredentialSource,
}

impl Account {
    pub fn new(id: impl Into<String>, credential: CredentialSource) -> Self {
        Self {
            id: id.into(),
            credential,
        }
    }
}
