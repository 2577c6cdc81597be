//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults. Bot tokens and
//! credential material never live in the TOML; tokens come from `BOT_TOKENS`
//! or `identity.tokens_file`, credentials from files or named env vars.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use common::Secret;
use provider::http::DEFAULT_TRANSLATE_URL;
use provider::monitoring::DEFAULT_MONITORING_URL;
use provider::{Account, CredentialKind, CredentialSource};
use quota_pool::{Identity, QuotaLimits};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Timeout for each provider call
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Backend accounts. `account_ids` and `credential_sources` are parallel lists.
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub account_ids: Vec<String>,
    #[serde(default)]
    pub credential_sources: Vec<String>,
    #[serde(default = "default_credential_kind")]
    pub credential_kind: CredentialKind,
    /// Filled in by `Config::load` once sources are resolved.
    #[serde(skip)]
    pub accounts: Vec<Account>,
}

#[derive(Debug, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_hard_limit")]
    pub hard_limit: u64,
    #[serde(default = "default_safety_factor")]
    pub safety_factor: f64,
    #[serde(default = "default_rotation_threshold")]
    pub rotation_threshold: u64,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct IdentityConfig {
    /// One token per line; blank lines and `#` comments are skipped
    #[serde(default)]
    pub tokens_file: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub reset_usage_on_rotation: bool,
    #[serde(skip)]
    pub tokens: Vec<Secret<String>>,
}

#[derive(Debug, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_translate_url")]
    pub translate_url: String,
    #[serde(default = "default_monitoring_url")]
    pub monitoring_url: String,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

fn default_credential_kind() -> CredentialKind {
    CredentialKind::FilePath
}

fn default_hard_limit() -> u64 {
    QuotaLimits::default().hard_limit
}

fn default_safety_factor() -> f64 {
    QuotaLimits::default().safety_factor
}

fn default_rotation_threshold() -> u64 {
    QuotaLimits::default().rotation_threshold
}

fn default_reconcile_interval() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_state_path() -> PathBuf {
    PathBuf::from("translation-relay-state.json")
}

fn default_translate_url() -> String {
    DEFAULT_TRANSLATE_URL.to_string()
}

fn default_monitoring_url() -> String {
    DEFAULT_MONITORING_URL.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            timeout_secs: default_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            account_ids: Vec::new(),
            credential_sources: Vec::new(),
            credential_kind: default_credential_kind(),
            accounts: Vec::new(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            hard_limit: default_hard_limit(),
            safety_factor: default_safety_factor(),
            rotation_threshold: default_rotation_threshold(),
            reconcile_interval_secs: default_reconcile_interval(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            tokens_file: None,
            reset_usage_on_rotation: true,
            tokens: Vec::new(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            translate_url: default_translate_url(),
            monitoring_url: default_monitoring_url(),
        }
    }
}

/// Split a comma-separated env value, dropping blanks.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn env_number<T: FromStr>(name: &str) -> common::Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| common::Error::Config(format!("{name} is not a valid number: {raw}"))),
        Err(_) => Ok(None),
    }
}

fn require_http_url(field: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {url}"
        )))
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Environment overrides:
    /// - `ACCOUNT_IDS`, `CREDENTIAL_PATHS` (file paths) or `CREDENTIAL_VARS`
    ///   (env var names); paths win when both are set
    /// - `TRANSLATION_API_LIMIT`, `TRANSLATION_API_LIMIT_SAFETY_FACTOR`,
    ///   `ACCOUNT_SWITCH_THRESHOLD`
    /// - `BOT_TOKENS` (takes precedence over `identity.tokens_file`)
    /// - `STATE_PATH`
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config.apply_env()?;
        config.validate()?;
        config.resolve_accounts()?;
        config.resolve_tokens()?;

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("translation-relay.toml")
    }

    pub fn quota_limits(&self) -> QuotaLimits {
        QuotaLimits {
            hard_limit: self.quota.hard_limit,
            safety_factor: self.quota.safety_factor,
            rotation_threshold: self.quota.rotation_threshold,
        }
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.identity
            .tokens
            .iter()
            .map(|token| Identity {
                token: token.clone(),
            })
            .collect()
    }

    fn apply_env(&mut self) -> common::Result<()> {
        if let Ok(ids) = std::env::var("ACCOUNT_IDS") {
            self.pool.account_ids = split_list(&ids);
        }
        if let Ok(paths) = std::env::var("CREDENTIAL_PATHS") {
            self.pool.credential_sources = split_list(&paths);
            self.pool.credential_kind = CredentialKind::FilePath;
        } else if let Ok(vars) = std::env::var("CREDENTIAL_VARS") {
            self.pool.credential_sources = split_list(&vars);
            self.pool.credential_kind = CredentialKind::EnvVarContents;
        }

        if let Some(limit) = env_number("TRANSLATION_API_LIMIT")? {
            self.quota.hard_limit = limit;
        }
        if let Some(factor) = env_number("TRANSLATION_API_LIMIT_SAFETY_FACTOR")? {
            self.quota.safety_factor = factor;
        }
        if let Some(threshold) = env_number("ACCOUNT_SWITCH_THRESHOLD")? {
            self.quota.rotation_threshold = threshold;
        }

        if let Ok(path) = std::env::var("STATE_PATH") {
            self.state.path = PathBuf::from(path);
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        if self.pool.account_ids.is_empty() {
            return Err(common::Error::Config(
                "no accounts configured (set pool.account_ids or ACCOUNT_IDS)".into(),
            ));
        }
        if self.pool.account_ids.len() != self.pool.credential_sources.len() {
            return Err(common::Error::Config(format!(
                "{} account ids but {} credential sources",
                self.pool.account_ids.len(),
                self.pool.credential_sources.len()
            )));
        }
        let mut seen = HashSet::new();
        for id in &self.pool.account_ids {
            if !seen.insert(id.as_str()) {
                return Err(common::Error::Config(format!("duplicate account id: {id}")));
            }
        }

        if self.quota.hard_limit == 0 {
            return Err(common::Error::Config(
                "hard_limit must be greater than 0".into(),
            ));
        }
        if !(self.quota.safety_factor > 0.0 && self.quota.safety_factor <= 1.0) {
            return Err(common::Error::Config(format!(
                "safety_factor must be in (0, 1], got: {}",
                self.quota.safety_factor
            )));
        }
        if self.quota.rotation_threshold == 0 {
            return Err(common::Error::Config(
                "rotation_threshold must be greater than 0".into(),
            ));
        }
        if self.quota.reconcile_interval_secs == 0 {
            return Err(common::Error::Config(
                "reconcile_interval_secs must be greater than 0".into(),
            ));
        }

        if self.server.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        require_http_url("translate_url", &self.provider.translate_url)?;
        require_http_url("monitoring_url", &self.provider.monitoring_url)?;
        Ok(())
    }

    fn resolve_accounts(&mut self) -> common::Result<()> {
        let kind = self.pool.credential_kind;
        let mut accounts = Vec::with_capacity(self.pool.account_ids.len());
        for (id, raw) in self.pool.account_ids.iter().zip(&self.pool.credential_sources) {
            let credential = CredentialSource::resolve(kind, raw)?;
            accounts.push(Account::new(id.clone(), credential));
        }
        self.pool.accounts = accounts;
        Ok(())
    }

    /// Token resolution order:
    /// 1. BOT_TOKENS env var (comma list)
    /// 2. tokens_file path from config
    fn resolve_tokens(&mut self) -> common::Result<()> {
        let tokens = if let Ok(raw) = std::env::var("BOT_TOKENS") {
            split_list(&raw)
        } else if let Some(ref file) = self.identity.tokens_file {
            let contents = std::fs::read_to_string(file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read tokens_file {}: {e}",
                    file.display()
                ))
            })?;
            contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_owned)
                .collect()
        } else {
            Vec::new()
        };

        if tokens.is_empty() {
            return Err(common::Error::Config(
                "no bot tokens configured (set BOT_TOKENS or identity.tokens_file)".into(),
            ));
        }
        self.identity.tokens = tokens.into_iter().map(Secret::new).collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_VARS: &[&str] = &[
        "ACCOUNT_IDS",
        "CREDENTIAL_PATHS",
        "CREDENTIAL_VARS",
        "TRANSLATION_API_LIMIT",
        "TRANSLATION_API_LIMIT_SAFETY_FACTOR",
        "ACCOUNT_SWITCH_THRESHOLD",
        "BOT_TOKENS",
        "STATE_PATH",
        "RELAY_TEST_CRED_A",
        "RELAY_TEST_CRED_B",
    ];

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    /// SAFETY: Callers must hold ENV_MUTEX.
    unsafe fn clear_env() {
        for key in ENV_VARS {
            unsafe { std::env::remove_var(key) };
        }
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("translation-relay.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn valid_toml() -> &'static str {
        r#"
[server]
listen_addr = "127.0.0.1:9300"

[pool]
account_ids = ["proj-a", "proj-b"]
credential_sources = ["/etc/relay/a.json", "/etc/relay/b.json"]
credential_kind = "file_path"

[quota]
rotation_threshold = 400000
"#
    }

    #[test]
    fn test_load_valid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe { set_env("BOT_TOKENS", "tok-1, tok-2,,") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9300);
        assert_eq!(config.server.timeout_secs, 30);
        assert_eq!(config.pool.accounts.len(), 2);
        assert_eq!(config.pool.accounts[1].id, "proj-b");
        assert_eq!(
            config.pool.accounts[0].credential.describe(),
            "file:/etc/relay/a.json"
        );
        assert_eq!(config.quota.hard_limit, 500_000);
        assert_eq!(config.quota.rotation_threshold, 400_000);
        assert_eq!(config.quota.reconcile_interval_secs, 3600);
        assert_eq!(config.quota_limits().safe_limit(), 490_000);
        assert!(config.identity.reset_usage_on_rotation);
        assert_eq!(config.identities().len(), 2);
        assert_eq!(config.identities()[1].token.expose(), "tok-2");
        assert_eq!(config.provider.translate_url, DEFAULT_TRANSLATE_URL);

        unsafe { clear_env() };
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        let result = Config::load(&path);
        assert!(matches!(result, Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe {
            set_env("ACCOUNT_IDS", "x,y,z");
            set_env("CREDENTIAL_PATHS", "/x.json,/y.json,/z.json");
            set_env("TRANSLATION_API_LIMIT", "1000");
            set_env("TRANSLATION_API_LIMIT_SAFETY_FACTOR", "0.5");
            set_env("ACCOUNT_SWITCH_THRESHOLD", "400");
            set_env("BOT_TOKENS", "tok");
            set_env("STATE_PATH", "/var/lib/relay/state.json");
        }
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pool.account_ids, vec!["x", "y", "z"]);
        assert_eq!(config.quota_limits().safe_limit(), 500);
        assert_eq!(config.quota.rotation_threshold, 400);
        assert_eq!(config.state.path, PathBuf::from("/var/lib/relay/state.json"));

        unsafe { clear_env() };
    }

    #[test]
    fn test_credential_vars_resolve_inline_secrets() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe {
            set_env("ACCOUNT_IDS", "a,b");
            set_env("CREDENTIAL_VARS", "RELAY_TEST_CRED_A,RELAY_TEST_CRED_B");
            set_env("RELAY_TEST_CRED_A", r#"{"api_key":"key-a"}"#);
            set_env("RELAY_TEST_CRED_B", r#"{"api_key":"key-b"}"#);
            set_env("BOT_TOKENS", "tok");
        }
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "");

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pool.credential_kind, CredentialKind::EnvVarContents);
        for account in &config.pool.accounts {
            assert_eq!(account.credential.describe(), "inline");
        }

        unsafe { clear_env() };
    }

    #[test]
    fn test_missing_credential_var_is_fatal() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe {
            set_env("ACCOUNT_IDS", "a");
            set_env("CREDENTIAL_VARS", "RELAY_TEST_CRED_A");
            set_env("BOT_TOKENS", "tok");
        }
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "");

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("RELAY_TEST_CRED_A"), "got: {err}");

        unsafe { clear_env() };
    }

    #[test]
    fn test_mismatched_lists_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe { set_env("BOT_TOKENS", "tok") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[pool]
account_ids = ["a", "b"]
credential_sources = ["/a.json"]
"#,
        );

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("2 account ids but 1 credential sources"));

        unsafe { clear_env() };
    }

    #[test]
    fn test_empty_pool_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe { set_env("BOT_TOKENS", "tok") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "");

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("no accounts configured"));

        unsafe { clear_env() };
    }

    #[test]
    fn test_duplicate_account_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe {
            set_env("ACCOUNT_IDS", "a,a");
            set_env("CREDENTIAL_PATHS", "/a.json,/b.json");
            set_env("BOT_TOKENS", "tok");
        }
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "");

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate account id: a"));

        unsafe { clear_env() };
    }

    #[test]
    fn test_invalid_quota_values_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe { set_env("BOT_TOKENS", "tok") };
        let dir = tempfile::tempdir().unwrap();

        for (quota, expected) in [
            ("safety_factor = 0.0", "safety_factor"),
            ("safety_factor = 1.5", "safety_factor"),
            ("hard_limit = 0", "hard_limit"),
            ("rotation_threshold = 0", "rotation_threshold"),
            ("reconcile_interval_secs = 0", "reconcile_interval_secs"),
        ] {
            let contents = format!("{}\n[quota]\n{quota}\n", valid_toml().replace("[quota]\nrotation_threshold = 400000\n", ""));
            let path = write_config(&dir, &contents);
            let err = Config::load(&path).unwrap_err();
            assert!(err.to_string().contains(expected), "{quota}: got {err}");
        }

        unsafe { clear_env() };
    }

    #[test]
    fn test_non_numeric_env_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe {
            set_env("BOT_TOKENS", "tok");
            set_env("TRANSLATION_API_LIMIT", "lots");
        }
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("TRANSLATION_API_LIMIT"));

        unsafe { clear_env() };
    }

    #[test]
    fn test_tokens_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        let dir = tempfile::tempdir().unwrap();
        let tokens_path = dir.path().join("tokens");
        std::fs::write(&tokens_path, "# primary\ntok-file-1\n\n tok-file-2 \n").unwrap();
        let contents = format!(
            "{}\n[identity]\ntokens_file = \"{}\"\nreset_usage_on_rotation = false\n",
            valid_toml(),
            tokens_path.display()
        );
        let path = write_config(&dir, &contents);

        let config = Config::load(&path).unwrap();
        let identities = config.identities();
        assert_eq!(identities.len(), 2);
        assert_eq!(identities[0].token.expose(), "tok-file-1");
        assert_eq!(identities[1].token.expose(), "tok-file-2");
        assert!(!config.identity.reset_usage_on_rotation);
    }

    #[test]
    fn test_missing_tokens_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("no bot tokens configured"));
    }

    #[test]
    fn test_bad_provider_url_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe { set_env("BOT_TOKENS", "tok") };
        let dir = tempfile::tempdir().unwrap();
        let contents = format!("{}\n[provider]\ntranslate_url = \"ftp://example\"\n", valid_toml());
        let path = write_config(&dir, &contents);

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("translate_url"));

        unsafe { clear_env() };
    }

    #[test]
    fn test_resolve_path_prefers_cli() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { std::env::remove_var("CONFIG_PATH") };
        assert_eq!(
            Config::resolve_path(Some("/etc/relay.toml")),
            PathBuf::from("/etc/relay.toml")
        );
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("translation-relay.toml")
        );
    }
}
