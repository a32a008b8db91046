use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";
pub const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Batching and pacing for the mailbox listing. The defaults are tuned for
/// Gmail's per-user quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPolicy {
    pub initial_batch_size: usize,
    pub subsequent_batch_size: usize,
    pub max_total: usize,
    pub prefetch_delay: Duration,
    pub metadata_concurrency: usize,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            initial_batch_size: 15,
            subsequent_batch_size: 30,
            max_total: 120,
            prefetch_delay: Duration::from_secs(2),
            metadata_concurrency: 10,
        }
    }
}

/// Application-wide settings. Defaults, then an optional TOML file, then env vars.
#[derive(Debug, Clone)]
pub struct AppDefaults {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub api_base_url: String,
    pub auth_url: String,
    pub token_url: String,
    pub request_timeout: Duration,
    pub account: String,
    pub policy: SyncPolicy,
}

impl Default for AppDefaults {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            account: "default".to_string(),
            policy: SyncPolicy::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    client_id: Option<String>,
    client_secret: Option<String>,
    api_base_url: Option<String>,
    auth_url: Option<String>,
    token_url: Option<String>,
    request_timeout_secs: Option<u64>,
    account: Option<String>,
    sync: FileSyncPolicy,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSyncPolicy {
    initial_batch_size: Option<usize>,
    subsequent_batch_size: Option<usize>,
    max_total: Option<usize>,
    prefetch_delay_ms: Option<u64>,
    metadata_concurrency: Option<usize>,
}

impl AppDefaults {
    pub fn load() -> Result<Self> {
        let mut defaults = Self::default();
        if let Some(path) = config_file_path() {
            if path.exists() {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                defaults.apply_toml(&raw)?;
            }
        }
        defaults.apply_env(|key| env::var(key).ok());
        defaults.validate()?;
        Ok(defaults)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut defaults = Self::default();
        defaults.apply_toml(raw)?;
        defaults.validate()?;
        Ok(defaults)
    }

    fn apply_toml(&mut self, raw: &str) -> Result<()> {
        let file: FileConfig = toml::from_str(raw).context("parsing config TOML")?;

        if file.client_id.is_some() {
            self.client_id = file.client_id;
        }
        if file.client_secret.is_some() {
            self.client_secret = file.client_secret;
        }
        if let Some(url) = file.api_base_url {
            self.api_base_url = url;
        }
        if let Some(url) = file.auth_url {
            self.auth_url = url;
        }
        if let Some(url) = file.token_url {
            self.token_url = url;
        }
        if let Some(secs) = file.request_timeout_secs {
            self.request_timeout = Duration::from_secs(secs);
        }
        if let Some(account) = file.account {
            self.account = account;
        }

        let sync = file.sync;
        if let Some(n) = sync.initial_batch_size {
            self.policy.initial_batch_size = n;
        }
        if let Some(n) = sync.subsequent_batch_size {
            self.policy.subsequent_batch_size = n;
        }
        if let Some(n) = sync.max_total {
            self.policy.max_total = n;
        }
        if let Some(ms) = sync.prefetch_delay_ms {
            self.policy.prefetch_delay = Duration::from_millis(ms);
        }
        if let Some(n) = sync.metadata_concurrency {
            self.policy.metadata_concurrency = n;
        }
        Ok(())
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("GOOGLE_CLIENT_ID") {
            self.client_id = Some(id);
        }
        if let Some(secret) = lookup("GOOGLE_CLIENT_SECRET") {
            self.client_secret = Some(secret);
        }
        if let Some(url) = lookup("POSTBOX_API_BASE_URL") {
            self.api_base_url = url;
        }
        if let Some(url) = lookup("POSTBOX_TOKEN_URL") {
            self.token_url = url;
        }
        if let Some(account) = lookup("POSTBOX_ACCOUNT") {
            self.account = account;
        }
        if let Some(secs) = parse_env(&lookup, "POSTBOX_REQUEST_TIMEOUT_SECS") {
            self.request_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_env(&lookup, "POSTBOX_INITIAL_BATCH") {
            self.policy.initial_batch_size = n;
        }
        if let Some(n) = parse_env(&lookup, "POSTBOX_SUBSEQUENT_BATCH") {
            self.policy.subsequent_batch_size = n;
        }
        if let Some(n) = parse_env(&lookup, "POSTBOX_MAX_TOTAL") {
            self.policy.max_total = n;
        }
        if let Some(ms) = parse_env(&lookup, "POSTBOX_PREFETCH_DELAY_MS") {
            self.policy.prefetch_delay = Duration::from_millis(ms);
        }
    }

    fn validate(&self) -> Result<()> {
        let policy = &self.policy;
        if policy.initial_batch_size == 0 || policy.subsequent_batch_size == 0 {
            anyhow::bail!("batch sizes must be greater than zero");
        }
        if policy.metadata_concurrency == 0 {
            anyhow::bail!("metadata_concurrency must be greater than zero");
        }
        if self.request_timeout.is_zero() {
            anyhow::bail!("request timeout must be greater than zero");
        }
        Ok(())
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key).and_then(|s| s.trim().parse::<T>().ok())
}

/// `$POSTBOX_CONFIG`, else `<config dir>/postbox/config.toml`.
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("POSTBOX_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("postbox").join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_provider_tuning() {
        let defaults = AppDefaults::default();
        assert_eq!(defaults.policy.initial_batch_size, 15);
        assert_eq!(defaults.policy.subsequent_batch_size, 30);
        assert_eq!(defaults.policy.max_total, 120);
        assert_eq!(defaults.policy.prefetch_delay, Duration::from_secs(2));
        assert_eq!(defaults.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let raw = r#"
            client_id = "abc.apps.googleusercontent.com"
            request_timeout_secs = 10

            [sync]
            max_total = 60
            prefetch_delay_ms = 250
        "#;
        let defaults = AppDefaults::from_toml_str(raw).unwrap();
        assert_eq!(
            defaults.client_id.as_deref(),
            Some("abc.apps.googleusercontent.com")
        );
        assert_eq!(defaults.request_timeout, Duration::from_secs(10));
        assert_eq!(defaults.policy.max_total, 60);
        assert_eq!(defaults.policy.prefetch_delay, Duration::from_millis(250));
        assert_eq!(defaults.policy.initial_batch_size, 15);
        assert_eq!(defaults.api_base_url, DEFAULT_API_BASE_URL);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let raw = "[sync]\ninitial_batch_size = 0\n";
        assert!(AppDefaults::from_toml_str(raw).is_err());
    }

    #[test]
    fn env_wins_over_file_and_ignores_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("GOOGLE_CLIENT_ID", "env-id"),
            ("POSTBOX_MAX_TOTAL", "90"),
            ("POSTBOX_INITIAL_BATCH", "not-a-number"),
        ]);
        let mut defaults = AppDefaults::from_toml_str("client_id = \"file-id\"").unwrap();
        defaults.apply_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(defaults.client_id.as_deref(), Some("env-id"));
        assert_eq!(defaults.policy.max_total, 90);
        assert_eq!(defaults.policy.initial_batch_size, 15);
    }
}
