//! Config schema: manager tuning, credential store, OAuth providers and
//! external data connections.

use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenwardConfig {
    pub manager: ManagerSettings,
    pub retry: RetrySettings,
    pub store: StoreSettings,
    pub providers: ProvidersConfig,
    /// External data connections keyed by uid.
    pub connections: HashMap<String, ConnectionConfig>,
}

/// Token lifecycle manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Tokens expiring within this many seconds are treated as stale.
    pub expiry_skew_secs: u64,
    /// Upper bound for one refresh epoch, network retries included.
    pub refresh_timeout_secs: u64,
    /// How long a caller waits on someone else's refresh. Falls back to
    /// `refresh_timeout_secs`.
    pub follower_wait_secs: Option<u64>,
    /// Attempts to persist a refreshed credential before keeping it in memory only.
    pub save_attempts: u32,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            expiry_skew_secs: 30,
            refresh_timeout_secs: 30,
            follower_wait_secs: None,
            save_attempts: 3,
        }
    }
}

impl ManagerSettings {
    pub fn follower_wait_secs(&self) -> u64 {
        self.follower_wait_secs.unwrap_or(self.refresh_timeout_secs)
    }
}

/// Retry policy for transient token endpoint failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
        }
    }
}

/// Where credentials are persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// JSON credential file. Defaults to `~/.tokenward/oauth_credentials.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// OAuth provider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider-specific settings keyed by provider id ("google", "github", ...).
    #[serde(flatten)]
    pub providers: HashMap<String, ProviderEntry>,
}

/// Configuration for a single OAuth provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEntry {
    /// Whether this provider is enabled. Defaults to true.
    pub enabled: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,

    /// RFC 7009 revocation endpoint, if the provider has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoke_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Prefer `${ENV_VAR}` here over a literal secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Per-request timeout against the token endpoint.
    pub timeout_secs: u64,
}

impl Default for ProviderEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            token_url: None,
            revoke_url: None,
            client_id: None,
            client_secret: None,
            timeout_secs: 10,
        }
    }
}

impl ProvidersConfig {
    /// Check if a provider is enabled (defaults to true if not configured).
    pub fn is_enabled(&self, name: &str) -> bool {
        self.providers.get(name).is_none_or(|e| e.enabled)
    }

    pub fn get(&self, name: &str) -> Option<&ProviderEntry> {
        self.providers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

/// Persisted configuration of one external data connection.
///
/// Only `json_data` is interpreted here: `oauthPassThru` (bool) and the
/// optional `oauthPassThruProviders` (list of provider ids).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub uid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub json_data: serde_json::Value,
}
