//! Secret manager configuration.

use std::time::Duration;

use duration_str::deserialize_duration;
use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

/// Secret manager configuration. Any string value of the form
/// `secret:<backend>/<path>` is resolved through the named backend at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecretsConfig {
    /// How long a resolved secret is cached.
    #[serde(deserialize_with = "deserialize_duration")]
    pub cache_ttl: Duration,
    /// HashiCorp Vault KV v2 backend.
    pub vault: Option<VaultConfig>,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(86_400),
            vault: None,
        }
    }
}

/// HashiCorp Vault settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultConfig {
    /// Vault server address.
    pub address: Url,
    /// Vault token. `VAULT_TOKEN` is used when omitted.
    pub token: Option<SecretString>,
    /// KV v2 mount.
    #[serde(default = "default_mount")]
    pub mount: String,
    /// Vault enterprise namespace.
    pub namespace: Option<String>,
}

fn default_mount() -> String {
    "secret".to_string()
}
