//! Caller authentication configuration.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use duration_str::deserialize_option_duration;
use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

/// Authentication settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Token granting the proxy-admin role without a credential store lookup.
    pub master_key: Option<SecretString>,
    /// JWT validation against a JWKS endpoint.
    pub jwt: Option<JwtConfig>,
    /// Role based route access.
    pub rbac: Option<RbacConfig>,
    /// Virtual keys served by the built-in credential store.
    pub keys: Vec<VirtualKeyConfig>,
    /// Team budgets and block flags.
    pub teams: Vec<TeamConfig>,
    /// Organization budgets.
    pub organizations: Vec<OrganizationConfig>,
}

/// JWT validation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JwtConfig {
    /// The JWKS URL of the identity provider.
    pub jwks_url: Url,
    /// Polling interval for JWKS updates.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub poll_interval: Option<Duration>,
    /// Expected issuer (iss claim).
    pub expected_issuer: Option<String>,
    /// Expected audience (aud claim).
    pub expected_audience: Option<String>,
}

/// Role based access control. Maps a role name (`proxy_admin`, `team`,
/// `internal_user`) to the route prefixes it may call.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RbacConfig {
    /// Allowed route prefixes per role. A role without an entry is denied everything.
    pub roles: BTreeMap<String, Vec<String>>,
}

/// A virtual key and the principal data attached to it.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualKeyConfig {
    /// The plaintext key. Only its SHA-256 fingerprint is kept in memory.
    pub key: SecretString,
    /// Human readable name, usable in guardrail attachments.
    pub alias: Option<String>,
    /// Owning user.
    pub user_id: Option<String>,
    /// Owning team.
    pub team_id: Option<String>,
    /// Owning organization.
    pub org_id: Option<String>,
    /// Whether the key is blocked.
    #[serde(default)]
    pub blocked: bool,
    /// Spend already accumulated by the key, in USD.
    #[serde(default)]
    pub spend: f64,
    /// Spend cap in USD.
    pub max_budget: Option<f64>,
    /// Spend already accumulated per model.
    #[serde(default)]
    pub model_spend: BTreeMap<String, f64>,
    /// Spend cap per model.
    #[serde(default)]
    pub model_max_budget: BTreeMap<String, f64>,
    /// Models the key may call. Empty allows every model.
    #[serde(default)]
    pub allowed_models: BTreeSet<String>,
    /// Cache-control directives the key may send.
    #[serde(default)]
    pub allowed_cache_controls: BTreeSet<String>,
    /// Guardrail policies applied to the key.
    #[serde(default)]
    pub policies: Vec<String>,
    /// Individual guardrails applied to the key in addition to its policies.
    #[serde(default)]
    pub guardrails: Vec<String>,
    /// Tags attached to every request made with the key.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Requests per minute.
    pub rpm_limit: Option<u64>,
    /// Tokens per minute.
    pub tpm_limit: Option<u64>,
    /// Concurrent in-flight requests.
    pub max_parallel_requests: Option<u64>,
    /// Request class weight used by the saturation throttle. Zero or less is never throttled.
    #[serde(default)]
    pub priority: i64,
}

/// Team budget settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TeamConfig {
    /// Team identifier.
    pub id: String,
    /// Whether every key of the team is blocked.
    #[serde(default)]
    pub blocked: bool,
    /// Spend already accumulated by the team, in USD.
    #[serde(default)]
    pub spend: f64,
    /// Spend cap in USD.
    pub max_budget: Option<f64>,
}

/// Organization budget settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrganizationConfig {
    /// Organization identifier.
    pub id: String,
    /// Spend already accumulated by the organization, in USD.
    #[serde(default)]
    pub spend: f64,
    /// Spend cap in USD.
    pub max_budget: Option<f64>,
}
