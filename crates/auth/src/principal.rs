use std::collections::BTreeSet;
use std::fmt;

use rate_limit::{BudgetSnapshot, PrincipalLimits};

/// Role of an authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Holder of the master key or of the admin scope. Bypasses ownership checks.
    ProxyAdmin,
    /// A key or token bound to a team.
    Team,
    /// Everyone else.
    InternalUser,
}

impl Role {
    /// The name used in configuration and claims.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::ProxyAdmin => "proxy_admin",
            Role::Team => "team",
            Role::InternalUser => "internal_user",
        }
    }

    /// Parse a `role` claim. Unknown values yield `None`.
    pub fn from_claim(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().replace('-', "_").as_str() {
            "proxy_admin" => Some(Role::ProxyAdmin),
            "team" => Some(Role::Team),
            "internal_user" => Some(Role::InternalUser),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Principal data returned by a credential store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenInfo {
    /// Owning user.
    pub user_id: Option<String>,
    /// Owning team.
    pub team_id: Option<String>,
    /// Owning organization.
    pub org_id: Option<String>,
    /// Key name usable in guardrail attachments.
    pub key_alias: Option<String>,
    /// The key or its team is blocked.
    pub blocked: bool,
    /// Spend and caps of the key, its team and its organization.
    pub budget: BudgetSnapshot,
    /// Rate limits.
    pub limits: PrincipalLimits,
    /// Callable models. Empty allows all.
    pub allowed_models: BTreeSet<String>,
    /// Cache-control directives the caller may send.
    pub allowed_cache_controls: BTreeSet<String>,
    /// Guardrail policy names.
    pub policies: Vec<String>,
    /// Extra guardrail names.
    pub guardrails: Vec<String>,
    /// Tags of every request made with the key.
    pub tags: Vec<String>,
}

/// The authenticated caller of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    /// SHA-256 hex digest of the token.
    pub fingerprint: String,
    /// Role of the caller.
    pub role: Role,
    /// Principal data.
    pub info: TokenInfo,
}

impl Principal {
    /// The master key holder.
    pub fn admin(fingerprint: String) -> Self {
        Self {
            fingerprint,
            role: Role::ProxyAdmin,
            info: TokenInfo::default(),
        }
    }

    /// A principal resolved from the credential store.
    pub fn from_token_info(fingerprint: String, info: TokenInfo) -> Self {
        let role = if info.team_id.is_some() {
            Role::Team
        } else {
            Role::InternalUser
        };

        Self { fingerprint, role, info }
    }

    /// Whether the caller is a proxy admin.
    pub fn is_admin(&self) -> bool {
        self.role == Role::ProxyAdmin
    }

    /// First eight hex characters of the fingerprint, the only form of the key used in metrics.
    pub fn api_key_hash(&self) -> &str {
        self.fingerprint.get(..8).unwrap_or("_none")
    }

    /// Owning user, empty when unknown.
    pub fn user_id(&self) -> &str {
        self.info.user_id.as_deref().unwrap_or_default()
    }

    /// Owning team, empty when unknown.
    pub fn team_id(&self) -> &str {
        self.info.team_id.as_deref().unwrap_or_default()
    }

    /// Whether the principal may call the model.
    pub fn can_call_model(&self, model: &str) -> bool {
        self.is_admin() || self.info.allowed_models.is_empty() || self.info.allowed_models.contains(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_claims() {
        assert_eq!(Role::from_claim("proxy_admin"), Some(Role::ProxyAdmin));
        assert_eq!(Role::from_claim("Internal-User"), Some(Role::InternalUser));
        assert_eq!(Role::from_claim("team"), Some(Role::Team));
        assert_eq!(Role::from_claim("superuser"), None);
    }

    #[test]
    fn store_role_follows_team() {
        let info = TokenInfo {
            team_id: Some("finance".to_string()),
            ..Default::default()
        };

        let principal = Principal::from_token_info("ab".repeat(32), info);
        assert_eq!(principal.role, Role::Team);
        assert_eq!(principal.api_key_hash(), "abababab");

        let principal = Principal::from_token_info("cd".repeat(32), TokenInfo::default());
        assert_eq!(principal.role, Role::InternalUser);
    }

    #[test]
    fn allowed_models() {
        let mut principal = Principal::from_token_info("ab".repeat(32), TokenInfo::default());
        assert!(principal.can_call_model("gpt-4o"));

        principal.info.allowed_models.insert("claude".to_string());
        assert!(!principal.can_call_model("gpt-4o"));
        assert!(principal.can_call_model("claude"));

        let admin = Principal::admin("ef".repeat(32));
        assert!(admin.can_call_model("anything"));
    }
}
