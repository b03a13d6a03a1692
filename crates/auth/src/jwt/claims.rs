use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::principal::Role;

/// Scope granting the proxy-admin role.
pub(crate) const ADMIN_SCOPE: &str = "tianji_proxy_admin";

/// Claims of a validated token that drive principal resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience, a string or a list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Value>,
    /// Subject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Space separated scopes, or a list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Value>,
    /// Explicit role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// User identifier, the subject when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Team identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    /// Organization identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

impl TokenClaims {
    /// The audience claim as a list.
    pub fn audiences(&self) -> Vec<&str> {
        match &self.aud {
            Some(Value::String(s)) => vec![s.as_str()],
            Some(Value::Array(arr)) => arr.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Whether the audience claim contains `expected`.
    pub fn has_audience(&self, expected: &str) -> bool {
        self.audiences().contains(&expected)
    }

    /// The scope claim as a list.
    pub fn scopes(&self) -> Vec<&str> {
        match &self.scope {
            Some(Value::String(s)) => s.split_whitespace().collect(),
            Some(Value::Array(arr)) => arr.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Admin scope first, then an explicit role claim, then team membership.
    pub fn role(&self) -> Role {
        if self.scopes().contains(&ADMIN_SCOPE) {
            return Role::ProxyAdmin;
        }

        if let Some(role) = self.role.as_deref().and_then(Role::from_claim) {
            return role;
        }

        if self.team_id.is_some() {
            return Role::Team;
        }

        Role::InternalUser
    }
}
