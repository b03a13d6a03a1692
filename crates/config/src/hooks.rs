//! Pre-call and post-call hook configuration.

use serde::Deserialize;
use url::Url;

/// Hooks run around every proxied request, in declaration order: blocked users,
/// banned keywords, management events.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct HooksConfig {
    /// Case-insensitive substrings rejected in request and response content.
    pub banned_keywords: Vec<String>,
    /// User ids denied access.
    pub blocked_users: Vec<String>,
    /// Webhook receiving an event whenever a managed object is created or deleted.
    pub management_webhook: Option<Url>,
}
