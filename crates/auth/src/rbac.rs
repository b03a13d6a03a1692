use std::collections::BTreeMap;

use config::RbacConfig;

use crate::principal::Role;

/// Route access per role.
///
/// A route entry matches its exact path and everything below it; `*` matches all
/// paths and a trailing `/*` matches only the paths below the prefix. Proxy admins
/// are never restricted.
#[derive(Debug, Clone)]
pub struct RbacPolicy {
    roles: BTreeMap<String, Vec<String>>,
}

impl RbacPolicy {
    /// Build from configuration.
    pub fn new(config: &RbacConfig) -> Self {
        Self {
            roles: config.roles.clone(),
        }
    }

    /// Whether `role` may call `path`.
    pub fn is_allowed(&self, role: Role, path: &str) -> bool {
        if role == Role::ProxyAdmin {
            return true;
        }

        self.roles
            .get(role.as_str())
            .is_some_and(|routes| routes.iter().any(|route| route_matches(route, path)))
    }
}

fn route_matches(route: &str, path: &str) -> bool {
    if route == "*" {
        return true;
    }

    if let Some(prefix) = route.strip_suffix("/*") {
        return path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'));
    }

    path == route || path.strip_prefix(route).is_some_and(|rest| rest.starts_with('/'))
}
