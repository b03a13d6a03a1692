use crate::principal::Role;

/// Authentication failures.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No token in any of the accepted headers.
    #[error("No API key provided")]
    MissingCredential,
    /// The token is unknown.
    #[error("Invalid API key")]
    InvalidCredential,
    /// The token, or its team, is blocked.
    #[error("API key is blocked")]
    CredentialBlocked,
    /// The credential store could not answer. Retrying may succeed.
    #[error("Credential store unavailable: {0}")]
    StoreUnavailable(String),
    /// The role may not call the route.
    #[error("Role {role} is not allowed to access {path}")]
    AccessDenied {
        /// Role of the caller.
        role: Role,
        /// Requested path.
        path: String,
    },
    /// A JWT failed validation.
    #[error("Invalid token: {0}")]
    InvalidToken(&'static str),
}

/// Credential store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or returned garbage.
    #[error("{0}")]
    Unavailable(String),
}
