//! Secret managers and resolution of `secret:<backend>/<path>` references in the
//! configuration.

#![deny(missing_docs)]

mod cache;
mod env;
mod registry;
mod resolver;
mod vault;

use async_trait::async_trait;

pub use cache::CachedSecretManager;
pub use env::EnvSecretManager;
pub use registry::{SecretManagerFactory, SecretManagerRegistry, builtin_registry};
pub use resolver::{SECRET_PREFIX, resolve_config_secrets, resolve_secrets};
pub use vault::VaultSecretManager;

/// A backend able to fetch a secret by path.
#[async_trait]
pub trait SecretManager: Send + Sync {
    /// Fetch the secret at `path`.
    async fn get(&self, path: &str) -> Result<String, SecretError>;

    /// Check the backend is reachable.
    async fn health(&self) -> Result<(), SecretError> {
        Ok(())
    }
}

/// Secret resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// No backend registered under the name.
    #[error("Unknown secret manager '{0}'")]
    UnknownBackend(String),
    /// The reference is not of the form `secret:<backend>/<path>`.
    #[error("Invalid secret reference '{0}', expected secret:<backend>/<path>")]
    InvalidReference(String),
    /// The backend has no such secret.
    #[error("Secret '{path}' not found in {backend}")]
    NotFound {
        /// Backend name.
        backend: &'static str,
        /// Requested path.
        path: String,
    },
    /// The backend is misconfigured or failed.
    #[error("{backend} secret manager error: {message}")]
    Backend {
        /// Backend name.
        backend: &'static str,
        /// Failure description.
        message: String,
    },
}
