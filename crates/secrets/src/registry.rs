use std::collections::BTreeMap;
use std::sync::Arc;

use config::SecretsConfig;

use crate::{CachedSecretManager, EnvSecretManager, SecretError, SecretManager, VaultSecretManager};

/// Builds a backend from the secrets configuration.
pub type SecretManagerFactory = Box<dyn Fn(&SecretsConfig) -> Result<Arc<dyn SecretManager>, SecretError> + Send + Sync>;

/// Named secret backends. Backends are registered explicitly and built on first use.
#[derive(Default)]
pub struct SecretManagerRegistry {
    factories: BTreeMap<String, SecretManagerFactory>,
}

impl SecretManagerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under `name`, replacing any previous registration.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&SecretsConfig) -> Result<Arc<dyn SecretManager>, SecretError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Names of the registered backends.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the named backend, wrapped in the configured TTL cache.
    pub fn build(&self, name: &str, config: &SecretsConfig) -> Result<Arc<dyn SecretManager>, SecretError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| SecretError::UnknownBackend(name.to_string()))?;

        let backend = factory(config)?;

        Ok(Arc::new(CachedSecretManager::new(backend, config.cache_ttl)))
    }
}

/// The registry with the `env` and `vault` backends.
pub fn builtin_registry() -> SecretManagerRegistry {
    let mut registry = SecretManagerRegistry::new();

    registry.register("env", |_| Ok(Arc::new(EnvSecretManager) as Arc<dyn SecretManager>));

    registry.register("vault", |config| {
        let vault = config.vault.as_ref().ok_or_else(|| SecretError::Backend {
            backend: "vault",
            message: "no [secrets.vault] section configured".to_string(),
        })?;

        let manager = VaultSecretManager::new(vault, |name| std::env::var(name).ok())?;

        Ok(Arc::new(manager) as Arc<dyn SecretManager>)
    });

    registry
}
