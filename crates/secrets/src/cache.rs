use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mini_moka::sync::Cache;

use crate::{SecretError, SecretManager};

/// Keeps resolved secrets for a fixed time.
pub struct CachedSecretManager {
    inner: Arc<dyn SecretManager>,
    cache: Cache<String, String>,
}

impl CachedSecretManager {
    /// Wrap a backend with a cache of the given time to live.
    pub fn new(inner: Arc<dyn SecretManager>, ttl: Duration) -> Self {
        let cache = Cache::builder().max_capacity(10_000).time_to_live(ttl).build();
        Self { inner, cache }
    }
}

#[async_trait]
impl SecretManager for CachedSecretManager {
    async fn get(&self, path: &str) -> Result<String, SecretError> {
        if let Some(value) = self.cache.get(&path.to_string()) {
            return Ok(value);
        }

        let value = self.inner.get(path).await?;
        self.cache.insert(path.to_string(), value.clone());

        Ok(value)
    }

    async fn health(&self) -> Result<(), SecretError> {
        self.inner.health().await
    }
}
