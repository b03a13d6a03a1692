use async_trait::async_trait;

use crate::{SecretError, SecretManager};

/// Reads secrets from environment variables; the path is the variable name.
#[derive(Debug, Default)]
pub struct EnvSecretManager;

#[async_trait]
impl SecretManager for EnvSecretManager {
    async fn get(&self, path: &str) -> Result<String, SecretError> {
        std::env::var(path).map_err(|_| SecretError::NotFound {
            backend: "env",
            path: path.to_string(),
        })
    }
}
