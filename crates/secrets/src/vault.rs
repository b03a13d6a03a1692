//! HashiCorp Vault KV v2 backend.

use async_trait::async_trait;
use config::VaultConfig;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::{SecretError, SecretManager};

const BACKEND: &str = "vault";
const DEFAULT_FIELD: &str = "value";

/// Reads secrets from a KV v2 mount. A path of `app/openai#api_key` reads the
/// `api_key` field of `app/openai`; without a fragment the `value` field is read.
pub struct VaultSecretManager {
    client: Client,
    address: Url,
    mount: String,
    namespace: Option<String>,
    token: SecretString,
}

#[derive(Deserialize)]
struct KvResponse {
    data: KvData,
}

#[derive(Deserialize)]
struct KvData {
    data: serde_json::Map<String, Value>,
}

impl VaultSecretManager {
    /// Create the backend. The token comes from the configuration or `VAULT_TOKEN`.
    pub fn new(config: &VaultConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self, SecretError> {
        let token = match &config.token {
            Some(token) => token.clone(),
            None => env("VAULT_TOKEN")
                .filter(|token| !token.is_empty())
                .map(SecretString::from)
                .ok_or_else(|| backend_error("no token configured and VAULT_TOKEN is not set"))?,
        };

        let client = Client::builder()
            .build()
            .map_err(|e| backend_error(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            address: config.address.clone(),
            mount: config.mount.trim_matches('/').to_string(),
            namespace: config.namespace.clone(),
            token,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, SecretError> {
        self.address
            .join(path)
            .map_err(|e| backend_error(format!("invalid secret path '{path}': {e}")))
    }

    fn request(&self, url: Url) -> reqwest::RequestBuilder {
        let request = self
            .client
            .get(url)
            .header("X-Vault-Token", self.token.expose_secret());

        match &self.namespace {
            Some(namespace) => request.header("X-Vault-Namespace", namespace),
            None => request,
        }
    }
}

#[async_trait]
impl SecretManager for VaultSecretManager {
    async fn get(&self, path: &str) -> Result<String, SecretError> {
        let (secret_path, field) = match path.split_once('#') {
            Some((secret_path, field)) => (secret_path, field),
            None => (path, DEFAULT_FIELD),
        };

        let url = self.endpoint(&format!("v1/{}/data/{}", self.mount, secret_path.trim_start_matches('/')))?;

        log::debug!("Fetching secret '{secret_path}' from Vault");

        let response = self
            .request(url)
            .send()
            .await
            .map_err(|e| backend_error(format!("request failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(SecretError::NotFound {
                    backend: BACKEND,
                    path: path.to_string(),
                });
            }
            status if !status.is_success() => {
                return Err(backend_error(format!("unexpected status {status} for '{secret_path}'")));
            }
            _ => {}
        }

        let body: KvResponse = response
            .json()
            .await
            .map_err(|e| backend_error(format!("invalid response body: {e}")))?;

        match body.data.data.get(field) {
            Some(Value::String(value)) => Ok(value.clone()),
            Some(Value::Null) | None => Err(SecretError::NotFound {
                backend: BACKEND,
                path: path.to_string(),
            }),
            Some(other) => Ok(other.to_string()),
        }
    }

    async fn health(&self) -> Result<(), SecretError> {
        let url = self.endpoint("v1/sys/health")?;

        let response = self
            .request(url)
            .send()
            .await
            .map_err(|e| backend_error(format!("health check failed: {e}")))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(backend_error(format!("health check returned {}", response.status())))
        }
    }
}

fn backend_error(message: impl Into<String>) -> SecretError {
    SecretError::Backend {
        backend: BACKEND,
        message: message.into(),
    }
}
