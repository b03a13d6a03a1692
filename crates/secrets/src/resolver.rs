//! Replaces `secret:<backend>/<path>` strings in the raw configuration document.

use std::collections::HashMap;
use std::sync::Arc;

use config::SecretsConfig;
use toml::Value;

use crate::{SecretError, SecretManager, SecretManagerRegistry};

/// Prefix marking a string value as a secret reference.
pub const SECRET_PREFIX: &str = "secret:";

/// Resolve every secret reference in a raw configuration document, using the
/// `[secrets]` section of the same document to configure the backends.
///
/// The `[secrets]` section itself is left untouched. Any failure is returned so
/// the caller can refuse to start.
pub async fn resolve_config_secrets(raw: &mut Value, registry: &SecretManagerRegistry) -> anyhow::Result<()> {
    let config = match raw.get("secrets") {
        Some(section) => section.clone().try_into::<SecretsConfig>()?,
        None => SecretsConfig::default(),
    };

    let Value::Table(table) = raw else {
        return Ok(());
    };

    let mut resolver = Resolver {
        registry,
        config: &config,
        backends: HashMap::new(),
    };

    for (key, value) in table.iter_mut() {
        if key == "secrets" {
            continue;
        }

        resolver.resolve(key, value).await?;
    }

    if !resolver.backends.is_empty() {
        log::debug!("Resolved configuration secrets from {} backend(s)", resolver.backends.len());
    }

    Ok(())
}

/// Resolve secret references in any document with an already known secrets configuration.
pub async fn resolve_secrets(
    value: &mut Value,
    registry: &SecretManagerRegistry,
    config: &SecretsConfig,
) -> anyhow::Result<()> {
    let mut resolver = Resolver {
        registry,
        config,
        backends: HashMap::new(),
    };

    resolver.resolve("", value).await
}

struct Resolver<'a> {
    registry: &'a SecretManagerRegistry,
    config: &'a SecretsConfig,
    backends: HashMap<String, Arc<dyn SecretManager>>,
}

impl Resolver<'_> {
    async fn resolve(&mut self, location: &str, value: &mut Value) -> anyhow::Result<()> {
        // Iterative walk, async recursion would need boxing.
        let mut pending = vec![(location.to_string(), value)];

        while let Some((location, value)) = pending.pop() {
            match value {
                Value::String(text) => {
                    let Some(reference) = text.strip_prefix(SECRET_PREFIX) else {
                        continue;
                    };

                    let (backend, path) = reference
                        .split_once('/')
                        .filter(|(backend, path)| !backend.is_empty() && !path.is_empty())
                        .ok_or_else(|| SecretError::InvalidReference(text.clone()))?;

                    let manager = self.backend(backend)?;

                    let secret = manager
                        .get(path)
                        .await
                        .map_err(|e| anyhow::anyhow!("Failed to resolve secret for `{location}`: {e}"))?;

                    *text = secret;
                }
                Value::Array(items) => {
                    for (index, item) in items.iter_mut().enumerate() {
                        pending.push((format!("{location}[{index}]"), item));
                    }
                }
                Value::Table(table) => {
                    for (key, item) in table.iter_mut() {
                        let location = if location.is_empty() {
                            key.clone()
                        } else {
                            format!("{location}.{key}")
                        };

                        pending.push((location, item));
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn backend(&mut self, name: &str) -> Result<Arc<dyn SecretManager>, SecretError> {
        if let Some(manager) = self.backends.get(name) {
            return Ok(manager.clone());
        }

        let manager = self.registry.build(name, self.config)?;
        self.backends.insert(name.to_string(), manager.clone());

        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use indoc::indoc;

    use super::*;

    struct Fixed;

    #[async_trait]
    impl SecretManager for Fixed {
        async fn get(&self, path: &str) -> Result<String, SecretError> {
            match path {
                "openai" => Ok("sk-upstream".to_string()),
                "master" => Ok("sk-master".to_string()),
                _ => Err(SecretError::NotFound {
                    backend: "fixed",
                    path: path.to_string(),
                }),
            }
        }
    }

    fn registry() -> SecretManagerRegistry {
        let mut registry = SecretManagerRegistry::new();
        registry.register("fixed", |_| Ok(Arc::new(Fixed) as Arc<dyn SecretManager>));
        registry
    }

    #[tokio::test]
    async fn references_are_replaced() {
        let mut raw: Value = toml::from_str(indoc! {r#"
            [auth]
            master_key = "secret:fixed/master"

            [[auth.keys]]
            key = "plain"

            [llm.providers.openai]
            type = "openai"
            api_key = "secret:fixed/openai"

            [secrets]
            cache_ttl = "1h"
        "#})
        .unwrap();

        resolve_config_secrets(&mut raw, &registry()).await.unwrap();

        assert_eq!(raw["auth"]["master_key"].as_str(), Some("sk-master"));
        assert_eq!(raw["auth"]["keys"][0]["key"].as_str(), Some("plain"));
        assert_eq!(raw["llm"]["providers"]["openai"]["api_key"].as_str(), Some("sk-upstream"));
        assert_eq!(raw["secrets"]["cache_ttl"].as_str(), Some("1h"));
    }

    #[tokio::test]
    async fn missing_secret_is_fatal() {
        let mut raw: Value = toml::from_str(indoc! {r#"
            [llm.providers.openai]
            api_key = "secret:fixed/anthropic"
        "#})
        .unwrap();

        let error = resolve_config_secrets(&mut raw, &registry()).await.unwrap_err();

        insta::assert_snapshot!(error, @"Failed to resolve secret for `llm.providers.openai.api_key`: Secret 'anthropic' not found in fixed");
    }

    #[tokio::test]
    async fn unknown_backend_is_fatal() {
        let mut raw: Value = toml::from_str(indoc! {r#"
            [auth]
            master_key = "secret:aws/master"
        "#})
        .unwrap();

        let error = resolve_config_secrets(&mut raw, &registry()).await.unwrap_err();

        insta::assert_snapshot!(error, @"Unknown secret manager 'aws'");
    }

    #[tokio::test]
    async fn malformed_reference() {
        let mut raw: Value = toml::from_str(indoc! {r#"
            [auth]
            master_key = "secret:fixed"
        "#})
        .unwrap();

        let error = resolve_config_secrets(&mut raw, &registry()).await.unwrap_err();

        insta::assert_snapshot!(error, @"Invalid secret reference 'secret:fixed', expected secret:<backend>/<path>");
    }
}
