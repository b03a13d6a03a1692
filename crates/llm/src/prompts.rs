//! Prompt templates named by `prompt_id` in chat requests.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use config::PromptsConfig;
use mini_moka::sync::Cache;
use minijinja::{Environment, UndefinedBehavior};

use crate::{
    error::{ErrorKind, LlmError},
    messages::{ChatCompletionRequest, ChatMessage},
};

/// Template messages as `(role, source)` pairs.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PromptTemplate {
    pub messages: Vec<(String, String)>,
}

/// Where templates come from. `Ok(None)` means the template does not exist.
#[async_trait]
pub(crate) trait PromptStore: Send + Sync {
    async fn fetch(&self, prompt_id: &str) -> anyhow::Result<Option<PromptTemplate>>;
}

/// Templates declared in `[prompts.templates]`.
pub(crate) struct ConfigPromptStore {
    templates: BTreeMap<String, PromptTemplate>,
}

impl ConfigPromptStore {
    pub fn new(config: &PromptsConfig) -> Self {
        let templates = config
            .templates
            .iter()
            .map(|(id, template)| {
                let messages = template
                    .messages
                    .iter()
                    .map(|message| (message.role.clone(), message.content.clone()))
                    .collect();

                (id.clone(), PromptTemplate { messages })
            })
            .collect();

        Self { templates }
    }
}

#[async_trait]
impl PromptStore for ConfigPromptStore {
    async fn fetch(&self, prompt_id: &str) -> anyhow::Result<Option<PromptTemplate>> {
        Ok(self.templates.get(prompt_id).cloned())
    }
}

/// Renders templates into requests, caching fetched templates.
pub(crate) struct PromptResolver {
    store: Arc<dyn PromptStore>,
    cache: Cache<String, Arc<PromptTemplate>>,
    environment: Environment<'static>,
}

impl PromptResolver {
    pub fn new(config: &PromptsConfig, store: Arc<dyn PromptStore>) -> Self {
        let cache = Cache::builder()
            .max_capacity(1_000)
            .time_to_live(config.cache_ttl)
            .build();

        let mut environment = Environment::new();
        environment.set_undefined_behavior(UndefinedBehavior::Strict);

        Self {
            store,
            cache,
            environment,
        }
    }

    async fn template(&self, prompt_id: &str) -> crate::Result<Arc<PromptTemplate>> {
        if let Some(template) = self.cache.get(&prompt_id.to_string()) {
            return Ok(template);
        }

        let template = self
            .store
            .fetch(prompt_id)
            .await
            .map_err(|e| {
                log::error!("Failed to fetch prompt template '{prompt_id}': {e:#}");
                LlmError::new(ErrorKind::ServiceUnavailable, "Prompt template store is unavailable")
            })?
            .ok_or_else(|| LlmError::not_found(format!("Prompt template '{prompt_id}' not found")))?;

        let template = Arc::new(template);
        self.cache.insert(prompt_id.to_string(), template.clone());

        Ok(template)
    }

    /// Replace the messages of a request naming a template with the rendered template
    /// followed by its own non-system messages.
    pub async fn apply(&self, request: &mut ChatCompletionRequest) -> crate::Result<()> {
        let Some(prompt_id) = request.prompt_id.take() else {
            return Ok(());
        };

        let template = self.template(&prompt_id).await?;
        let variables = minijinja::Value::from_serialize(request.prompt_variables.take().unwrap_or_default());

        let mut messages = Vec::with_capacity(template.messages.len() + request.messages.len());

        for (role, source) in &template.messages {
            let content = self.environment.render_str(source, &variables).map_err(|e| {
                log::debug!("Failed to render prompt template '{prompt_id}': {e}");
                LlmError::invalid_request(format!("Failed to render prompt template '{prompt_id}': {e}"))
                    .with_param("prompt_variables")
            })?;

            messages.push(ChatMessage::new(role.clone(), content));
        }

        messages.extend(request.messages.drain(..).filter(|message| message.role != "system"));
        request.messages = messages;

        log::debug!("Applied prompt template '{prompt_id}'");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use indoc::indoc;

    use super::*;

    fn config() -> PromptsConfig {
        toml::from_str(indoc! {r#"
            [templates.support]
            messages = [
                { role = "system", content = "You support {{ product }} for {{ customer }}." },
                { role = "assistant", content = "How can I help?" },
            ]
        "#})
        .unwrap()
    }

    fn resolver() -> PromptResolver {
        let config = config();
        PromptResolver::new(&config, Arc::new(ConfigPromptStore::new(&config)))
    }

    fn request(body: &str) -> ChatCompletionRequest {
        serde_json::from_str(body).unwrap()
    }

    #[tokio::test]
    async fn template_replaces_system_messages() {
        let mut request = request(indoc! {r#"
            {
              "model": "gpt-4o",
              "messages": [
                {"role": "system", "content": "ignored"},
                {"role": "user", "content": "my invoice is wrong"}
              ],
              "prompt_id": "support",
              "prompt_variables": {"product": "Tianji", "customer": "ACME"}
            }
        "#});

        resolver().apply(&mut request).await.unwrap();

        let messages: Vec<_> = request
            .messages
            .iter()
            .map(|message| format!("{}: {}", message.role, message.text().unwrap_or_default()))
            .collect();

        insta::assert_debug_snapshot!(messages, @r#"
        [
            "system: You support Tianji for ACME.",
            "assistant: How can I help?",
            "user: my invoice is wrong",
        ]
        "#);

        assert!(request.prompt_id.is_none());
    }

    #[tokio::test]
    async fn unknown_template_is_not_found() {
        let mut request = request(r#"{"model": "gpt-4o", "messages": [], "prompt_id": "missing"}"#);
        let error = resolver().apply(&mut request).await.unwrap_err();

        assert_eq!(error.kind(), ErrorKind::NotFound);
        insta::assert_snapshot!(error, @"Prompt template 'missing' not found");
    }

    #[tokio::test]
    async fn missing_variables_are_rejected() {
        let mut request = request(r#"{"model": "gpt-4o", "messages": [], "prompt_id": "support"}"#);
        let error = resolver().apply(&mut request).await.unwrap_err();

        assert_eq!(error.kind(), ErrorKind::InvalidRequest);
    }

    struct Counting {
        inner: ConfigPromptStore,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl PromptStore for Counting {
        async fn fetch(&self, prompt_id: &str) -> anyhow::Result<Option<PromptTemplate>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch(prompt_id).await
        }
    }

    #[tokio::test]
    async fn templates_are_cached() {
        let config = config();

        let store = Arc::new(Counting {
            inner: ConfigPromptStore::new(&config),
            fetches: AtomicUsize::new(0),
        });

        let resolver = PromptResolver::new(&config, store.clone());

        for _ in 0..3 {
            let mut request = request(indoc! {r#"
                {
                  "model": "gpt-4o",
                  "messages": [],
                  "prompt_id": "support",
                  "prompt_variables": {"product": "Tianji", "customer": "ACME"}
                }
            "#});

            resolver.apply(&mut request).await.unwrap();
        }

        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
    }
}
