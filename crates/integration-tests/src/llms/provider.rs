use std::future::Future;
use std::net::SocketAddr;

use indoc::formatdoc;

#[derive(Clone, Debug, Copy)]
pub enum ProviderType {
    OpenAI,
    Bedrock,
}

/// Configuration for a test LLM provider
pub struct LlmProviderConfig {
    pub name: String,
    pub address: SocketAddr,
    pub provider_type: ProviderType,
    /// Public model names, with the upstream model they are renamed to.
    pub models: Vec<(String, Option<String>)>,
    /// TOML lines added to every model table, such as pricing or budgets.
    pub model_settings: Option<String>,
}

impl LlmProviderConfig {
    /// The `[llm.providers.<name>]` section pointing to the mock
    pub fn generate_config(&self) -> String {
        let (provider_type, base_url) = match self.provider_type {
            ProviderType::OpenAI => ("openai", format!("http://{}/v1", self.address)),
            ProviderType::Bedrock => ("bedrock", format!("http://{}", self.address)),
        };

        let mut models = String::new();

        for (name, rename) in &self.models {
            models.push_str(&format!("\n[llm.providers.{}.models.\"{name}\"]\n", self.name));

            if let Some(rename) = rename {
                models.push_str(&format!("rename = \"{rename}\"\n"));
            }

            if let Some(settings) = &self.model_settings {
                models.push_str(settings.trim());
                models.push('\n');
            }
        }

        formatdoc! {r#"

            [llm.providers.{name}]
            type = "{provider_type}"
            api_key = "test-key"
            base_url = "{base_url}"
            {models}
        "#, name = self.name}
    }
}

/// Trait for test LLM providers
pub trait TestLlmProvider: Send + Sync + 'static {
    /// Start the mock server and return its configuration
    fn spawn(self: Box<Self>) -> impl Future<Output = anyhow::Result<LlmProviderConfig>> + Send;
}
