//! LLM configuration structures for AI model providers.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;

use duration_str::deserialize_option_duration;
use secrecy::SecretString;
use serde::Deserialize;

/// LLM configuration for AI model integration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    /// Whether the LLM functionality is enabled.
    enabled: bool,

    /// The path where the OpenAI compatible endpoints will be mounted.
    pub path: Cow<'static, str>,

    /// Map of LLM provider configurations.
    pub providers: BTreeMap<String, ProviderConfig>,

    /// Provider receiving requests for endpoints without a `model` field,
    /// such as file uploads or response retrieval.
    pub passthrough_provider: Option<String>,

    /// Interval after which the spend counted against every model `max_budget` is
    /// cleared. Without it the spend accumulates for the life of the process.
    #[serde(deserialize_with = "deserialize_option_duration")]
    pub budget_reset_interval: Option<Duration>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: Cow::Borrowed("/"),
            providers: BTreeMap::new(),
            passthrough_provider: None,
            budget_reset_interval: None,
        }
    }
}

impl LlmConfig {
    /// Whether the LLM functionality is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether there are any LLM providers configured.
    pub fn has_providers(&self) -> bool {
        !self.providers.is_empty()
    }

    /// Effective reset interval of model budgets, if any.
    pub fn budget_reset_interval(&self) -> Option<Duration> {
        self.budget_reset_interval.filter(|interval| !interval.is_zero())
    }
}

/// Provider type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderType {
    /// OpenAI or any OpenAI compatible upstream.
    Openai,
    /// AWS Bedrock through the Converse API.
    Bedrock,
}

/// Configuration of one upstream provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Wire dialect of the upstream.
    #[serde(rename = "type")]
    pub provider_type: ProviderType,

    /// Credential sent upstream. For Bedrock this is an API key used as a bearer token.
    #[serde(default)]
    pub api_key: Option<SecretString>,

    /// Custom base URL for the provider API.
    #[serde(default)]
    pub base_url: Option<String>,

    /// AWS region, required for Bedrock without a base URL.
    #[serde(default)]
    pub region: Option<String>,

    /// Models exposed through this provider, keyed by their public name.
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
}

/// Configuration for an individual model.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// The model name sent upstream. Defaults to the public name.
    pub rename: Option<String>,
    /// Model group used for saturation tracking. Defaults to the public name.
    pub model_group: Option<String>,
    /// USD cost of one prompt token.
    pub input_cost_per_token: f64,
    /// USD cost of one completion token.
    pub output_cost_per_token: f64,
    /// Aggregate tokens per minute the upstream fleet serves for this model.
    pub tpm_capacity: Option<u64>,
    /// Aggregate requests per minute the upstream fleet serves for this model.
    pub rpm_capacity: Option<u64>,
    /// Fleet-wide spend cap for this model, enforced in memory.
    pub max_budget: Option<f64>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use indoc::indoc;

    use super::{LlmConfig, ProviderType};

    #[test]
    fn providers_and_models() {
        let config = indoc! {r#"
            passthrough_provider = "openai"

            [providers.openai]
            type = "openai"
            api_key = "sk-upstream"

            [providers.openai.models.gpt-4o]
            input_cost_per_token = 0.5
            tpm_capacity = 100000

            [providers.bedrock]
            type = "bedrock"
            region = "us-east-1"

            [providers.bedrock.models.claude]
            rename = "anthropic.claude-3-5-sonnet-20240620-v1:0"
            max_budget = 50.0
        "#};

        let config: LlmConfig = toml::from_str(config).unwrap();

        assert!(config.enabled());
        assert_eq!(config.path, "/");
        assert_eq!(config.passthrough_provider.as_deref(), Some("openai"));
        assert_eq!(config.providers["openai"].provider_type, ProviderType::Openai);
        assert_eq!(config.providers["openai"].models["gpt-4o"].tpm_capacity, Some(100000));
        assert_eq!(config.providers["bedrock"].region.as_deref(), Some("us-east-1"));
        assert_eq!(
            config.providers["bedrock"].models["claude"].rename.as_deref(),
            Some("anthropic.claude-3-5-sonnet-20240620-v1:0")
        );
    }

    #[test]
    fn budget_reset_interval() {
        let config: LlmConfig = toml::from_str(r#"budget_reset_interval = "1d""#).unwrap();
        assert_eq!(config.budget_reset_interval(), Some(Duration::from_secs(86400)));

        let config: LlmConfig = toml::from_str(r#"budget_reset_interval = "0s""#).unwrap();
        assert_eq!(config.budget_reset_interval(), None);

        assert_eq!(LlmConfig::default().budget_reset_interval(), None);
    }

    #[test]
    fn unknown_provider_type() {
        let config = indoc! {r#"
            [providers.mystery]
            type = "mystery"
        "#};

        let error = toml::from_str::<LlmConfig>(config).unwrap_err().to_string();
        assert!(error.contains("unknown variant `mystery`"), "{error}");
    }
}
