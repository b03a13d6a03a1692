//! Tianji configuration structures to map the tianji.toml configuration.

#![deny(missing_docs)]

mod auth;
mod callbacks;
mod guardrails;
mod hooks;
mod llm;
mod loader;
mod prompts;
mod rate_limit;
mod secrets;
mod server;
mod telemetry;

use std::path::Path;

pub use auth::*;
pub use callbacks::*;
pub use guardrails::*;
pub use hooks::HooksConfig;
pub use llm::{LlmConfig, ModelConfig, ProviderConfig, ProviderType};
pub use loader::apply_env_defaults;
pub use prompts::{PromptMessageConfig, PromptTemplateConfig, PromptsConfig};
pub use rate_limit::*;
pub use secrets::{SecretsConfig, VaultConfig};
pub use server::{HealthConfig, ServerConfig, TlsServerConfig};
pub use telemetry::*;

use secrecy::SecretString;
use serde::Deserialize;

/// Main configuration structure for the Tianji gateway.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Caller authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,
    /// LLM provider and routing settings.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Content-safety guardrail definitions, policies and attachments.
    #[serde(default)]
    pub guardrails: GuardrailsConfig,
    /// Pre-call and post-call hooks.
    #[serde(default)]
    pub hooks: HooksConfig,
    /// Prompt templates.
    #[serde(default)]
    pub prompts: PromptsConfig,
    /// Observability sinks and rate-limit alerting.
    #[serde(default)]
    pub callbacks: CallbacksConfig,
    /// Telemetry settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Secret manager settings.
    #[serde(default)]
    pub secrets: SecretsConfig,
    /// Response id envelope settings.
    #[serde(default)]
    pub response_ids: ResponseIdConfig,
}

impl Config {
    /// Load configuration from a file path.
    ///
    /// `{{ env.NAME }}` placeholders are expanded, environment defaults are applied
    /// and the result is validated. A missing file yields the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Load the raw TOML document with environment placeholders expanded, before
    /// secret references are resolved.
    pub fn load_raw<P: AsRef<Path>>(path: P) -> anyhow::Result<toml::Value> {
        loader::load_raw(path)
    }

    /// Deserialize, apply environment defaults and validate an already expanded TOML document.
    pub fn from_raw(raw: toml::Value) -> anyhow::Result<Config> {
        loader::from_raw(raw)
    }

    /// Validates cross references between the configuration sections.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }
}

/// Settings for the HMAC envelope wrapped around upstream response ids.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ResponseIdConfig {
    /// The HMAC secret. A random secret is generated at startup when omitted,
    /// which invalidates previously issued envelopes on restart.
    pub secret: Option<SecretString>,
}
