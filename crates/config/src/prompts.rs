//! Prompt template configuration.

use std::{collections::BTreeMap, time::Duration};

use duration_str::deserialize_duration;
use serde::Deserialize;

/// Prompt templates referenced by `prompt_id` in chat requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PromptsConfig {
    /// How long a fetched template stays cached.
    #[serde(deserialize_with = "deserialize_duration")]
    pub cache_ttl: Duration,
    /// Templates keyed by prompt id.
    pub templates: BTreeMap<String, PromptTemplateConfig>,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            templates: BTreeMap::new(),
        }
    }
}

/// A prompt template.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromptTemplateConfig {
    /// Template messages, rendered with the request's `prompt_variables`.
    pub messages: Vec<PromptMessageConfig>,
}

/// A single template message.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromptMessageConfig {
    /// Message role.
    pub role: String,
    /// Template source.
    pub content: String,
}
