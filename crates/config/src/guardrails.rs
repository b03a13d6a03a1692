//! Guardrail definitions, policies and policy attachments.

use std::{collections::BTreeMap, time::Duration};

use duration_str::deserialize_option_duration;
use serde::Deserialize;
use url::Url;

/// Guardrail configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct GuardrailsConfig {
    /// Named guardrails.
    pub definitions: BTreeMap<String, GuardrailConfig>,
    /// Named guardrail policies.
    pub policies: BTreeMap<String, GuardrailPolicyConfig>,
    /// Bindings of policies to request dimensions.
    pub attachments: Vec<PolicyAttachmentConfig>,
}

/// The check a guardrail performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailType {
    /// PII redaction through a Presidio analyzer.
    Presidio,
    /// Pattern based prompt-injection detection.
    PromptInjection,
    /// Regex content filter with a match threshold.
    Regex,
    /// Requested tools must be in an allowed set.
    ToolPermission,
    /// A generic vendor reached over HTTP.
    Http,
}

/// Hook a guardrail runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailHook {
    /// Before the upstream call, may modify the request.
    PreCall,
    /// After the upstream call, may replace the response with an error.
    PostCall,
}

/// Behavior when a guardrail fails to produce a verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Log and continue as if the guardrail passed.
    Open,
    /// Fail the request.
    #[default]
    Closed,
}

/// A single guardrail definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuardrailConfig {
    /// The guardrail implementation.
    #[serde(rename = "type")]
    pub guardrail_type: GuardrailType,
    /// Hooks the guardrail runs on.
    #[serde(default = "default_hooks")]
    pub hooks: Vec<GuardrailHook>,
    /// Fail-open or fail-closed.
    #[serde(default)]
    pub fail_policy: FailPolicy,
    /// Endpoint of the Presidio analyzer or HTTP vendor.
    pub url: Option<Url>,
    /// Language sent to Presidio.
    pub language: Option<String>,
    /// Entity types Presidio should report. Empty reports every entity.
    #[serde(default)]
    pub entities: Vec<String>,
    /// Patterns for the prompt-injection and regex guardrails.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Number of regex matches that blocks the content.
    pub threshold: Option<usize>,
    /// Allowed tool names for the tool-permission guardrail. `*` allows all tools.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Extra headers sent to the vendor.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Per-call timeout for remote guardrails.
    #[serde(default, deserialize_with = "deserialize_option_duration")]
    pub timeout: Option<Duration>,
}

fn default_hooks() -> Vec<GuardrailHook> {
    vec![GuardrailHook::PreCall]
}

/// A named, composable list of guardrails.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct GuardrailPolicyConfig {
    /// Parent policy whose effective list is the starting point.
    pub inherit: Option<String>,
    /// Guardrails of this policy.
    pub guardrails: Vec<String>,
    /// Guardrails appended to the inherited list.
    pub add: Vec<String>,
    /// Guardrails removed from the inherited list.
    pub remove: Vec<String>,
}

/// Binds a policy to one request dimension.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyAttachmentConfig {
    /// The attached policy.
    pub policy: String,
    /// `global` applies the policy to every request.
    pub scope: Option<String>,
    /// Team identifier.
    pub team: Option<String>,
    /// Key fingerprint or virtual key alias.
    pub key: Option<String>,
    /// Public model name.
    pub model: Option<String>,
    /// Request tag.
    pub tag: Option<String>,
}
