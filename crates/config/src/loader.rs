use std::{
    collections::{BTreeSet, HashSet},
    fmt::Write,
    path::Path,
    sync::OnceLock,
    time::Duration,
};

use anyhow::{Context, bail};
use regex::Regex;
use serde::Deserialize;
use toml::Value;

use crate::{Config, GuardrailType, ProviderType, SinkType};

pub(crate) fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let raw = load_raw(path)?;
    from_raw(raw)
}

pub(crate) fn load_raw<P: AsRef<Path>>(path: P) -> anyhow::Result<Value> {
    let path = path.as_ref();

    if !path.exists() {
        log::warn!("Configuration file {} not found, using defaults", path.display());
        return Ok(Value::Table(Default::default()));
    }

    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut raw_config: Value = toml::from_str(&content)?;

    expand_env_placeholders(&mut Vec::new(), &mut raw_config, &|name| std::env::var(name).ok())?;

    Ok(raw_config)
}

pub(crate) fn from_raw(raw: Value) -> anyhow::Result<Config> {
    let mut config = Config::deserialize(raw)?;

    apply_env_defaults(&mut config, |name| std::env::var(name).ok());
    validate(&config)?;

    Ok(config)
}

/// Fill settings the file leaves unset from `METRICS_PORT`, `DEFAULT_BATCH_SIZE`
/// and `DEFAULT_FLUSH_INTERVAL_SECONDS`. Explicit file values win.
pub fn apply_env_defaults(config: &mut Config, env: impl Fn(&str) -> Option<String>) {
    if config.telemetry.metrics.listen.is_none()
        && let Some(port) = env("METRICS_PORT")
    {
        config.telemetry.metrics.listen = Some(port);
    }

    if config.callbacks.batch_size.is_none()
        && let Some(value) = env("DEFAULT_BATCH_SIZE")
    {
        match value.trim().parse::<usize>() {
            Ok(size) if size > 0 => config.callbacks.batch_size = Some(size),
            _ => log::warn!("Ignoring invalid DEFAULT_BATCH_SIZE value '{value}'"),
        }
    }

    if config.callbacks.flush_interval.is_none()
        && let Some(value) = env("DEFAULT_FLUSH_INTERVAL_SECONDS")
    {
        match value.trim().parse::<u64>() {
            Ok(seconds) if seconds > 0 => config.callbacks.flush_interval = Some(Duration::from_secs(seconds)),
            _ => log::warn!("Ignoring invalid DEFAULT_FLUSH_INTERVAL_SECONDS value '{value}'"),
        }
    }
}

fn env_placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

    PLACEHOLDER.get_or_init(|| {
        let Ok(regex) = Regex::new(r"\{\{\s*env\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}") else {
            unreachable!("placeholder pattern is valid");
        };

        regex
    })
}

fn expand_env_placeholders<'a>(
    path: &mut Vec<Result<&'a str, usize>>,
    value: &'a mut Value,
    env: &dyn Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    match value {
        Value::String(s) => {
            if !env_placeholder().is_match(s) {
                return Ok(());
            }

            let mut missing = None;

            let expanded = env_placeholder().replace_all(s, |captures: &regex::Captures<'_>| {
                let name = &captures[1];

                env(name).unwrap_or_else(|| {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                })
            });

            if let Some(name) = missing {
                let mut p = String::new();

                for segment in path.iter() {
                    match segment {
                        Ok(s) => {
                            p.push_str(s);
                            p.push('.');
                        }
                        Err(i) => {
                            let _ = write!(p, "[{i}]");
                        }
                    }
                }

                if p.ends_with('.') {
                    p.pop();
                }

                bail!("Failed to expand configuration value at path '{p}': environment variable {name} not found");
            }

            *s = expanded.into_owned();
        }
        Value::Array(values) => {
            for (i, value) in values.iter_mut().enumerate() {
                path.push(Err(i));
                expand_env_placeholders(path, value, env)?;
                path.pop();
            }
        }
        Value::Table(map) => {
            for (key, value) in map {
                path.push(Ok(key.as_str()));
                expand_env_placeholders(path, value, env)?;
                path.pop();
            }
        }
        Value::Integer(_) | Value::Float(_) | Value::Boolean(_) | Value::Datetime(_) => (),
    }

    Ok(())
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    validate_providers(config)?;
    validate_guardrails(config)?;
    validate_callbacks(config)?;

    Ok(())
}

fn validate_providers(config: &Config) -> anyhow::Result<()> {
    if let Some(name) = &config.llm.passthrough_provider
        && !config.llm.providers.contains_key(name)
    {
        bail!("Passthrough provider '{name}' is not configured");
    }

    for (name, provider) in &config.llm.providers {
        if provider.provider_type == ProviderType::Bedrock && provider.region.is_none() && provider.base_url.is_none() {
            bail!("Bedrock provider '{name}' requires either a region or a base_url");
        }

        for (model, model_config) in &provider.models {
            if model_config.input_cost_per_token < 0.0 || model_config.output_cost_per_token < 0.0 {
                bail!("Model '{model}' of provider '{name}' has a negative token cost");
            }
        }
    }

    Ok(())
}

fn validate_guardrails(config: &Config) -> anyhow::Result<()> {
    let guardrails = &config.guardrails;

    for (name, definition) in &guardrails.definitions {
        match definition.guardrail_type {
            GuardrailType::Presidio | GuardrailType::Http if definition.url.is_none() => {
                bail!("Guardrail '{name}' requires a url");
            }
            GuardrailType::Regex if definition.patterns.is_empty() => {
                bail!("Regex guardrail '{name}' requires at least one pattern");
            }
            GuardrailType::Regex | GuardrailType::PromptInjection => {
                for pattern in &definition.patterns {
                    if let Err(e) = Regex::new(pattern) {
                        bail!("Guardrail '{name}' has an invalid pattern '{pattern}': {e}");
                    }
                }
            }
            _ => (),
        }
    }

    let known_guardrail = |policy: &str, guardrail: &str| -> anyhow::Result<()> {
        if !guardrails.definitions.contains_key(guardrail) {
            bail!("Policy '{policy}' references unknown guardrail '{guardrail}'");
        }

        Ok(())
    };

    for (name, policy) in &guardrails.policies {
        for guardrail in policy.guardrails.iter().chain(&policy.add).chain(&policy.remove) {
            known_guardrail(name, guardrail)?;
        }

        if let Some(parent) = &policy.inherit
            && !guardrails.policies.contains_key(parent)
        {
            bail!("Policy '{name}' inherits from unknown policy '{parent}'");
        }
    }

    for name in guardrails.policies.keys() {
        let mut seen = HashSet::new();
        let mut current = Some(name.as_str());

        while let Some(policy) = current {
            if !seen.insert(policy) {
                bail!("Policy '{name}' has an inheritance cycle through '{policy}'");
            }

            current = guardrails.policies.get(policy).and_then(|p| p.inherit.as_deref());
        }
    }

    for (i, attachment) in guardrails.attachments.iter().enumerate() {
        if !guardrails.policies.contains_key(&attachment.policy) {
            bail!("Attachment {i} references unknown policy '{}'", attachment.policy);
        }

        let selectors = [
            attachment.scope.is_some(),
            attachment.team.is_some(),
            attachment.key.is_some(),
            attachment.model.is_some(),
            attachment.tag.is_some(),
        ];

        if selectors.iter().filter(|set| **set).count() != 1 {
            bail!("Attachment {i} must set exactly one of scope, team, key, model or tag");
        }

        if let Some(scope) = &attachment.scope
            && scope != "global"
        {
            bail!("Attachment {i} has unsupported scope '{scope}', expected 'global'");
        }
    }

    let mut aliases = BTreeSet::new();

    for key in &config.auth.keys {
        let owner = key.alias.as_deref().unwrap_or("<unnamed>");

        if let Some(alias) = &key.alias
            && !aliases.insert(alias.as_str())
        {
            bail!("Virtual key alias '{alias}' is used more than once");
        }

        for policy in &key.policies {
            if !guardrails.policies.contains_key(policy) {
                bail!("Virtual key '{owner}' references unknown policy '{policy}'");
            }
        }

        for guardrail in &key.guardrails {
            if !guardrails.definitions.contains_key(guardrail) {
                bail!("Virtual key '{owner}' references unknown guardrail '{guardrail}'");
            }
        }
    }

    Ok(())
}

fn validate_callbacks(config: &Config) -> anyhow::Result<()> {
    for (name, sink) in &config.callbacks.sinks {
        if matches!(sink.sink_type, SinkType::HttpBatch | SinkType::Webhook) && sink.url.is_none() {
            bail!("Sink '{name}' requires a url");
        }
    }

    if let Some(alerting) = &config.callbacks.alerting
        && !(0.0..=1.0).contains(&alerting.threshold)
    {
        bail!("Alerting threshold must be between 0.0 and 1.0");
    }

    let threshold = config.server.rate_limits.dynamic.saturation_threshold;

    if !(0.0..=1.0).contains(&threshold) {
        bail!("Saturation threshold must be between 0.0 and 1.0");
    }

    config.telemetry.metrics.listen_address()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use indoc::indoc;
    use toml::Value;

    use super::{apply_env_defaults, expand_env_placeholders, validate};
    use crate::Config;

    fn expand(source: &str, vars: &[(&str, &str)]) -> anyhow::Result<Value> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let mut value: Value = toml::from_str(source).unwrap();

        expand_env_placeholders(&mut Vec::new(), &mut value, &|name| vars.get(name).cloned())?;

        Ok(value)
    }

    fn parse(source: &str) -> Config {
        toml::from_str(source).unwrap()
    }

    #[test]
    fn env_placeholders_are_expanded() {
        let value = expand(
            indoc! {r#"
                [auth]
                master_key = "{{ env.MASTER }}"

                [prompts.templates.greeting]
                messages = [{ role = "system", content = "Hello {{ name }}" }]
            "#},
            &[("MASTER", "sk-from-env")],
        )
        .unwrap();

        assert_eq!(value["auth"]["master_key"].as_str(), Some("sk-from-env"));
        assert_eq!(
            value["prompts"]["templates"]["greeting"]["messages"][0]["content"].as_str(),
            Some("Hello {{ name }}")
        );
    }

    #[test]
    fn missing_env_variable_names_the_path() {
        let error = expand(
            indoc! {r#"
                [llm.providers.openai]
                type = "openai"
                api_key = "{{ env.OPENAI_KEY }}"
            "#},
            &[],
        )
        .unwrap_err();

        insta::assert_snapshot!(error, @"Failed to expand configuration value at path 'llm.providers.openai.api_key': environment variable OPENAI_KEY not found");
    }

    #[test]
    fn env_defaults_fill_unset_values() {
        let mut config = parse("");
        let env: HashMap<&str, &str> = [
            ("METRICS_PORT", ":9464"),
            ("DEFAULT_BATCH_SIZE", "64"),
            ("DEFAULT_FLUSH_INTERVAL_SECONDS", "2"),
        ]
        .into();

        apply_env_defaults(&mut config, |name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.telemetry.metrics.listen.as_deref(), Some(":9464"));
        assert_eq!(config.callbacks.batch_size(), 64);
        assert_eq!(config.callbacks.flush_interval(), Duration::from_secs(2));
    }

    #[test]
    fn file_values_win_over_env_defaults() {
        let mut config = parse(indoc! {r#"
            [callbacks]
            batch_size = 8

            [telemetry.metrics]
            listen = ""
        "#});

        apply_env_defaults(&mut config, |name| match name {
            "METRICS_PORT" => Some(":9464".to_string()),
            "DEFAULT_BATCH_SIZE" => Some("64".to_string()),
            _ => None,
        });

        assert_eq!(config.callbacks.batch_size(), 8);
        assert_eq!(config.telemetry.metrics.listen_address().unwrap(), None);
    }

    #[test]
    fn invalid_env_defaults_are_ignored() {
        let mut config = parse("");

        apply_env_defaults(&mut config, |name| match name {
            "DEFAULT_BATCH_SIZE" => Some("lots".to_string()),
            "DEFAULT_FLUSH_INTERVAL_SECONDS" => Some("0".to_string()),
            _ => None,
        });

        assert_eq!(config.callbacks.batch_size(), 512);
        assert_eq!(config.callbacks.flush_interval(), Duration::from_secs(5));
    }

    #[test]
    fn policy_cycle_is_rejected() {
        let config = parse(indoc! {r#"
            [guardrails.policies.a]
            inherit = "b"

            [guardrails.policies.b]
            inherit = "a"
        "#});

        let error = validate(&config).unwrap_err().to_string();
        assert!(error.contains("inheritance cycle"), "{error}");
    }

    #[test]
    fn unknown_guardrail_in_policy() {
        let config = parse(indoc! {r#"
            [guardrails.policies.base]
            guardrails = ["missing"]
        "#});

        insta::assert_snapshot!(validate(&config).unwrap_err(), @"Policy 'base' references unknown guardrail 'missing'");
    }

    #[test]
    fn attachment_requires_one_selector() {
        let config = parse(indoc! {r#"
            [guardrails.policies.base]

            [[guardrails.attachments]]
            policy = "base"
            team = "a"
            model = "gpt-4o"
        "#});

        insta::assert_snapshot!(validate(&config).unwrap_err(), @"Attachment 0 must set exactly one of scope, team, key, model or tag");
    }

    #[test]
    fn presidio_requires_url() {
        let config = parse(indoc! {r#"
            [guardrails.definitions.pii]
            type = "presidio"
        "#});

        insta::assert_snapshot!(validate(&config).unwrap_err(), @"Guardrail 'pii' requires a url");
    }

    #[test]
    fn bedrock_requires_region() {
        let config = parse(indoc! {r#"
            [llm.providers.bedrock]
            type = "bedrock"
        "#});

        insta::assert_snapshot!(validate(&config).unwrap_err(), @"Bedrock provider 'bedrock' requires either a region or a base_url");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();

        assert!(config.llm.providers.is_empty());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tianji.toml");

        std::fs::write(
            &path,
            indoc! {r#"
                [server]
                listen_address = "127.0.0.1:4000"
            "#},
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_address.unwrap().port(), 4000);
    }
}
