use std::collections::BTreeMap;

use config::{LlmConfig, ModelConfig};

use crate::messages::{Model, Usage};

/// Fixed creation time reported for configured models.
const MODEL_CREATED: u64 = 1719475200;

/// A request's `model` resolved to an upstream deployment.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedModel {
    /// The name the client used and sees in responses.
    pub public_name: String,
    /// Configured provider name.
    pub provider: String,
    /// Model id sent upstream.
    pub upstream_model: String,
    /// Group sharing fleet capacity and saturation.
    pub group: String,
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
}

impl ResolvedModel {
    /// USD cost of a call with the given usage.
    pub fn cost(&self, usage: &Usage) -> f64 {
        f64::from(usage.prompt_tokens) * self.input_cost_per_token
            + f64::from(usage.completion_tokens) * self.output_cost_per_token
    }
}

/// Fleet capacity of a model group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct GroupCapacity {
    pub tpm: Option<u64>,
    pub rpm: Option<u64>,
}

/// Resolves model names against the configured providers.
///
/// A name matches a configured model alias of any provider first, and is
/// otherwise split as `provider/model`.
pub(crate) struct ModelManager {
    providers: BTreeMap<String, BTreeMap<String, ModelConfig>>,
}

impl ModelManager {
    pub fn new(config: &LlmConfig) -> Self {
        let providers = config
            .providers
            .iter()
            .map(|(name, provider)| (name.clone(), provider.models.clone()))
            .collect();

        Self { providers }
    }

    pub fn resolve(&self, requested: &str) -> Option<ResolvedModel> {
        let alias = self
            .providers
            .iter()
            .find_map(|(provider, models)| models.get(requested).map(|config| (provider, config)));

        if let Some((provider, config)) = alias {
            return Some(resolved(requested, provider, requested, Some(config)));
        }

        let (provider, model) = requested.split_once('/')?;
        let models = self.providers.get(provider)?;

        if model.is_empty() {
            return None;
        }

        Some(resolved(requested, provider, model, models.get(model)))
    }

    /// Configured models, by alias.
    pub fn models(&self) -> Vec<Model> {
        self.providers
            .iter()
            .flat_map(|(provider, models)| {
                models.keys().map(|alias| Model {
                    id: alias.clone(),
                    object: "model",
                    created: MODEL_CREATED,
                    owned_by: provider.clone(),
                })
            })
            .collect()
    }

    /// Capacity per model group. Groups without any capacity are left out; several
    /// models of one group add up.
    pub fn capacities(&self) -> BTreeMap<String, GroupCapacity> {
        let mut capacities = BTreeMap::<String, GroupCapacity>::new();

        for (alias, config) in self.providers.values().flatten() {
            if config.tpm_capacity.is_none() && config.rpm_capacity.is_none() {
                continue;
            }

            let group = config.model_group.clone().unwrap_or_else(|| alias.clone());
            let capacity = capacities.entry(group).or_default();

            if let Some(tpm) = config.tpm_capacity {
                capacity.tpm = Some(capacity.tpm.unwrap_or_default() + tpm);
            }

            if let Some(rpm) = config.rpm_capacity {
                capacity.rpm = Some(capacity.rpm.unwrap_or_default() + rpm);
            }
        }

        capacities
    }

    /// Fleet budget caps by public model name.
    pub fn budgets(&self) -> Vec<(String, f64)> {
        self.providers
            .values()
            .flatten()
            .filter_map(|(alias, config)| config.max_budget.map(|budget| (alias.clone(), budget)))
            .collect()
    }
}

fn resolved(public_name: &str, provider: &str, model: &str, config: Option<&ModelConfig>) -> ResolvedModel {
    let config = config.cloned().unwrap_or_default();

    ResolvedModel {
        public_name: public_name.to_string(),
        provider: provider.to_string(),
        upstream_model: config.rename.unwrap_or_else(|| model.to_string()),
        group: config.model_group.unwrap_or_else(|| public_name.to_string()),
        input_cost_per_token: config.input_cost_per_token,
        output_cost_per_token: config.output_cost_per_token,
    }
}
