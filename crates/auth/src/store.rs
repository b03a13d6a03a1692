//! Credential store contract and the configuration-backed implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use config::{AuthConfig, VirtualKeyConfig};
use dashmap::DashMap;
use rate_limit::{BudgetSnapshot, PrincipalLimits};
use secrecy::ExposeSecret;

use crate::error::StoreError;
use crate::fingerprint::fingerprint;
use crate::principal::TokenInfo;

/// Cost of one finished call, attributed to a key and its owners.
#[derive(Debug, Clone, PartialEq)]
pub struct SpendRecord {
    /// Fingerprint of the key.
    pub fingerprint: String,
    /// Team of the key.
    pub team_id: Option<String>,
    /// Organization of the key.
    pub org_id: Option<String>,
    /// Public model name.
    pub model: String,
    /// Cost in USD.
    pub cost: f64,
}

/// Source of truth for virtual keys and their cumulative spend.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up a key by fingerprint. `Ok(None)` means the key does not exist.
    async fn get_verification_token(&self, fingerprint: &str) -> Result<Option<TokenInfo>, StoreError>;

    /// Add the cost of a call to the key, team, organization and model spend.
    async fn record_spend(&self, spend: &SpendRecord) -> Result<(), StoreError>;
}

struct StaticKey {
    info: TokenInfo,
    max_budget: Option<f64>,
}

struct Owner {
    blocked: bool,
    max_budget: Option<f64>,
}

/// Keys, teams and organizations declared in the configuration. Spend lives in
/// memory and starts from the configured values.
pub struct StaticCredentialStore {
    keys: HashMap<String, StaticKey>,
    teams: HashMap<String, Owner>,
    organizations: HashMap<String, Owner>,
    key_spend: DashMap<String, f64>,
    model_spend: DashMap<(String, String), f64>,
    team_spend: DashMap<String, f64>,
    org_spend: DashMap<String, f64>,
}

impl StaticCredentialStore {
    /// Index the configured keys by fingerprint.
    pub fn new(config: &AuthConfig) -> Self {
        let store = Self {
            keys: HashMap::new(),
            teams: HashMap::new(),
            organizations: HashMap::new(),
            key_spend: DashMap::new(),
            model_spend: DashMap::new(),
            team_spend: DashMap::new(),
            org_spend: DashMap::new(),
        };

        store.with_config(config)
    }

    fn with_config(mut self, config: &AuthConfig) -> Self {
        for team in &config.teams {
            self.team_spend.insert(team.id.clone(), team.spend);
            self.teams.insert(
                team.id.clone(),
                Owner {
                    blocked: team.blocked,
                    max_budget: team.max_budget,
                },
            );
        }

        for org in &config.organizations {
            self.org_spend.insert(org.id.clone(), org.spend);
            self.organizations.insert(
                org.id.clone(),
                Owner {
                    blocked: false,
                    max_budget: org.max_budget,
                },
            );
        }

        for key in &config.keys {
            let fingerprint = fingerprint(key.key.expose_secret());

            self.key_spend.insert(fingerprint.clone(), key.spend);

            for (model, spend) in &key.model_spend {
                self.model_spend.insert((fingerprint.clone(), model.clone()), *spend);
            }

            self.keys.insert(fingerprint, static_key(key));
        }

        log::debug!("Credential store loaded with {} virtual keys", self.keys.len());

        self
    }

    fn spend_of(map: &DashMap<String, f64>, id: Option<&str>) -> f64 {
        id.and_then(|id| map.get(id).map(|spend| *spend)).unwrap_or_default()
    }
}

fn static_key(config: &VirtualKeyConfig) -> StaticKey {
    let info = TokenInfo {
        user_id: config.user_id.clone(),
        team_id: config.team_id.clone(),
        org_id: config.org_id.clone(),
        key_alias: config.alias.clone(),
        blocked: config.blocked,
        budget: BudgetSnapshot {
            model_max_budget: config.model_max_budget.clone(),
            ..Default::default()
        },
        limits: PrincipalLimits {
            rpm_limit: config.rpm_limit,
            tpm_limit: config.tpm_limit,
            max_parallel_requests: config.max_parallel_requests,
            priority: config.priority,
        },
        allowed_models: config.allowed_models.clone(),
        allowed_cache_controls: config.allowed_cache_controls.clone(),
        policies: config.policies.clone(),
        guardrails: config.guardrails.clone(),
        tags: config.tags.clone(),
    };

    StaticKey {
        info,
        max_budget: config.max_budget,
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn get_verification_token(&self, fingerprint: &str) -> Result<Option<TokenInfo>, StoreError> {
        let Some(key) = self.keys.get(fingerprint) else {
            return Ok(None);
        };

        let mut info = key.info.clone();

        let team = info.team_id.as_deref().and_then(|id| self.teams.get(id));
        let org = info.org_id.as_deref().and_then(|id| self.organizations.get(id));

        info.blocked |= team.is_some_and(|team| team.blocked);

        info.budget.key_spend = Self::spend_of(&self.key_spend, Some(fingerprint));
        info.budget.key_max_budget = key.max_budget;
        info.budget.team_spend = Self::spend_of(&self.team_spend, info.team_id.as_deref());
        info.budget.team_max_budget = team.and_then(|team| team.max_budget);
        info.budget.org_spend = Self::spend_of(&self.org_spend, info.org_id.as_deref());
        info.budget.org_max_budget = org.and_then(|org| org.max_budget);

        info.budget.model_spend = self
            .model_spend
            .iter()
            .filter(|entry| entry.key().0 == fingerprint)
            .map(|entry| (entry.key().1.clone(), *entry.value()))
            .collect();

        Ok(Some(info))
    }

    async fn record_spend(&self, spend: &SpendRecord) -> Result<(), StoreError> {
        if !self.keys.contains_key(&spend.fingerprint) {
            return Ok(());
        }

        *self.key_spend.entry(spend.fingerprint.clone()).or_default() += spend.cost;

        *self
            .model_spend
            .entry((spend.fingerprint.clone(), spend.model.clone()))
            .or_default() += spend.cost;

        if let Some(team_id) = &spend.team_id {
            *self.team_spend.entry(team_id.clone()).or_default() += spend.cost;
        }

        if let Some(org_id) = &spend.org_id {
            *self.org_spend.entry(org_id.clone()).or_default() += spend.cost;
        }

        Ok(())
    }
}
