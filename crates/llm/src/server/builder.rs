//! Builds the pipeline from configuration.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::Context;
use auth::{Authenticator, CredentialStore, StaticCredentialStore};
use callbacks::{CallbackRegistry, RateLimitAlerter, RateLimitStateCache};
use config::Config;
use rate_limit::{ModelBudgetLimiter, PrincipalRateLimiter, Storage};

use crate::{
    guardrails::{GuardrailRegistry, PolicyResolver},
    hooks::HookPipeline,
    prompts::{ConfigPromptStore, PromptResolver},
    provider::{ModelManager, ProviderRegistry},
    response_id::ResponseIdSigner,
    saturation::SaturationCoordinator,
    server::{LlmServer, LlmServerInner, dispatch::Dispatcher, metrics::OperationMetrics},
    spend::SpendSink,
};

pub(crate) struct LlmServerBuilder<'a> {
    config: &'a Config,
    storage: Arc<Storage>,
    callbacks: CallbackRegistry,
    credential_store: Option<Arc<dyn CredentialStore>>,
}

impl<'a> LlmServerBuilder<'a> {
    pub fn new(config: &'a Config, storage: Arc<Storage>, callbacks: CallbackRegistry) -> Self {
        Self {
            config,
            storage,
            callbacks,
            credential_store: None,
        }
    }

    /// Replace the credential store built from `[auth]`.
    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credential_store = Some(store);
        self
    }

    /// Build the server. The returned registry is shared with the server and must be
    /// shut down by the owner of the process.
    pub fn build(self) -> anyhow::Result<(LlmServer, Arc<CallbackRegistry>)> {
        let Self {
            config,
            storage,
            mut callbacks,
            credential_store,
        } = self;

        log::debug!("Initializing LLM server with {} providers", config.llm.providers.len());

        let mut client = reqwest::Client::builder();

        if let Some(timeout) = config.server.request_timeout {
            client = client.timeout(timeout);
        }

        let client = client.build().context("Failed to create the upstream HTTP client")?;

        let registry = ProviderRegistry::builtin();
        let mut providers = BTreeMap::new();

        for (name, provider_config) in &config.llm.providers {
            log::debug!("Initializing provider: {name}");

            let provider = registry
                .build(name, provider_config)
                .map_err(|e| anyhow::anyhow!("Failed to initialize provider '{name}': {e}"))?;

            providers.insert(name.clone(), provider);
        }

        if let Some(name) = &config.llm.passthrough_provider
            && !providers.contains_key(name)
        {
            anyhow::bail!("Passthrough provider '{name}' is not configured");
        }

        let models = ModelManager::new(&config.llm);
        let model_budgets = Arc::new(ModelBudgetLimiter::new(models.budgets()));

        let store = credential_store.unwrap_or_else(|| Arc::new(StaticCredentialStore::new(&config.auth)));

        callbacks.register(Arc::new(SpendSink::new(store.clone(), model_budgets.clone())));

        if let Some(interval) = config.llm.budget_reset_interval() {
            log::debug!("Model budgets reset every {interval:?}");

            let reset = model_budgets.spawn_reset(interval, callbacks.shutdown_token().clone());
            callbacks.track(reset);
        }

        let rate_limit_state = Arc::new(RateLimitStateCache::new());
        let state_config = &config.callbacks.rate_limit_state;

        let pruner = rate_limit_state.spawn_pruner(
            state_config.prune_interval,
            state_config.ttl,
            callbacks.shutdown_token().clone(),
        );

        callbacks.track(pruner);

        let alerter = config
            .callbacks
            .alerting
            .as_ref()
            .map(|alerting| RateLimitAlerter::new(alerting, client.clone()));

        let guardrails = GuardrailRegistry::from_config(&config.guardrails, client.clone())?;
        let prompts = PromptResolver::new(&config.prompts, Arc::new(ConfigPromptStore::new(&config.prompts)));
        let response_ids = ResponseIdSigner::new(config.response_ids.secret.as_ref())?;
        let saturation = SaturationCoordinator::new(storage.clone(), models.capacities());

        let callbacks = Arc::new(callbacks);

        log::debug!(
            "LLM server initialized with {} provider(s) and {} callback sink(s)",
            providers.len(),
            callbacks.len()
        );

        let server = LlmServer {
            shared: Arc::new(LlmServerInner {
                authenticator: Authenticator::new(&config.auth, store),
                ip_whitelist: config.server.ip_whitelist.clone(),
                models,
                providers,
                passthrough_provider: config.llm.passthrough_provider.clone(),
                limiter: PrincipalRateLimiter::new(storage, config.server.rate_limits.dynamic.clone()),
                model_budgets,
                hooks: HookPipeline::from_config(&config.hooks, client.clone()),
                prompts,
                guardrails,
                policies: PolicyResolver::new(&config.guardrails),
                response_ids,
                dispatcher: Dispatcher::new(client, rate_limit_state, alerter),
                saturation,
                callbacks: callbacks.clone(),
                metrics: OperationMetrics::new(),
            }),
        };

        Ok((server, callbacks))
    }
}
