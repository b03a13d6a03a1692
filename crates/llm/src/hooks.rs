//! User hooks run in declaration order around the upstream call.
//!
//! Hooks may only reject; request changes are the business of guardrails.

use std::sync::Arc;

use async_trait::async_trait;
use auth::Principal;
use config::HooksConfig;
use serde::Serialize;

use crate::{
    error::{ErrorKind, LlmError},
    messages::{ChatCompletionRequest, ChatCompletionResponse},
};

mod management;

pub(crate) use management::ManagementWebhook;

/// A change to a managed object, announced to hooks.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ManagementEvent {
    pub action: &'static str,
    pub object_type: &'static str,
    pub object_id: String,
    pub user_id: String,
    pub team_id: String,
    pub timestamp: jiff::Timestamp,
}

impl ManagementEvent {
    pub fn new(action: &'static str, object_type: &'static str, object_id: impl Into<String>, principal: &Principal) -> Self {
        Self {
            action,
            object_type,
            object_id: object_id.into(),
            user_id: principal.user_id().to_string(),
            team_id: principal.team_id().to_string(),
            timestamp: jiff::Timestamp::now(),
        }
    }
}

#[async_trait]
pub(crate) trait Hook: Send + Sync {
    fn name(&self) -> &str;

    async fn pre_call(&self, _principal: &Principal, _request: &ChatCompletionRequest) -> crate::Result<()> {
        Ok(())
    }

    async fn post_call(
        &self,
        _principal: &Principal,
        _request: &ChatCompletionRequest,
        _response: &ChatCompletionResponse,
    ) -> crate::Result<()> {
        Ok(())
    }

    /// Must not block; delivery happens in the background.
    fn on_management_event(&self, _event: &ManagementEvent) {}
}

/// Hooks in registration order. The first error aborts the pipeline.
#[derive(Default)]
pub(crate) struct HookPipeline {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookPipeline {
    pub fn from_config(config: &HooksConfig, client: reqwest::Client) -> Self {
        let mut pipeline = Self::default();

        if !config.blocked_users.is_empty() {
            pipeline.register(Arc::new(BlockedUsers::new(&config.blocked_users)));
        }

        if !config.banned_keywords.is_empty() {
            pipeline.register(Arc::new(BannedKeywords::new(&config.banned_keywords)));
        }

        if let Some(url) = &config.management_webhook {
            pipeline.register(Arc::new(ManagementWebhook::new(url.clone(), client)));
        }

        pipeline
    }

    pub fn register(&mut self, hook: Arc<dyn Hook>) {
        log::debug!("Registered hook '{}'", hook.name());
        self.hooks.push(hook);
    }

    pub async fn pre_call(&self, principal: &Principal, request: &ChatCompletionRequest) -> crate::Result<()> {
        for hook in &self.hooks {
            hook.pre_call(principal, request).await?;
        }

        Ok(())
    }

    pub async fn post_call(
        &self,
        principal: &Principal,
        request: &ChatCompletionRequest,
        response: &ChatCompletionResponse,
    ) -> crate::Result<()> {
        for hook in &self.hooks {
            hook.post_call(principal, request, response).await?;
        }

        Ok(())
    }

    pub fn emit(&self, event: &ManagementEvent) {
        for hook in &self.hooks {
            hook.on_management_event(event);
        }
    }
}

struct BlockedUsers {
    users: Vec<String>,
}

impl BlockedUsers {
    fn new(users: &[String]) -> Self {
        Self { users: users.to_vec() }
    }
}

#[async_trait]
impl Hook for BlockedUsers {
    fn name(&self) -> &str {
        "blocked_users"
    }

    async fn pre_call(&self, principal: &Principal, request: &ChatCompletionRequest) -> crate::Result<()> {
        let user = principal.user_id();
        let end_user = request.user.as_deref().unwrap_or_default();

        for candidate in [user, end_user] {
            if !candidate.is_empty() && self.users.iter().any(|blocked| blocked == candidate) {
                log::debug!("Rejecting request of blocked user '{candidate}'");
                return Err(LlmError::permission(format!("User '{candidate}' is blocked from this proxy")));
            }
        }

        Ok(())
    }
}

struct BannedKeywords {
    keywords: Vec<String>,
}

impl BannedKeywords {
    fn new(keywords: &[String]) -> Self {
        Self {
            keywords: keywords.iter().map(|keyword| keyword.to_lowercase()).collect(),
        }
    }

    fn check(&self, text: &str) -> crate::Result<()> {
        let text = text.to_lowercase();

        if self.keywords.iter().any(|keyword| text.contains(keyword.as_str())) {
            return Err(LlmError::new(
                ErrorKind::ContentPolicyViolation,
                "Content contains a banned keyword",
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl Hook for BannedKeywords {
    fn name(&self) -> &str {
        "banned_keywords"
    }

    async fn pre_call(&self, _principal: &Principal, request: &ChatCompletionRequest) -> crate::Result<()> {
        request
            .messages
            .iter()
            .filter_map(|message| message.text())
            .try_for_each(|text| self.check(text))
    }

    async fn post_call(
        &self,
        _principal: &Principal,
        _request: &ChatCompletionRequest,
        response: &ChatCompletionResponse,
    ) -> crate::Result<()> {
        self.check(response.first_choice_text())
    }
}
