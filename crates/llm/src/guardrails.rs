//! Named content checks run before and after the upstream call.
//!
//! The registry is built once at startup from `[guardrails.definitions]` and read-only
//! afterwards. Which guardrails run for a request is decided by [`PolicyResolver`].

mod http;
mod policy;
mod presidio;
mod prompt_injection;
mod regex_filter;
mod tool_permission;

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use auth::Principal;
use config::{FailPolicy, GuardrailConfig, GuardrailHook, GuardrailType, GuardrailsConfig};
use telemetry::metrics::{GUARDRAIL_CHECK_DURATION, Recorder};

pub(crate) use policy::PolicyResolver;

use crate::{
    error::{ErrorKind, LlmError},
    messages::{ChatCompletionRequest, ChatCompletionResponse},
};

/// Time a remote guardrail gets when its definition sets no timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// What a guardrail sees.
pub(crate) struct GuardrailInput<'a> {
    pub hook: GuardrailHook,
    pub principal: &'a Principal,
    pub request: &'a ChatCompletionRequest,
    /// Set on post-call.
    pub response: Option<&'a ChatCompletionResponse>,
}

impl GuardrailInput<'_> {
    /// The checked text: the last message before the call, the first choice after it.
    /// Multimodal content yields an empty string.
    pub fn text(&self) -> &str {
        match (self.hook, self.response) {
            (GuardrailHook::PostCall, Some(response)) => response.first_choice_text(),
            _ => self.request.last_message_text(),
        }
    }
}

/// Outcome of one check.
#[derive(Debug)]
pub(crate) enum Verdict {
    Pass,
    /// Pass, continuing with a changed request. Ignored after the call.
    Modified(Box<ChatCompletionRequest>),
    Block { reason: String },
}

/// A content check. An `Err` is an infrastructure failure, routed through the fail policy.
#[async_trait]
pub(crate) trait Guardrail: Send + Sync {
    async fn check(&self, input: GuardrailInput<'_>) -> anyhow::Result<Verdict>;
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum GuardrailError {
    #[error("Blocked by guardrail '{name}': {reason}")]
    Blocked { name: String, reason: String },
    #[error("Guardrail '{name}' failed: {message}")]
    Failed { name: String, message: String },
}

impl From<GuardrailError> for LlmError {
    fn from(error: GuardrailError) -> Self {
        match error {
            GuardrailError::Blocked { .. } => LlmError::new(ErrorKind::GuardrailBlocked, error.to_string()),
            GuardrailError::Failed { .. } => LlmError::internal(),
        }
    }
}

struct RegisteredGuardrail {
    hooks: HashSet<GuardrailHook>,
    fail_policy: FailPolicy,
    timeout: Duration,
    guardrail: Arc<dyn Guardrail>,
}

/// Every configured guardrail by name.
#[derive(Default)]
pub(crate) struct GuardrailRegistry {
    guardrails: BTreeMap<String, RegisteredGuardrail>,
}

impl GuardrailRegistry {
    pub fn from_config(config: &GuardrailsConfig, client: reqwest::Client) -> anyhow::Result<Self> {
        let mut registry = Self::default();

        for (name, definition) in &config.definitions {
            let guardrail = build(name, definition, &client).with_context(|| format!("Invalid guardrail '{name}'"))?;

            registry.register(
                name,
                definition.hooks.iter().copied(),
                definition.fail_policy,
                definition.timeout.unwrap_or(DEFAULT_TIMEOUT),
                guardrail,
            );
        }

        log::debug!("Registered {} guardrails", registry.guardrails.len());

        Ok(registry)
    }

    pub fn register(
        &mut self,
        name: &str,
        hooks: impl IntoIterator<Item = GuardrailHook>,
        fail_policy: FailPolicy,
        timeout: Duration,
        guardrail: Arc<dyn Guardrail>,
    ) {
        let registered = RegisteredGuardrail {
            hooks: hooks.into_iter().collect(),
            fail_policy,
            timeout,
            guardrail,
        };

        self.guardrails.insert(name.to_string(), registered);
    }

    pub fn is_empty(&self) -> bool {
        self.guardrails.is_empty()
    }

    /// Run the pre-call guardrails in order, returning the request later stages should use.
    pub async fn run_pre_call(
        &self,
        names: &[String],
        principal: &Principal,
        mut request: ChatCompletionRequest,
    ) -> Result<ChatCompletionRequest, GuardrailError> {
        for name in names {
            let input = GuardrailInput {
                hook: GuardrailHook::PreCall,
                principal,
                request: &request,
                response: None,
            };

            if let Some(Verdict::Modified(modified)) = self.run_one(name, input).await? {
                log::debug!("Guardrail '{name}' modified the request");
                request = *modified;
            }
        }

        Ok(request)
    }

    /// Run the post-call guardrails in order. A block replaces the response with an error.
    pub async fn run_post_call(
        &self,
        names: &[String],
        principal: &Principal,
        request: &ChatCompletionRequest,
        response: &ChatCompletionResponse,
    ) -> Result<(), GuardrailError> {
        for name in names {
            let input = GuardrailInput {
                hook: GuardrailHook::PostCall,
                principal,
                request,
                response: Some(response),
            };

            self.run_one(name, input).await?;
        }

        Ok(())
    }

    /// `Ok(None)` when the guardrail was skipped or failed open.
    async fn run_one(&self, name: &str, input: GuardrailInput<'_>) -> Result<Option<Verdict>, GuardrailError> {
        let Some(registered) = self.guardrails.get(name) else {
            log::warn!("Guardrail '{name}' is not defined, skipping");
            return Ok(None);
        };

        let hook = input.hook;

        if !registered.hooks.contains(&hook) {
            return Ok(None);
        }

        let mut recorder = Recorder::new(GUARDRAIL_CHECK_DURATION);
        recorder.push_attribute("tianji.guardrail.name", name.to_string());
        recorder.push_attribute("tianji.guardrail.hook", hook_name(hook));

        let result = match tokio::time::timeout(registered.timeout, registered.guardrail.check(input)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("timed out after {:?}", registered.timeout)),
        };

        match result {
            Ok(Verdict::Block { reason }) => {
                recorder.push_attribute("tianji.guardrail.outcome", "block");
                recorder.record();

                log::debug!("Guardrail '{name}' blocked the {} hook: {reason}", hook_name(hook));

                Err(GuardrailError::Blocked {
                    name: name.to_string(),
                    reason,
                })
            }
            Ok(verdict) => {
                recorder.push_attribute("tianji.guardrail.outcome", "pass");
                recorder.record();

                Ok(Some(verdict))
            }
            Err(error) => {
                recorder.push_attribute("tianji.guardrail.outcome", "error");
                recorder.record();

                match registered.fail_policy {
                    FailPolicy::Open => {
                        log::warn!("Guardrail '{name}' failed, continuing (fail-open): {error:#}");
                        Ok(None)
                    }
                    FailPolicy::Closed => {
                        log::error!("Guardrail '{name}' failed: {error:#}");

                        Err(GuardrailError::Failed {
                            name: name.to_string(),
                            message: format!("{error:#}"),
                        })
                    }
                }
            }
        }
    }
}

fn build(name: &str, definition: &GuardrailConfig, client: &reqwest::Client) -> anyhow::Result<Arc<dyn Guardrail>> {
    let guardrail: Arc<dyn Guardrail> = match definition.guardrail_type {
        GuardrailType::Presidio => Arc::new(presidio::Presidio::new(definition, client.clone())?),
        GuardrailType::PromptInjection => Arc::new(prompt_injection::PromptInjection::new(&definition.patterns)),
        GuardrailType::Regex => Arc::new(regex_filter::RegexFilter::new(&definition.patterns, definition.threshold)?),
        GuardrailType::ToolPermission => Arc::new(tool_permission::ToolPermission::new(&definition.allowed_tools)),
        GuardrailType::Http => Arc::new(http::HttpGuardrail::new(definition, client.clone())?),
    };

    log::debug!("Built guardrail '{name}' of type {:?}", definition.guardrail_type);

    Ok(guardrail)
}

pub(crate) fn hook_name(hook: GuardrailHook) -> &'static str {
    match hook {
        GuardrailHook::PreCall => "pre_call",
        GuardrailHook::PostCall => "post_call",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::messages::ChatMessage;

    struct Scripted {
        calls: AtomicUsize,
        outcome: fn(&GuardrailInput<'_>) -> anyhow::Result<Verdict>,
    }

    impl Scripted {
        fn new(outcome: fn(&GuardrailInput<'_>) -> anyhow::Result<Verdict>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcome,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Guardrail for Scripted {
        async fn check(&self, input: GuardrailInput<'_>) -> anyhow::Result<Verdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)(&input)
        }
    }

    fn request(text: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-4o".to_string(),
            messages: vec![ChatMessage::new("user", text)],
            ..Default::default()
        }
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn register(registry: &mut GuardrailRegistry, name: &str, fail_policy: FailPolicy, guardrail: Arc<Scripted>) {
        registry.register(
            name,
            [GuardrailHook::PreCall],
            fail_policy,
            DEFAULT_TIMEOUT,
            guardrail,
        );
    }

    #[tokio::test]
    async fn block_halts_iteration() {
        let blocker = Scripted::new(|_| {
            Ok(Verdict::Block {
                reason: "nope".to_string(),
            })
        });
        let after = Scripted::new(|_| Ok(Verdict::Pass));

        let mut registry = GuardrailRegistry::default();
        register(&mut registry, "blocker", FailPolicy::Closed, blocker.clone());
        register(&mut registry, "after", FailPolicy::Closed, after.clone());

        let error = registry
            .run_pre_call(&names(&["blocker", "after"]), &Principal::admin(String::new()), request("hi"))
            .await
            .unwrap_err();

        insta::assert_snapshot!(error, @"Blocked by guardrail 'blocker': nope");
        assert_eq!(blocker.calls(), 1);
        assert_eq!(after.calls(), 0);
    }

    #[tokio::test]
    async fn modifications_reach_later_guardrails() {
        let rewriter = Scripted::new(|input| {
            let mut request = input.request.clone();
            request.messages[0] = ChatMessage::new("user", "rewritten");

            Ok(Verdict::Modified(Box::new(request)))
        });

        let checker = Scripted::new(|input| {
            if input.text() == "rewritten" {
                Ok(Verdict::Pass)
            } else {
                Ok(Verdict::Block {
                    reason: format!("saw '{}'", input.text()),
                })
            }
        });

        let mut registry = GuardrailRegistry::default();
        register(&mut registry, "rewriter", FailPolicy::Closed, rewriter);
        register(&mut registry, "checker", FailPolicy::Closed, checker);

        let request = registry
            .run_pre_call(&names(&["rewriter", "checker"]), &Principal::admin(String::new()), request("original"))
            .await
            .unwrap();

        assert_eq!(request.last_message_text(), "rewritten");
    }

    #[tokio::test]
    async fn fail_open_continues_with_unmodified_request() {
        let flaky = Scripted::new(|_| Err(anyhow::anyhow!("vendor returned 503")));
        let after = Scripted::new(|_| Ok(Verdict::Pass));

        let mut registry = GuardrailRegistry::default();
        register(&mut registry, "flaky_vendor", FailPolicy::Open, flaky.clone());
        register(&mut registry, "after", FailPolicy::Closed, after.clone());

        let request = registry
            .run_pre_call(&names(&["flaky_vendor", "after"]), &Principal::admin(String::new()), request("hi"))
            .await
            .unwrap();

        assert_eq!(request.last_message_text(), "hi");
        assert_eq!(after.calls(), 1);
    }

    #[tokio::test]
    async fn fail_closed_is_an_internal_error() {
        let flaky = Scripted::new(|_| Err(anyhow::anyhow!("vendor returned 503")));

        let mut registry = GuardrailRegistry::default();
        register(&mut registry, "flaky_vendor", FailPolicy::Closed, flaky);

        let error = registry
            .run_pre_call(&names(&["flaky_vendor"]), &Principal::admin(String::new()), request("hi"))
            .await
            .unwrap_err();

        insta::assert_snapshot!(error, @"Guardrail 'flaky_vendor' failed: vendor returned 503");
        assert_eq!(LlmError::from(error).kind(), ErrorKind::Internal);
    }

    #[tokio::test]
    async fn hooks_filter_guardrails() {
        let pre_only = Scripted::new(|_| {
            Ok(Verdict::Block {
                reason: "nope".to_string(),
            })
        });

        let mut registry = GuardrailRegistry::default();
        register(&mut registry, "pre_only", FailPolicy::Closed, pre_only.clone());

        let response: ChatCompletionResponse = serde_json::from_str(
            r#"{"id":"c1","object":"chat.completion","created":1,"model":"gpt-4o","choices":[{"index":0,"message":{"role":"assistant","content":"hello"},"finish_reason":"stop"}]}"#,
        )
        .unwrap();

        registry
            .run_post_call(
                &names(&["pre_only", "undefined"]),
                &Principal::admin(String::new()),
                &request("hi"),
                &response,
            )
            .await
            .unwrap();

        assert_eq!(pre_only.calls(), 0);
    }
}
