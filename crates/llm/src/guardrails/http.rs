//! A guardrail vendor reached over HTTP.
//!
//! The vendor receives `{"hook", "text", "request"}` and answers
//! `{"action": "pass" | "block", "reason"?, "modified_text"?}`.

use anyhow::Context;
use async_trait::async_trait;
use config::{GuardrailConfig, GuardrailHook};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{Guardrail, GuardrailInput, Verdict, hook_name};
use crate::messages::{ChatCompletionRequest, MessageContent};

pub(super) struct HttpGuardrail {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
}

#[derive(Serialize)]
struct CheckRequest<'a> {
    hook: &'static str,
    text: &'a str,
    request: &'a ChatCompletionRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Action {
    Pass,
    Block,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    action: Action,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    modified_text: Option<String>,
}

impl HttpGuardrail {
    pub fn new(definition: &GuardrailConfig, client: reqwest::Client) -> anyhow::Result<Self> {
        let url = definition.url.clone().context("http guardrails require `url`")?;
        let mut headers = HeaderMap::new();

        for (name, value) in &definition.headers {
            let name = HeaderName::try_from(name.as_str()).with_context(|| format!("invalid header name '{name}'"))?;
            let mut value = HeaderValue::try_from(value.as_str()).with_context(|| format!("invalid value for header '{name}'"))?;

            value.set_sensitive(true);
            headers.insert(name, value);
        }

        Ok(Self { client, url, headers })
    }
}

#[async_trait]
impl Guardrail for HttpGuardrail {
    async fn check(&self, input: GuardrailInput<'_>) -> anyhow::Result<Verdict> {
        let body = CheckRequest {
            hook: hook_name(input.hook),
            text: input.text(),
            request: input.request,
        };

        let response = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .json(&body)
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            anyhow::bail!("guardrail vendor returned {status}");
        }

        let verdict: CheckResponse = response.json().await.context("failed to parse guardrail vendor response")?;

        match verdict {
            CheckResponse {
                action: Action::Block,
                reason,
                ..
            } => Ok(Verdict::Block {
                reason: reason.unwrap_or_else(|| "Content rejected".to_string()),
            }),
            CheckResponse {
                action: Action::Pass,
                modified_text: Some(text),
                ..
            } if input.hook == GuardrailHook::PreCall => {
                let mut request = input.request.clone();

                if let Some(last) = request.messages.last_mut() {
                    last.content = Some(MessageContent::Text(text));
                }

                Ok(Verdict::Modified(Box::new(request)))
            }
            CheckResponse { .. } => Ok(Verdict::Pass),
        }
    }
}
