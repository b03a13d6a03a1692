use async_trait::async_trait;
use config::GuardrailHook;

use super::{Guardrail, GuardrailInput, Verdict};

/// Tools offered to or called by the model must be allowed. `*` allows every tool,
/// `prefix_*` every tool starting with `prefix_`.
pub(super) struct ToolPermission {
    allowed: Vec<String>,
}

impl ToolPermission {
    pub fn new(allowed: &[String]) -> Self {
        Self {
            allowed: allowed.to_vec(),
        }
    }

    fn is_allowed(&self, tool: &str) -> bool {
        self.allowed.iter().any(|allowed| match allowed.strip_suffix('*') {
            Some(prefix) => tool.starts_with(prefix),
            None => allowed == tool,
        })
    }
}

#[async_trait]
impl Guardrail for ToolPermission {
    async fn check(&self, input: GuardrailInput<'_>) -> anyhow::Result<Verdict> {
        let called = input
            .response
            .filter(|_| input.hook == GuardrailHook::PostCall)
            .into_iter()
            .flat_map(|response| response.choices.iter())
            .flat_map(|choice| choice.message.tool_calls.iter().flatten())
            .map(|call| call.function.name.as_str());

        let mut tools = input.request.tool_names().chain(called);

        match tools.find(|tool| !self.is_allowed(tool)) {
            Some(tool) => Ok(Verdict::Block {
                reason: format!("Tool '{tool}' is not allowed"),
            }),
            None => Ok(Verdict::Pass),
        }
    }
}

#[cfg(test)]
mod tests {
    use auth::Principal;

    use super::*;
    use crate::messages::{ChatCompletionRequest, ChatCompletionResponse};

    fn request() -> ChatCompletionRequest {
        serde_json::from_str(
            r#"{
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}],
                "tools": [
                    {"type": "function", "function": {"name": "search_web"}},
                    {"type": "function", "function": {"name": "get_weather"}}
                ]
            }"#,
        )
        .unwrap()
    }

    async fn verdict(allowed: &[&str], response: Option<&ChatCompletionResponse>) -> Verdict {
        let allowed: Vec<String> = allowed.iter().map(|tool| tool.to_string()).collect();
        let guardrail = ToolPermission::new(&allowed);
        let principal = Principal::admin(String::new());
        let request = request();

        let input = GuardrailInput {
            hook: if response.is_some() {
                GuardrailHook::PostCall
            } else {
                GuardrailHook::PreCall
            },
            principal: &principal,
            request: &request,
            response,
        };

        guardrail.check(input).await.unwrap()
    }

    #[tokio::test]
    async fn wildcards() {
        assert!(matches!(verdict(&["*"], None).await, Verdict::Pass));
        assert!(matches!(verdict(&["search_*", "get_weather"], None).await, Verdict::Pass));

        insta::assert_debug_snapshot!(verdict(&["search_*"], None).await, @r#"
        Block {
            reason: "Tool 'get_weather' is not allowed",
        }
        "#);
    }

    #[tokio::test]
    async fn called_tools_are_checked_after_the_call() {
        let response: ChatCompletionResponse = serde_json::from_str(
            r#"{"id":"c1","object":"chat.completion","created":1,"model":"gpt-4o","choices":[{"index":0,"message":{"role":"assistant","tool_calls":[{"id":"call_1","type":"function","function":{"name":"delete_files","arguments":"{}"}}]},"finish_reason":"tool_calls"}]}"#,
        )
        .unwrap();

        let verdict = verdict(&["search_*", "get_weather"], Some(&response)).await;
        assert!(matches!(verdict, Verdict::Block { ref reason } if reason == "Tool 'delete_files' is not allowed"));
    }
}
