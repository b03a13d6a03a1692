use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;

use super::{Guardrail, GuardrailInput, Verdict};

/// Blocks content once the patterns match `threshold` times in total.
pub(super) struct RegexFilter {
    patterns: Vec<Regex>,
    threshold: usize,
}

impl RegexFilter {
    pub fn new(patterns: &[String], threshold: Option<usize>) -> anyhow::Result<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| Regex::new(pattern).with_context(|| format!("invalid pattern '{pattern}'")))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            patterns,
            threshold: threshold.unwrap_or(1).max(1),
        })
    }
}

#[async_trait]
impl Guardrail for RegexFilter {
    async fn check(&self, input: GuardrailInput<'_>) -> anyhow::Result<Verdict> {
        let text = input.text();

        let matches: usize = self
            .patterns
            .iter()
            .map(|pattern| pattern.find_iter(text).count())
            .sum();

        if matches >= self.threshold {
            return Ok(Verdict::Block {
                reason: format!("Content matched {matches} restricted patterns"),
            });
        }

        Ok(Verdict::Pass)
    }
}

#[cfg(test)]
mod tests {
    use auth::Principal;
    use config::GuardrailHook;

    use super::*;
    use crate::messages::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage};

    fn patterns() -> Vec<String> {
        vec![r"\b\d{3}-\d{2}-\d{4}\b".to_string(), r"(?i)confidential".to_string()]
    }

    #[tokio::test]
    async fn threshold_counts_all_matches() {
        let guardrail = RegexFilter::new(&patterns(), Some(2)).unwrap();
        let principal = Principal::admin(String::new());

        let once = ChatCompletionRequest {
            messages: vec![ChatMessage::new("user", "this is Confidential")],
            ..Default::default()
        };

        let input = GuardrailInput {
            hook: GuardrailHook::PreCall,
            principal: &principal,
            request: &once,
            response: None,
        };

        assert!(matches!(guardrail.check(input).await.unwrap(), Verdict::Pass));

        let twice = ChatCompletionRequest {
            messages: vec![ChatMessage::new("user", "confidential: 123-45-6789")],
            ..Default::default()
        };

        let input = GuardrailInput {
            hook: GuardrailHook::PreCall,
            principal: &principal,
            request: &twice,
            response: None,
        };

        insta::assert_debug_snapshot!(guardrail.check(input).await.unwrap(), @r#"
        Block {
            reason: "Content matched 2 restricted patterns",
        }
        "#);
    }

    #[tokio::test]
    async fn post_call_checks_the_response() {
        let guardrail = RegexFilter::new(&patterns(), None).unwrap();
        let principal = Principal::admin(String::new());

        let request = ChatCompletionRequest {
            messages: vec![ChatMessage::new("user", "confidential")],
            ..Default::default()
        };

        let response: ChatCompletionResponse = serde_json::from_str(
            r#"{"id":"c1","object":"chat.completion","created":1,"model":"m","choices":[{"index":0,"message":{"role":"assistant","content":"nothing to see"},"finish_reason":"stop"}]}"#,
        )
        .unwrap();

        let input = GuardrailInput {
            hook: GuardrailHook::PostCall,
            principal: &principal,
            request: &request,
            response: Some(&response),
        };

        assert!(matches!(guardrail.check(input).await.unwrap(), Verdict::Pass));
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        let error = RegexFilter::new(&["(unclosed".to_string()], None).err().unwrap();
        insta::assert_snapshot!(error, @"invalid pattern '(unclosed'");
    }
}
