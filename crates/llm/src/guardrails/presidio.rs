//! PII redaction through a Presidio analyzer.
//!
//! Before the call every string message is analyzed and the reported spans are replaced
//! with `<REDACTED>`. After the call a response containing PII is blocked.

use anyhow::Context;
use async_trait::async_trait;
use config::{GuardrailConfig, GuardrailHook};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{Guardrail, GuardrailInput, Verdict};

const REDACTED: &str = "<REDACTED>";

pub(super) struct Presidio {
    client: reqwest::Client,
    analyze_url: Url,
    language: String,
    entities: Vec<String>,
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    text: &'a str,
    language: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    entities: &'a [String],
}

/// A detected entity. Offsets count characters.
#[derive(Debug, Clone, Deserialize)]
struct EntitySpan {
    entity_type: String,
    start: usize,
    end: usize,
}

impl Presidio {
    pub fn new(definition: &GuardrailConfig, client: reqwest::Client) -> anyhow::Result<Self> {
        let url = definition.url.as_ref().context("presidio requires `url`")?;

        let analyze_url = if url.path().ends_with('/') {
            url.join("analyze")
        } else {
            Url::parse(&format!("{url}/analyze"))
        }
        .context("invalid presidio url")?;

        Ok(Self {
            client,
            analyze_url,
            language: definition.language.clone().unwrap_or_else(|| "en".to_string()),
            entities: definition.entities.clone(),
        })
    }

    async fn analyze(&self, text: &str) -> anyhow::Result<Vec<EntitySpan>> {
        let body = AnalyzeRequest {
            text,
            language: &self.language,
            entities: &self.entities,
        };

        let response = self.client.post(self.analyze_url.clone()).json(&body).send().await?;
        let status = response.status();

        if !status.is_success() {
            anyhow::bail!("presidio analyzer returned {status}");
        }

        response
            .json()
            .await
            .context("failed to parse presidio analyzer response")
    }
}

#[async_trait]
impl Guardrail for Presidio {
    async fn check(&self, input: GuardrailInput<'_>) -> anyhow::Result<Verdict> {
        if input.hook == GuardrailHook::PostCall {
            let text = input.text();

            if text.is_empty() {
                return Ok(Verdict::Pass);
            }

            let spans = self.analyze(text).await?;

            if spans.is_empty() {
                return Ok(Verdict::Pass);
            }

            let mut types: Vec<&str> = spans.iter().map(|span| span.entity_type.as_str()).collect();
            types.sort_unstable();
            types.dedup();

            return Ok(Verdict::Block {
                reason: format!("Response contains PII: {}", types.join(", ")),
            });
        }

        let mut request = input.request.clone();
        let mut redacted = 0;

        for message in &mut request.messages {
            let Some(text) = message.text_mut().filter(|text| !text.is_empty()) else {
                continue;
            };

            let spans = self.analyze(text).await?;

            if spans.is_empty() {
                continue;
            }

            redacted += spans.len();
            *text = redact(text, spans);
        }

        if redacted == 0 {
            return Ok(Verdict::Pass);
        }

        log::debug!("Redacted {redacted} PII entities from the request");

        Ok(Verdict::Modified(Box::new(request)))
    }
}

/// Replace spans end-to-start so earlier offsets stay valid. Overlapping spans are
/// merged, out-of-range spans skipped.
fn redact(text: &str, spans: Vec<EntitySpan>) -> String {
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(index, _)| index)
        .chain(std::iter::once(text.len()))
        .collect();

    let char_count = boundaries.len() - 1;

    let mut ranges: Vec<(usize, usize)> = spans
        .into_iter()
        .filter(|span| span.start < span.end && span.end <= char_count)
        .map(|span| (span.start, span.end))
        .collect();

    ranges.sort_unstable();

    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(ranges.len());

    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start < last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }

    let mut result = text.to_string();

    for (start, end) in merged.into_iter().rev() {
        result.replace_range(boundaries[start]..boundaries[end], REDACTED);
    }

    result
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use auth::Principal;
    use axum::{Json, Router, extract::State, routing::post};
    use indoc::formatdoc;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use super::*;
    use crate::messages::{ChatCompletionRequest, ChatMessage};

    fn span(start: usize, end: usize) -> EntitySpan {
        EntitySpan {
            entity_type: "PERSON".to_string(),
            start,
            end,
        }
    }

    #[test]
    fn redaction_runs_end_to_start() {
        let text = "My name is Alice and I live in Berlin, born 1990-01-01 ok!";

        insta::assert_snapshot!(
            redact(text, vec![span(11, 16), span(31, 37)]),
            @"My name is <REDACTED> and I live in <REDACTED>, born 1990-01-01 ok!"
        );
    }

    #[test]
    fn redaction_counts_characters() {
        insta::assert_snapshot!(redact("héllo Zoë!", vec![span(6, 9)]), @"héllo <REDACTED>!");
    }

    #[test]
    fn overlapping_spans_are_merged() {
        insta::assert_snapshot!(
            redact("call 555-0100 now", vec![span(5, 13), span(9, 13), span(0, 100)]),
            @"call <REDACTED> now"
        );
    }

    type Seen = Arc<Mutex<Vec<Value>>>;

    async fn analyzer(spans: Value) -> (Presidio, Seen) {
        let seen = Seen::default();

        let app = Router::new()
            .route(
                "/analyze",
                post(|State((seen, spans)): State<(Seen, Value)>, Json(body): Json<Value>| async move {
                    let text = body["text"].as_str().unwrap_or_default().to_string();
                    seen.lock().unwrap().push(body);

                    if text.contains("Alice") { Json(spans) } else { Json(json!([])) }
                }),
            )
            .with_state((seen.clone(), spans));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let definition: GuardrailConfig = toml::from_str(&formatdoc! {r#"
            type = "presidio"
            url = "http://{address}"
            entities = ["PERSON"]
        "#})
        .unwrap();

        (Presidio::new(&definition, reqwest::Client::new()).unwrap(), seen)
    }

    #[tokio::test]
    async fn every_message_is_redacted() {
        let (presidio, seen) = analyzer(
            json!([{"entity_type": "PERSON", "start": 11, "end": 16, "score": 0.85}]),
        )
        .await;

        let request = ChatCompletionRequest {
            model: "gpt-4o".to_string(),
            messages: vec![
                ChatMessage::new("system", "My name is Alice, the operator."),
                ChatMessage::new("user", "hello there"),
            ],
            ..Default::default()
        };

        let principal = Principal::admin(String::new());

        let input = GuardrailInput {
            hook: GuardrailHook::PreCall,
            principal: &principal,
            request: &request,
            response: None,
        };

        let Verdict::Modified(modified) = presidio.check(input).await.unwrap() else {
            unreachable!("expected a redacted request");
        };

        assert_eq!(modified.messages[0].text(), Some("My name is <REDACTED>, the operator."));
        assert_eq!(modified.messages[1].text(), Some("hello there"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);

        assert_eq!(seen[0]["text"], "My name is Alice, the operator.");
        assert_eq!(seen[0]["language"], "en");
        assert_eq!(seen[0]["entities"], json!(["PERSON"]));
    }

    #[tokio::test]
    async fn analyzer_errors_are_failures() {
        let presidio = Presidio {
            client: reqwest::Client::new(),
            analyze_url: Url::parse("http://127.0.0.1:1/analyze").unwrap(),
            language: "en".to_string(),
            entities: Vec::new(),
        };

        let request = ChatCompletionRequest {
            messages: vec![ChatMessage::new("user", "hi")],
            ..Default::default()
        };

        let principal = Principal::admin(String::new());

        let input = GuardrailInput {
            hook: GuardrailHook::PreCall,
            principal: &principal,
            request: &request,
            response: None,
        };

        assert!(presidio.check(input).await.is_err());
    }
}
