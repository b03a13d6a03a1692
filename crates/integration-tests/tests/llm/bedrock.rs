use indoc::indoc;
use integration_tests::{TestServer, llms::BedrockMock, sse_payloads};
use serde_json::json;

const MASTER: &str = indoc! {r#"
    [auth]
    master_key = "sk-m"
"#};

#[tokio::test]
async fn converse_translated_to_chat_completion() {
    let mock = BedrockMock::new("bedrock");
    let requests = mock.requests();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build(MASTER).await;
    let (status, body) = server
        .client
        .with_key("sk-m")
        .completions(&json!({
            "model": "claude",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "Hello"}
            ]
        }))
        .await;

    assert_eq!(status, 200);
    assert_eq!(body["model"], "claude");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello from Bedrock");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");

    insta::assert_json_snapshot!(body["usage"], @r#"
    {
      "prompt_tokens": 12,
      "completion_tokens": 4,
      "total_tokens": 16
    }
    "#);

    let upstream = requests.last().unwrap();
    assert_eq!(upstream.path, "/model/anthropic.claude-3-5-sonnet-20240620-v1:0/converse");
    assert_eq!(upstream.body["system"][0]["text"], "Be brief.");
}

#[tokio::test]
async fn converse_stream() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(BedrockMock::new("bedrock")).await;

    let server = builder.build(MASTER).await;

    let response = server
        .client
        .with_key("sk-m")
        .post(
            "/v1/chat/completions",
            &json!({"model": "claude", "stream": true, "messages": [{"role": "user", "content": "Hello"}]}),
        )
        .await;

    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();
    let chunks = sse_payloads(&body);

    let content: String = chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str())
        .collect();

    assert_eq!(content, "Hello from Bedrock");
    assert!(chunks.iter().all(|chunk| chunk["model"] == "claude"));
    assert!(body.trim_end().ends_with("data: [DONE]"), "{body}");
}

#[tokio::test]
async fn throttling_is_a_rate_limit() {
    let mock = BedrockMock::new("bedrock").with_error(429, json!({"message": "Too many tokens, please wait."}));

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build(MASTER).await;
    let (status, body) = server
        .client
        .with_key("sk-m")
        .completions(&json!({"model": "claude", "messages": [{"role": "user", "content": "Hello"}]}))
        .await;

    assert_eq!(status, 429);
    assert_eq!(body["error"]["type"], "rate_limit_error");
    assert_eq!(body["error"]["message"], "Too many tokens, please wait.");
}
