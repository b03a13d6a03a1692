use std::time::Duration;

use indoc::indoc;
use integration_tests::{TestServer, llms::OpenAIMock, metric_line, metric_value, sse_payloads};
use serde_json::json;

const MASTER: &str = indoc! {r#"
    [auth]
    master_key = "sk-m"
"#};

fn hello(model: &str) -> serde_json::Value {
    json!({"model": model, "messages": [{"role": "user", "content": "Hello"}]})
}

#[tokio::test]
async fn completion_with_master_key() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(OpenAIMock::new("openai")).await;

    let server = builder.build(MASTER).await;
    let (status, body) = server.client.with_key("sk-m").completions(&hello("gpt-4o")).await;

    assert_eq!(status, 200);

    insta::assert_json_snapshot!(body, { ".id" => "[id]" }, @r#"
    {
      "id": "[id]",
      "object": "chat.completion",
      "created": 1677651200,
      "model": "gpt-4o",
      "choices": [
        {
          "index": 0,
          "message": {
            "role": "assistant",
            "content": "Hello! I'm a test LLM assistant."
          },
          "finish_reason": "stop"
        }
      ],
      "usage": {
        "prompt_tokens": 10,
        "completion_tokens": 15,
        "total_tokens": 25
      }
    }
    "#);

    let hash = telemetry::api_key_hash("sk-m");
    let labels = [
        "status=\"success\"".to_string(),
        "model=\"gpt-4o\"".to_string(),
        format!("api_key_hash=\"{hash}\""),
    ];
    let labels: Vec<&str> = labels.iter().map(String::as_str).collect();

    // records are dispatched after the response is written
    let mut requests = None;

    for _ in 0..50 {
        let text = server.metrics().await;

        if let Some(line) = metric_line(&text, "requests_total{", &labels) {
            requests = Some(metric_value(line));
            break;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(requests, Some(1.0));
}

#[tokio::test]
async fn alias_is_renamed_upstream() {
    let mock = OpenAIMock::new("openai").with_alias("fast", "gpt-4o-mini");
    let requests = mock.requests();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build(MASTER).await;
    let (status, body) = server.client.with_key("sk-m").completions(&hello("fast")).await;

    assert_eq!(status, 200);
    assert_eq!(body["model"], "fast");

    let upstream = requests.last().unwrap();
    assert_eq!(upstream.path, "/v1/chat/completions");
    assert_eq!(upstream.body["model"], "gpt-4o-mini");
    assert_eq!(upstream.headers["authorization"], "Bearer test-key");
}

#[tokio::test]
async fn provider_prefixed_model() {
    let mock = OpenAIMock::new("openai");
    let requests = mock.requests();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build(MASTER).await;
    let (status, body) = server.client.with_key("sk-m").completions(&hello("openai/gpt-4o")).await;

    assert_eq!(status, 200);
    assert_eq!(body["model"], "openai/gpt-4o");
    assert_eq!(requests.last().unwrap().body["model"], "gpt-4o");
}

#[tokio::test]
async fn missing_credential() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(OpenAIMock::new("openai")).await;

    let server = builder.build(MASTER).await;
    let (status, body) = server.client.completions(&hello("gpt-4o")).await;

    assert_eq!(status, 401);
    assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn blocked_key_never_reaches_upstream() {
    let config = indoc! {r#"
        [[auth.keys]]
        key = "sk-blocked"
        user_id = "mallory"
        blocked = true
    "#};

    let mock = OpenAIMock::new("openai");
    let requests = mock.requests();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build(config).await;
    let (status, body) = server.client.with_key("sk-blocked").completions(&hello("gpt-4o")).await;

    assert_eq!(status, 403);
    assert_eq!(body["error"]["type"], "permission_denied");
    assert!(requests.is_empty());
}

#[tokio::test]
async fn unknown_model() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(OpenAIMock::new("openai")).await;

    let server = builder.build(MASTER).await;
    let (status, body) = server.client.with_key("sk-m").completions(&hello("gpt-9")).await;

    assert_eq!(status, 404);
    assert_eq!(body["error"]["type"], "not_found_error");
    assert_eq!(body["error"]["param"], "model");
}

#[tokio::test]
async fn malformed_body() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(OpenAIMock::new("openai")).await;

    let server = builder.build(MASTER).await;
    let (status, body) = server
        .client
        .with_key("sk-m")
        .completions(&json!({"model": "gpt-4o", "messages": "not a list"}))
        .await;

    assert_eq!(status, 400);
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn upstream_errors_are_mapped() {
    let mock = OpenAIMock::new("openai").with_error(429, json!({"error": {"message": "Slow down"}}));

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build(MASTER).await;
    let (status, body) = server.client.with_key("sk-m").completions(&hello("gpt-4o")).await;

    assert_eq!(status, 429);
    assert_eq!(body["error"]["type"], "rate_limit_error");
    assert_eq!(body["error"]["message"], "Slow down");
}

#[tokio::test]
async fn streamed_completion() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(OpenAIMock::new("openai").with_alias("fast", "gpt-4o-mini")).await;

    let server = builder.build(MASTER).await;

    let mut request = hello("fast");
    request["stream"] = json!(true);

    let response = server.client.with_key("sk-m").post("/v1/chat/completions", &request).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let body = response.text().await.unwrap();
    assert!(body.trim_end().ends_with("data: [DONE]"), "{body}");

    let chunks = sse_payloads(&body);
    assert!(chunks.iter().all(|chunk| chunk["model"] == "fast"));

    let content: String = chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str())
        .collect();

    assert_eq!(content, "Hello world");
}

#[tokio::test]
async fn models_visible_to_key() {
    let config = indoc! {r#"
        [auth]
        master_key = "sk-m"

        [[auth.keys]]
        key = "sk-limited"
        allowed_models = ["fast"]
    "#};

    let mut builder = TestServer::builder();
    builder.spawn_llm(OpenAIMock::new("openai").with_alias("fast", "gpt-4o-mini")).await;

    let server = builder.build(config).await;

    let ids = |body: serde_json::Value| -> Vec<String> {
        body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|model| model["id"].as_str().unwrap().to_string())
            .collect()
    };

    let all = server.client.with_key("sk-m").get("/v1/models").await;
    insta::assert_debug_snapshot!(ids(all.json().await.unwrap()), @r#"
    [
        "fast",
        "gpt-4o",
    ]
    "#);

    let limited = server.client.with_key("sk-limited").get("/v1/models").await;
    insta::assert_debug_snapshot!(ids(limited.json().await.unwrap()), @r#"
    [
        "fast",
    ]
    "#);

    let (status, _) = server.client.with_key("sk-limited").completions(&hello("gpt-4o")).await;
    assert_eq!(status, 403);
}
