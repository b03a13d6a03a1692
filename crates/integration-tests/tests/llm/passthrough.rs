use indoc::indoc;
use integration_tests::{TestServer, llms::OpenAIMock};
use serde_json::json;

const MASTER: &str = indoc! {r#"
    [auth]
    master_key = "sk-m"
"#};

#[tokio::test]
async fn embeddings_use_the_upstream_model() {
    let mock = OpenAIMock::new("openai").with_alias("embed", "text-embedding-3-small");
    let requests = mock.requests();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build(MASTER).await;
    let response = server
        .client
        .with_key("sk-m")
        .post("/v1/embeddings", &json!({"model": "embed", "input": "hello"}))
        .await;

    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["data"][0]["embedding"], json!([0.1, 0.2, 0.3]));

    let upstream = requests.last().unwrap();
    assert_eq!(upstream.path, "/v1/embeddings");
    assert_eq!(upstream.body["model"], "text-embedding-3-small");
    assert_eq!(upstream.body["input"], "hello");
}

#[tokio::test]
async fn resources_go_to_the_passthrough_provider() {
    let config = indoc! {r#"
        [auth]
        master_key = "sk-m"

        [llm]
        passthrough_provider = "openai"
    "#};

    let mock = OpenAIMock::new("openai");
    let requests = mock.requests();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build(config).await;
    let response = server.client.with_key("sk-m").get("/v1/files?purpose=batch").await;

    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["data"][0]["id"], "file-1");

    assert_eq!(requests.last().unwrap().path, "/v1/files?purpose=batch");
}

#[tokio::test]
async fn resources_without_a_provider() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(OpenAIMock::new("openai")).await;

    let server = builder.build(MASTER).await;
    let response = server.client.with_key("sk-m").get("/v1/files").await;

    assert_eq!(response.status(), 400);

    let body: serde_json::Value = response.json().await.unwrap();
    insta::assert_json_snapshot!(body, @r#"
    {
      "error": {
        "message": "No provider is configured to serve /v1/files",
        "type": "invalid_request_error",
        "code": "invalid-request"
      }
    }
    "#);
}

#[tokio::test]
async fn passthrough_requires_a_credential() {
    let mock = OpenAIMock::new("openai");
    let requests = mock.requests();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build(MASTER).await;
    let response = server
        .client
        .post("/v1/embeddings", &json!({"model": "gpt-4o", "input": "hello"}))
        .await;

    assert_eq!(response.status(), 401);
    assert!(requests.is_empty());
}
