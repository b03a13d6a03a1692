use std::time::{Duration, Instant};

use indoc::indoc;
use integration_tests::{TestServer, llms::OpenAIMock};
use serde_json::{Value, json};

fn request() -> Value {
    json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]})
}

fn header<'a>(response: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).map(|value| value.to_str().unwrap())
}

#[tokio::test]
async fn rpm_limit_of_a_key() {
    let config = indoc! {r#"
        [[auth.keys]]
        key = "sk-once"
        rpm_limit = 1
    "#};

    let mut builder = TestServer::builder();
    builder.spawn_llm(OpenAIMock::new("openai")).await;

    let server = builder.build(config).await;
    let client = server.client.with_key("sk-once");

    let response = client.post("/v1/chat/completions", &request()).await;
    assert_eq!(response.status(), 200);

    assert_eq!(header(&response, "x-ratelimit-limit-requests"), Some("1"));
    assert_eq!(header(&response, "x-ratelimit-remaining-requests"), Some("0"));
    assert_eq!(header(&response, "x-ratelimit-reset-requests"), Some("60s"));
    assert_eq!(header(&response, "x-ratelimit-limit-tokens"), None);

    let response = client.post("/v1/chat/completions", &request()).await;
    assert_eq!(response.status(), 429);
    assert_eq!(header(&response, "retry-after"), Some("60"));

    let body: Value = response.json().await.unwrap();

    insta::assert_json_snapshot!(body, @r#"
    {
      "error": {
        "message": "Rate limit exceeded: 1 requests per minute",
        "type": "rate_limit_error",
        "code": "rate-limit"
      }
    }
    "#);
}

#[tokio::test]
async fn tpm_limit_counts_actual_usage() {
    let config = indoc! {r#"
        [[auth.keys]]
        key = "sk-tokens"
        tpm_limit = 20
    "#};

    let mock = OpenAIMock::new("openai");
    let requests = mock.requests();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build(config).await;
    let client = server.client.with_key("sk-tokens");

    // eight tokens projected for the prompt, 25 reported by the upstream
    let response = client.post("/v1/chat/completions", &request()).await;
    assert_eq!(response.status(), 200);

    assert_eq!(header(&response, "x-ratelimit-limit-tokens"), Some("20"));
    assert_eq!(header(&response, "x-ratelimit-remaining-tokens"), Some("12"));
    assert_eq!(header(&response, "x-ratelimit-limit-requests"), None);

    let (status, body) = client.completions(&request()).await;
    assert_eq!(status, 429);

    insta::assert_json_snapshot!(body, @r#"
    {
      "error": {
        "message": "Rate limit exceeded: 20 tokens per minute for model gpt-4o",
        "type": "rate_limit_error",
        "code": "rate-limit"
      }
    }
    "#);

    assert_eq!(requests.len(), 1);
}

#[tokio::test]
async fn key_budget_blocks_after_spend() {
    let config = indoc! {r#"
        [[auth.keys]]
        key = "sk-budget"
        max_budget = 5.0
    "#};

    let mock = OpenAIMock::new("openai").with_model_settings(indoc! {r#"
        input_cost_per_token = 0.5
        output_cost_per_token = 0.25
    "#});

    let requests = mock.requests();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build(config).await;
    let client = server.client.with_key("sk-budget");

    let (status, _) = client.completions(&request()).await;
    assert_eq!(status, 200);

    // 10 prompt tokens at 0.5 plus 15 completion tokens at 0.25
    let (status, body) = client.completions(&request()).await;
    assert_eq!(status, 429);

    insta::assert_json_snapshot!(body, @r#"
    {
      "error": {
        "message": "Budget exceeded for key: current spend 8.75 reached max budget 5",
        "type": "budget_exceeded",
        "code": "budget-exceeded"
      }
    }
    "#);

    assert_eq!(requests.len(), 1);
}

#[tokio::test]
async fn model_budget_resets_on_schedule() {
    let config = indoc! {r#"
        [[auth.keys]]
        key = "sk-user"

        [llm]
        budget_reset_interval = "1s"
    "#};

    let mock = OpenAIMock::new("openai").with_model_settings(indoc! {r#"
        input_cost_per_token = 0.5
        output_cost_per_token = 0.25
        max_budget = 5.0
    "#});

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build(config).await;
    let client = server.client.with_key("sk-user");

    let (status, _) = client.completions(&request()).await;
    assert_eq!(status, 200);

    // a reset may land between the first two calls
    let mut rejection = None;

    for _ in 0..3 {
        let (status, body) = client.completions(&request()).await;

        if status == 429 {
            rejection = Some(body);
            break;
        }
    }

    let Some(body) = rejection else {
        unreachable!("the model budget never blocked a call");
    };

    assert_eq!(
        body["error"]["message"],
        "Budget exceeded for model gpt-4o: current spend 8.75 reached max budget 5"
    );
    assert_eq!(body["error"]["code"], "budget-exceeded");

    let started = Instant::now();
    let mut admitted = false;

    while started.elapsed() < Duration::from_secs(5) {
        let (status, _) = client.completions(&request()).await;

        if status == 200 {
            admitted = true;
            break;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(admitted, "the model budget was never reset");
}
