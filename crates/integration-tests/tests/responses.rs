use indoc::formatdoc;
use integration_tests::{TestServer, collector::Collector, llms::OpenAIMock};
use serde_json::json;

async fn server() -> (TestServer, integration_tests::llms::Requests, Collector) {
    let (events, webhook) = Collector::spawn().await;

    let mock = OpenAIMock::new("openai");
    let requests = mock.requests();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder
        .build(&formatdoc! {r#"
            [auth]
            master_key = "sk-m"

            [[auth.keys]]
            key = "sk-alice"
            user_id = "alice"

            [[auth.keys]]
            key = "sk-bob"
            user_id = "bob"

            [llm]
            passthrough_provider = "openai"

            [hooks]
            management_webhook = "{webhook}"
        "#})
        .await;

    (server, requests, events)
}

#[tokio::test]
async fn response_ids_are_bound_to_their_owner() {
    let (server, requests, _) = server().await;
    let alice = server.client.with_key("sk-alice");

    let response = alice
        .post("/v1/responses", &json!({"model": "gpt-4o", "input": "Hi"}))
        .await;

    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    let id = body["id"].as_str().unwrap().to_string();

    let (raw_id, tag) = id.rsplit_once('.').unwrap();
    assert_eq!(raw_id, "resp_upstream_1");
    assert_eq!(tag.len(), 16);

    let response = alice.get(&format!("/v1/responses/{id}")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(requests.last().unwrap().path, "/v1/responses/resp_upstream_1");

    let forwarded = requests.len();

    let response = server.client.with_key("sk-bob").get(&format!("/v1/responses/{id}")).await;
    assert_eq!(response.status(), 403);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "response-access-denied");
    assert_eq!(requests.len(), forwarded);

    // admins may read any response
    let response = server.client.with_key("sk-m").get(&format!("/v1/responses/{id}")).await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn management_events_for_create_and_delete() {
    let (server, _, events) = server().await;
    let alice = server.client.with_key("sk-alice");

    let body: serde_json::Value = alice
        .post("/v1/responses", &json!({"model": "gpt-4o", "input": "Hi"}))
        .await
        .json()
        .await
        .unwrap();

    let id = body["id"].as_str().unwrap().to_string();

    let response = alice.get(&format!("/v1/responses/{id}")).await;
    assert_eq!(response.status(), 200);

    let response = alice.delete(&format!("/v1/responses/{id}")).await;
    assert_eq!(response.status(), 200);

    let received = events.wait_for(2).await;

    let mut summary: Vec<(String, String, String)> = received
        .iter()
        .map(|event| {
            (
                event["action"].as_str().unwrap().to_string(),
                event["object_type"].as_str().unwrap().to_string(),
                event["user_id"].as_str().unwrap().to_string(),
            )
        })
        .collect();

    summary.sort();

    insta::assert_debug_snapshot!(summary, @r#"
    [
        (
            "create",
            "response",
            "alice",
        ),
        (
            "delete",
            "response",
            "alice",
        ),
    ]
    "#);
}
