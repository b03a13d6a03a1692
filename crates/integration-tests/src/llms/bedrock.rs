use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use super::openai::{Recorded, Requests};
use super::provider::{LlmProviderConfig, ProviderType, TestLlmProvider};

/// Mock AWS Bedrock Converse API for testing
pub struct BedrockMock {
    name: String,
    models: Vec<(String, Option<String>)>,
    requests: Requests,
    error: Option<(StatusCode, Value)>,
}

impl BedrockMock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            models: vec![(
                "claude".to_string(),
                Some("anthropic.claude-3-5-sonnet-20240620-v1:0".to_string()),
            )],
            requests: Requests::default(),
            error: None,
        }
    }

    /// Answer every call with the given status and body
    pub fn with_error(mut self, status: u16, body: Value) -> Self {
        self.error = Some((StatusCode::from_u16(status).unwrap(), body));
        self
    }

    /// Handle to the requests this mock receives
    pub fn requests(&self) -> Requests {
        self.requests.clone()
    }
}

struct MockState {
    requests: Requests,
    error: Option<(StatusCode, Value)>,
}

impl TestLlmProvider for BedrockMock {
    async fn spawn(self: Box<Self>) -> anyhow::Result<LlmProviderConfig> {
        let state = Arc::new(MockState {
            requests: self.requests,
            error: self.error,
        });

        let app = Router::new()
            .route("/model/{model}/converse", post(converse))
            .route("/model/{model}/converse-stream", post(converse_stream))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Ok(LlmProviderConfig {
            name: self.name,
            address,
            provider_type: ProviderType::Bedrock,
            models: self.models,
            model_settings: None,
        })
    }
}

fn record(state: &MockState, uri: &Uri, headers: HeaderMap, body: &[u8]) {
    state.requests.push(Recorded {
        path: uri.to_string(),
        headers,
        body: serde_json::from_slice(body).unwrap_or(Value::Null),
    });
}

async fn converse(
    State(state): State<Arc<MockState>>,
    Path(_model): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    record(&state, &uri, headers, &body);

    if let Some((status, error)) = &state.error {
        return (*status, Json(error.clone())).into_response();
    }

    Json(json!({
        "output": {"message": {"role": "assistant", "content": [{"text": "Hello from Bedrock"}]}},
        "stopReason": "end_turn",
        "usage": {"inputTokens": 12, "outputTokens": 4, "totalTokens": 16}
    }))
    .into_response()
}

async fn converse_stream(
    State(state): State<Arc<MockState>>,
    Path(_model): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    record(&state, &uri, headers, &body);

    if let Some((status, error)) = &state.error {
        return (*status, Json(error.clone())).into_response();
    }

    let mut stream = Vec::new();
    stream.extend(event("messageStart", r#"{"role":"assistant"}"#));
    stream.extend(event("contentBlockDelta", r#"{"contentBlockIndex":0,"delta":{"text":"Hello"}}"#));
    stream.extend(event("contentBlockDelta", r#"{"contentBlockIndex":0,"delta":{"text":" from Bedrock"}}"#));
    stream.extend(event("contentBlockStop", r#"{"contentBlockIndex":0}"#));
    stream.extend(event("messageStop", r#"{"stopReason":"end_turn"}"#));
    stream.extend(event(
        "metadata",
        r#"{"usage":{"inputTokens":12,"outputTokens":4,"totalTokens":16}}"#,
    ));

    ([(header::CONTENT_TYPE, "application/vnd.amazon.eventstream")], stream).into_response()
}

/// One AWS event-stream message with string headers.
fn event(event_type: &str, payload: &str) -> Vec<u8> {
    let headers = [
        (":message-type", "event"),
        (":event-type", event_type),
        (":content-type", "application/json"),
    ];

    let mut encoded_headers = Vec::new();

    for (name, value) in headers {
        encoded_headers.push(name.len() as u8);
        encoded_headers.extend_from_slice(name.as_bytes());
        encoded_headers.push(7);
        encoded_headers.extend_from_slice(&(value.len() as u16).to_be_bytes());
        encoded_headers.extend_from_slice(value.as_bytes());
    }

    let total_len = 12 + encoded_headers.len() + payload.len() + 4;

    let mut message = Vec::with_capacity(total_len);
    message.extend_from_slice(&(total_len as u32).to_be_bytes());
    message.extend_from_slice(&(encoded_headers.len() as u32).to_be_bytes());

    let prelude_crc = crc32fast::hash(&message);
    message.extend_from_slice(&prelude_crc.to_be_bytes());
    message.extend_from_slice(&encoded_headers);
    message.extend_from_slice(payload.as_bytes());

    let message_crc = crc32fast::hash(&message);
    message.extend_from_slice(&message_crc.to_be_bytes());

    message
}
