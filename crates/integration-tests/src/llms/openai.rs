use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use super::provider::{LlmProviderConfig, ProviderType, TestLlmProvider};

type HeaderFn = dyn Fn(usize) -> Vec<(&'static str, String)> + Send + Sync;

/// A request as the mock received it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Value,
}

/// Requests received by a mock, shared with the test.
#[derive(Clone, Default)]
pub struct Requests(Arc<Mutex<Vec<Recorded>>>);

impl Requests {
    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Recorded> {
        self.0.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Recorded> {
        self.0.lock().unwrap().last().cloned()
    }

    pub(crate) fn push(&self, recorded: Recorded) {
        self.0.lock().unwrap().push(recorded);
    }
}

/// Builder for an OpenAI compatible test upstream
pub struct OpenAIMock {
    name: String,
    models: Vec<(String, Option<String>)>,
    requests: Requests,
    response_headers: Option<Box<HeaderFn>>,
    slow_trigger: Option<(String, Duration)>,
    error: Option<(StatusCode, Value)>,
    model_settings: Option<String>,
}

impl OpenAIMock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            models: vec![("gpt-4o".to_string(), None)],
            requests: Requests::default(),
            response_headers: None,
            slow_trigger: None,
            error: None,
            model_settings: None,
        }
    }

    /// Replace the configured models by public names served under the same upstream name
    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|model| (model.to_string(), None)).collect();
        self
    }

    /// Add a public model name renamed to `upstream` before the call
    pub fn with_alias(mut self, alias: impl Into<String>, upstream: impl Into<String>) -> Self {
        self.models.push((alias.into(), Some(upstream.into())));
        self
    }

    /// Headers sent with the n-th (zero based) chat completion response
    pub fn with_response_headers(
        mut self,
        headers: impl Fn(usize) -> Vec<(&'static str, String)> + Send + Sync + 'static,
    ) -> Self {
        self.response_headers = Some(Box::new(headers));
        self
    }

    /// Hold completions whose messages contain `trigger` for `delay`
    pub fn with_slow_response(mut self, trigger: impl Into<String>, delay: Duration) -> Self {
        self.slow_trigger = Some((trigger.into(), delay));
        self
    }

    /// Answer every completion with the given status and body
    pub fn with_error(mut self, status: u16, body: Value) -> Self {
        self.error = Some((StatusCode::from_u16(status).unwrap(), body));
        self
    }

    /// TOML lines added to the table of every configured model
    pub fn with_model_settings(mut self, settings: impl Into<String>) -> Self {
        self.model_settings = Some(settings.into());
        self
    }

    /// Handle to the requests this mock receives
    pub fn requests(&self) -> Requests {
        self.requests.clone()
    }
}

struct MockState {
    requests: Requests,
    completions: AtomicUsize,
    response_headers: Option<Box<HeaderFn>>,
    slow_trigger: Option<(String, Duration)>,
    error: Option<(StatusCode, Value)>,
}

impl TestLlmProvider for OpenAIMock {
    async fn spawn(self: Box<Self>) -> anyhow::Result<LlmProviderConfig> {
        let state = Arc::new(MockState {
            requests: self.requests,
            completions: AtomicUsize::new(0),
            response_headers: self.response_headers,
            slow_trigger: self.slow_trigger,
            error: self.error,
        });

        let app = Router::new()
            .route("/v1/chat/completions", post(chat_completions))
            .route("/v1/embeddings", post(embeddings))
            .route("/v1/responses", post(create_response))
            .route("/v1/responses/{id}", get(response).delete(delete_response))
            .route("/v1/files", get(files))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Ok(LlmProviderConfig {
            name: self.name,
            address,
            provider_type: ProviderType::OpenAI,
            models: self.models,
            model_settings: self.model_settings,
        })
    }
}

fn record(state: &MockState, uri: &Uri, headers: HeaderMap, body: &[u8]) -> Value {
    let body = serde_json::from_slice(body).unwrap_or(Value::Null);

    state.requests.push(Recorded {
        path: uri.to_string(),
        headers,
        body: body.clone(),
    });

    body
}

fn message_text(body: &Value) -> String {
    body["messages"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|message| message["content"].as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

async fn chat_completions(State(state): State<Arc<MockState>>, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    let body = record(&state, &uri, headers, &body);
    let index = state.completions.fetch_add(1, Ordering::SeqCst);

    if let Some((status, error)) = &state.error {
        return (*status, Json(error.clone())).into_response();
    }

    if let Some((trigger, delay)) = &state.slow_trigger
        && message_text(&body).contains(trigger.as_str())
    {
        tokio::time::sleep(*delay).await;
    }

    let model = body["model"].as_str().unwrap_or_default().to_string();

    let mut response = if body["stream"].as_bool().unwrap_or_default() {
        stream(&model).into_response()
    } else {
        Json(json!({
            "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            "object": "chat.completion",
            "created": 1677651200,
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello! I'm a test LLM assistant."},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 15, "total_tokens": 25}
        }))
        .into_response()
    };

    if let Some(headers) = &state.response_headers {
        for (name, value) in headers(index) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(name), HeaderValue::from_str(&value).unwrap());
        }
    }

    response
}

fn stream(model: &str) -> impl IntoResponse {
    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());

    let events = [
        json!({"id": id, "object": "chat.completion.chunk", "created": 1677651200, "model": model,
            "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hello"}, "finish_reason": null}]}),
        json!({"id": id, "object": "chat.completion.chunk", "created": 1677651200, "model": model,
            "choices": [{"index": 0, "delta": {"content": " world"}, "finish_reason": "stop"}]}),
        json!({"id": id, "object": "chat.completion.chunk", "created": 1677651200, "model": model,
            "choices": [], "usage": {"prompt_tokens": 7, "completion_tokens": 2, "total_tokens": 9}}),
    ];

    let mut body = String::new();

    for event in events {
        body.push_str(&format!("data: {event}\n\n"));
    }

    body.push_str("data: [DONE]\n\n");

    ([(header::CONTENT_TYPE, "text/event-stream")], body)
}

async fn embeddings(State(state): State<Arc<MockState>>, uri: Uri, headers: HeaderMap, body: Bytes) -> Json<Value> {
    let body = record(&state, &uri, headers, &body);

    Json(json!({
        "object": "list",
        "data": [{"object": "embedding", "index": 0, "embedding": [0.1, 0.2, 0.3]}],
        "model": body["model"],
        "usage": {"prompt_tokens": 4, "total_tokens": 4}
    }))
}

async fn create_response(State(state): State<Arc<MockState>>, uri: Uri, headers: HeaderMap, body: Bytes) -> Json<Value> {
    let body = record(&state, &uri, headers, &body);

    Json(json!({
        "id": "resp_upstream_1",
        "object": "response",
        "status": "completed",
        "model": body["model"],
        "output": [{"type": "message", "role": "assistant", "content": [{"type": "output_text", "text": "Hi"}]}],
        "usage": {"input_tokens": 5, "output_tokens": 1, "total_tokens": 6}
    }))
}

async fn response(State(state): State<Arc<MockState>>, uri: Uri, headers: HeaderMap, Path(id): Path<String>) -> Json<Value> {
    record(&state, &uri, headers, &[]);

    Json(json!({"id": id, "object": "response", "status": "completed"}))
}

async fn delete_response(
    State(state): State<Arc<MockState>>,
    uri: Uri,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Json<Value> {
    record(&state, &uri, headers, &[]);

    Json(json!({"id": id, "object": "response", "deleted": true}))
}

async fn files(State(state): State<Arc<MockState>>, uri: Uri, headers: HeaderMap) -> Json<Value> {
    record(&state, &uri, headers, &[]);

    Json(json!({"object": "list", "data": [{"id": "file-1", "object": "file", "purpose": "batch"}]}))
}
