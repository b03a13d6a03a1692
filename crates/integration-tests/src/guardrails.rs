//! Mock guardrail backends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;

/// A Presidio analyzer reporting every occurrence of the configured needles.
pub struct PresidioMock {
    entities: Vec<(String, String)>,
}

#[derive(Deserialize)]
struct AnalyzeRequest {
    text: String,
}

impl PresidioMock {
    pub fn new() -> Self {
        Self { entities: Vec::new() }
    }

    /// Report `needle` as an entity of `entity_type`
    pub fn with_entity(mut self, entity_type: impl Into<String>, needle: impl Into<String>) -> Self {
        self.entities.push((entity_type.into(), needle.into()));
        self
    }

    pub async fn spawn(self) -> SocketAddr {
        let app = Router::new()
            .route("/analyze", post(analyze))
            .with_state(Arc::new(self.entities));

        serve(app).await
    }
}

impl Default for PresidioMock {
    fn default() -> Self {
        Self::new()
    }
}

async fn analyze(State(entities): State<Arc<Vec<(String, String)>>>, Json(request): Json<AnalyzeRequest>) -> Json<Value> {
    let mut spans = Vec::new();

    for (entity_type, needle) in entities.iter() {
        for (offset, _) in request.text.match_indices(needle.as_str()) {
            // offsets count characters
            let start = request.text[..offset].chars().count();
            let end = start + needle.chars().count();

            spans.push(json!({"entity_type": entity_type, "start": start, "end": end, "score": 0.85}));
        }
    }

    Json(Value::Array(spans))
}

/// A generic guardrail vendor answering every check with a fixed status and body.
pub struct VendorMock {
    status: StatusCode,
    body: Value,
    calls: Arc<AtomicUsize>,
}

impl VendorMock {
    pub fn passing() -> Self {
        Self::responding(200, json!({"action": "pass"}))
    }

    pub fn responding(status: u16, body: Value) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap(),
            body,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of checks the vendor received
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub async fn spawn(self) -> SocketAddr {
        let app = Router::new().route("/check", post(check)).with_state(Arc::new(self));

        serve(app).await
    }
}

async fn check(State(vendor): State<Arc<VendorMock>>) -> impl IntoResponse {
    vendor.calls.fetch_add(1, Ordering::SeqCst);

    (vendor.status, Json(vendor.body.clone()))
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    address
}
