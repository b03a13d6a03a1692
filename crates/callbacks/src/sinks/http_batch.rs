use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use reqwest::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{BatchFlusher, BatchSink, LogData, Sink, SinkError};

/// Posts records as a JSON array, batched.
pub struct HttpBatchSink {
    name: String,
    batch: Arc<BatchSink<LogData>>,
}

struct HttpFlusher {
    client: Client,
    url: Url,
    headers: HeaderMap,
}

#[async_trait]
impl BatchFlusher<LogData> for HttpFlusher {
    async fn flush(&self, batch: Vec<LogData>) -> Result<(), SinkError> {
        let response = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .json(&batch)
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                url: self.url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

impl HttpBatchSink {
    /// Create the sink.
    pub fn new(
        name: impl Into<String>,
        client: Client,
        url: Url,
        headers: &std::collections::BTreeMap<String, String>,
        batch_size: usize,
    ) -> Result<Self, SinkError> {
        let name = name.into();

        let flusher = HttpFlusher {
            client,
            url,
            headers: super::header_map(headers)?,
        };

        Ok(Self {
            batch: Arc::new(BatchSink::new(name.clone(), batch_size, Arc::new(flusher))),
            name,
        })
    }

    /// Start the periodic flusher.
    pub fn spawn_flusher(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        self.batch.spawn_flusher(interval, shutdown)
    }
}

#[async_trait]
impl Sink for HttpBatchSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn log_success(&self, data: &LogData) {
        self.batch.append(data.clone()).await;
    }

    async fn log_failure(&self, data: &LogData) {
        self.batch.append(data.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use axum::{Json, Router, extract::State, http::HeaderMap, routing::post};
    use tokio::net::TcpListener;

    use super::*;

    type Received = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

    async fn ingest(State(received): State<Received>, headers: HeaderMap, Json(body): Json<serde_json::Value>) {
        let auth = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        received.lock().unwrap().push((auth, body));
    }

    #[tokio::test]
    async fn posts_batches_with_headers() {
        let received = Received::default();
        let app = Router::new().route("/ingest", post(ingest)).with_state(received.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let headers = BTreeMap::from([("authorization".to_string(), "Bearer abc".to_string())]);
        let url = format!("http://{address}/ingest").parse().unwrap();
        let sink = HttpBatchSink::new("warehouse", Client::new(), url, &headers, 2).unwrap();

        sink.log_success(&LogData::new("a", "chat_completion", "gpt")).await;
        sink.log_success(&LogData::new("b", "chat_completion", "gpt")).await;

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);

        let (auth, body) = &received[0];
        assert_eq!(auth.as_deref(), Some("Bearer abc"));

        let ids: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|record| record["request_id"].as_str().unwrap().to_string())
            .collect();

        assert_eq!(ids, vec!["a", "b"]);
    }
}
