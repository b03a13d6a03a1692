use std::collections::BTreeMap;

use async_trait::async_trait;
use http::HeaderMap;
use reqwest::Client;
use url::Url;

use crate::{LogData, Sink, SinkError};

/// Posts every record individually from a detached task.
pub struct WebhookSink {
    name: String,
    client: Client,
    url: Url,
    headers: HeaderMap,
}

impl WebhookSink {
    /// Create the sink.
    pub fn new(
        name: impl Into<String>,
        client: Client,
        url: Url,
        headers: &BTreeMap<String, String>,
    ) -> Result<Self, SinkError> {
        Ok(Self {
            name: name.into(),
            client,
            url,
            headers: super::header_map(headers)?,
        })
    }

    fn send(&self, data: &LogData) {
        let request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .json(data);

        let name = self.name.clone();

        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if !response.status().is_success() => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();

                    log::warn!("Webhook sink '{name}' responded with {status}: {body}");
                }
                Ok(_) => {}
                Err(e) => log::warn!("Webhook sink '{name}' failed: {e}"),
            }
        });
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn log_success(&self, data: &LogData) {
        self.send(data);
    }

    async fn log_failure(&self, data: &LogData) {
        self.send(data);
    }
}
