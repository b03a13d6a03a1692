use async_trait::async_trait;
use url::Url;

use super::{Hook, ManagementEvent};

/// Posts every management event to a webhook on a detached task. Failures are logged.
pub(crate) struct ManagementWebhook {
    url: Url,
    client: reqwest::Client,
}

impl ManagementWebhook {
    pub fn new(url: Url, client: reqwest::Client) -> Self {
        Self { url, client }
    }
}

#[async_trait]
impl Hook for ManagementWebhook {
    fn name(&self) -> &str {
        "management_webhook"
    }

    fn on_management_event(&self, event: &ManagementEvent) {
        let request = self.client.post(self.url.clone()).json(event);
        let url = self.url.clone();
        let action = event.action;

        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    log::debug!("Delivered management event '{action}' to {url}");
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();

                    log::warn!("Management webhook {url} returned {status}: {body}");
                }
                Err(e) => log::warn!("Failed to deliver management event to {url}: {e}"),
            }
        });
    }
}
