//! Alerts on upstream rate-limit headers running low.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use config::{AlertFormat, AlertingConfig};
use reqwest::Client;
use serde_json::json;
use tokio::time::Instant;
use url::Url;

use crate::UpstreamRateLimits;

/// Sends a chat message when an upstream reports little remaining capacity, at most
/// once per cooldown for every upstream and dimension.
pub struct RateLimitAlerter {
    client: Client,
    webhook_url: Url,
    format: AlertFormat,
    threshold: f64,
    cooldown: Duration,
    last_sent: Mutex<HashMap<(String, &'static str), Instant>>,
}

impl RateLimitAlerter {
    /// Create the alerter.
    pub fn new(config: &AlertingConfig, client: Client) -> Self {
        Self {
            client,
            webhook_url: config.webhook_url.clone(),
            format: config.format,
            threshold: config.threshold,
            cooldown: config.cooldown,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Check the state of an upstream and send the alerts it warrants on detached tasks.
    /// Returns the messages that were sent.
    pub fn observe(&self, upstream: &str, limits: &UpstreamRateLimits) -> Vec<String> {
        let due = self.due_alerts(upstream, limits);

        for message in &due {
            self.send(message.clone());
        }

        due
    }

    fn due_alerts(&self, upstream: &str, limits: &UpstreamRateLimits) -> Vec<String> {
        let now = Instant::now();

        let Ok(mut last_sent) = self.last_sent.lock() else {
            log::warn!("Rate-limit alert cooldown map is poisoned, skipping alerts");
            return Vec::new();
        };

        let mut due = Vec::new();

        for (dimension, ratio) in limits.remaining_ratios() {
            if ratio >= self.threshold {
                continue;
            }

            let key = (upstream.to_string(), dimension);

            if last_sent
                .get(&key)
                .is_some_and(|sent| now.saturating_duration_since(*sent) < self.cooldown)
            {
                continue;
            }

            last_sent.insert(key, now);

            due.push(format!(
                "Upstream '{upstream}' is running low on {dimension}: {:.1}% remaining (alert threshold {:.1}%)",
                ratio * 100.0,
                self.threshold * 100.0
            ));
        }

        due
    }

    fn payload(&self, message: String) -> serde_json::Value {
        match self.format {
            AlertFormat::Discord => json!({ "content": message }),
            AlertFormat::Slack => json!({ "text": message }),
        }
    }

    fn send(&self, message: String) {
        let request = self.client.post(self.webhook_url.clone()).json(&self.payload(message));

        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if !response.status().is_success() => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();

                    log::warn!("Rate-limit alert webhook responded with {status}: {body}");
                }
                Ok(_) => {}
                Err(e) => log::warn!("Failed to send rate-limit alert: {e}"),
            }
        });
    }
}
