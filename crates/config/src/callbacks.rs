//! Callback sinks and rate-limit alerting configuration.

use std::{collections::BTreeMap, time::Duration};

use duration_str::{deserialize_duration, deserialize_option_duration};
use serde::Deserialize;
use url::Url;

/// Default number of items a batched sink queues before flushing.
pub const DEFAULT_BATCH_SIZE: usize = 512;

/// Default interval between periodic flushes of batched sinks.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Observability fan-out configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct CallbacksConfig {
    /// Items queued by a batched sink before it flushes. Defaults to
    /// `DEFAULT_BATCH_SIZE` from the environment, or 512.
    pub batch_size: Option<usize>,
    /// Interval between periodic flushes of batched sinks. Defaults to
    /// `DEFAULT_FLUSH_INTERVAL_SECONDS` from the environment, or 5 seconds.
    #[serde(deserialize_with = "deserialize_option_duration")]
    pub flush_interval: Option<Duration>,
    /// Named sinks.
    pub sinks: BTreeMap<String, SinkConfig>,
    /// Alerts on upstream rate-limit headers.
    pub alerting: Option<AlertingConfig>,
    /// Cache of the latest upstream rate-limit state.
    pub rate_limit_state: RateLimitStateConfig,
}

impl CallbacksConfig {
    /// Effective batch size of batched sinks.
    pub fn batch_size(&self) -> usize {
        self.batch_size.filter(|size| *size > 0).unwrap_or(DEFAULT_BATCH_SIZE)
    }

    /// Effective flush interval of batched sinks.
    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
            .filter(|interval| !interval.is_zero())
            .unwrap_or(DEFAULT_FLUSH_INTERVAL)
    }
}

/// Sink implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkType {
    /// Writes one structured log line per record.
    Log,
    /// Posts batches of records as a JSON array.
    HttpBatch,
    /// Posts every record individually.
    Webhook,
}

/// A callback sink.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    /// The sink implementation.
    #[serde(rename = "type")]
    pub sink_type: SinkType,
    /// Destination of HTTP sinks.
    pub url: Option<Url>,
    /// Extra headers sent with every HTTP request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Chat dialect of the alert webhook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertFormat {
    /// `{"content": ...}`
    #[default]
    Discord,
    /// `{"text": ...}`
    Slack,
}

/// Rate-limit alerting configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertingConfig {
    /// Webhook receiving the alerts.
    pub webhook_url: Url,
    /// Payload dialect.
    #[serde(default)]
    pub format: AlertFormat,
    /// Alert when remaining/limit drops below this ratio.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Minimum time between two alerts for the same upstream and dimension.
    #[serde(default = "default_cooldown", deserialize_with = "deserialize_duration")]
    pub cooldown: Duration,
}

fn default_threshold() -> f64 {
    0.2
}

fn default_cooldown() -> Duration {
    Duration::from_secs(3600)
}

/// Rate-limit state cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitStateConfig {
    /// Age after which an entry is pruned.
    #[serde(deserialize_with = "deserialize_duration")]
    pub ttl: Duration,
    /// Interval of the pruner task.
    #[serde(deserialize_with = "deserialize_duration")]
    pub prune_interval: Duration,
}

impl Default for RateLimitStateConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            prune_interval: Duration::from_secs(60),
        }
    }
}
