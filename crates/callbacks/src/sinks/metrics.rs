use std::sync::Arc;

use async_trait::async_trait;
use telemetry::{MetricsAggregator, RequestMetrics, RequestStatus};

use crate::{LogData, Sink};

/// Feeds the scrape endpoint aggregator.
pub struct MetricsSink {
    aggregator: Arc<MetricsAggregator>,
}

impl MetricsSink {
    /// Create the sink.
    pub fn new(aggregator: Arc<MetricsAggregator>) -> Self {
        Self { aggregator }
    }

    fn observe(&self, data: &LogData, status: RequestStatus) {
        self.aggregator.observe(&RequestMetrics {
            model: &data.model,
            provider: &data.provider,
            api_key_hash: &data.api_key_hash,
            total_latency: data.total_latency(),
            api_latency: data.api_latency,
            time_to_first_token: data.time_to_first_token,
            prompt_tokens: data.prompt_tokens,
            completion_tokens: data.completion_tokens,
            spend: data.spend,
            status,
        });
    }
}

#[async_trait]
impl Sink for MetricsSink {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn log_success(&self, data: &LogData) {
        self.observe(data, RequestStatus::Success);
    }

    async fn log_failure(&self, data: &LogData) {
        self.observe(data, RequestStatus::Error);
    }
}
