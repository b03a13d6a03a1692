//! Callback sinks declared in `[callbacks]`, plus the always-on metrics sink.

use std::sync::Arc;

use anyhow::Context;
use callbacks::{CallbackRegistry, HttpBatchSink, LogSink, MetricsSink, WebhookSink};
use config::{CallbacksConfig, SinkType};
use telemetry::MetricsAggregator;
use tokio_util::sync::CancellationToken;

/// Build the registry. Batch flushers are spawned and tracked by the registry, so
/// shutting it down flushes them one last time.
pub(super) fn registry(
    config: &CallbacksConfig,
    aggregator: Arc<MetricsAggregator>,
    client: reqwest::Client,
) -> anyhow::Result<CallbackRegistry> {
    let mut registry = CallbackRegistry::new(CancellationToken::new());

    registry.register(Arc::new(MetricsSink::new(aggregator)));

    for (name, sink) in &config.sinks {
        match sink.sink_type {
            SinkType::Log => registry.register(Arc::new(LogSink::new(name.clone()))),
            SinkType::HttpBatch => {
                let url = sink
                    .url
                    .clone()
                    .with_context(|| format!("Callback sink '{name}' requires a url"))?;

                let batch = HttpBatchSink::new(name.clone(), client.clone(), url, &sink.headers, config.batch_size())
                    .with_context(|| format!("Invalid callback sink '{name}'"))?;

                let flusher = batch.spawn_flusher(config.flush_interval(), registry.shutdown_token().clone());
                registry.track(flusher);
                registry.register(Arc::new(batch));
            }
            SinkType::Webhook => {
                let url = sink
                    .url
                    .clone()
                    .with_context(|| format!("Callback sink '{name}' requires a url"))?;

                let webhook = WebhookSink::new(name.clone(), client.clone(), url, &sink.headers)
                    .with_context(|| format!("Invalid callback sink '{name}'"))?;

                registry.register(Arc::new(webhook));
            }
        }
    }

    Ok(registry)
}
