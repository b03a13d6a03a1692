//! Prometheus metrics aggregator.
//!
//! Every family is labelled with `model`, `provider` and `api_key_hash`. The hash is the
//! only representation of an API key that ever reaches a label.

use std::time::Duration;

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use sha2::{Digest, Sha256};

const LABELS: &[&str] = &["model", "provider", "api_key_hash"];

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// First 8 hex characters of the SHA-256 of an API key, `_none` for an empty key.
pub fn api_key_hash(key: &str) -> String {
    if key.is_empty() {
        return "_none".to_string();
    }

    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..4])
}

/// Outcome label of `requests_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// The call completed.
    Success,
    /// The call failed, whatever the HTTP status.
    Error,
}

impl RequestStatus {
    fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// One finished request, as seen by the aggregator.
#[derive(Debug, Clone)]
pub struct RequestMetrics<'a> {
    /// Public model name.
    pub model: &'a str,
    /// Provider name.
    pub provider: &'a str,
    /// Hashed API key, see [`api_key_hash`].
    pub api_key_hash: &'a str,
    /// End-to-end latency.
    pub total_latency: Duration,
    /// Time spent waiting for the upstream only.
    pub api_latency: Option<Duration>,
    /// Time to the first streamed chunk.
    pub time_to_first_token: Option<Duration>,
    /// Prompt tokens.
    pub prompt_tokens: u64,
    /// Completion tokens.
    pub completion_tokens: u64,
    /// Cost in USD.
    pub spend: f64,
    /// Outcome.
    pub status: RequestStatus,
}

/// Counters and histograms exposed on the scrape endpoint.
#[derive(Clone)]
pub struct MetricsAggregator {
    registry: Registry,
    request_total_latency: HistogramVec,
    llm_api_latency: HistogramVec,
    time_to_first_token: HistogramVec,
    tokens_total: IntCounterVec,
    spend_total: CounterVec,
    requests_total: IntCounterVec,
}

impl MetricsAggregator {
    /// Create the metric families in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let request_total_latency = HistogramVec::new(
            HistogramOpts::new("request_total_latency_seconds", "End-to-end request latency")
                .buckets(LATENCY_BUCKETS.to_vec()),
            LABELS,
        )?;

        let llm_api_latency = HistogramVec::new(
            HistogramOpts::new("llm_api_latency_seconds", "Latency of the upstream model call")
                .buckets(LATENCY_BUCKETS.to_vec()),
            LABELS,
        )?;

        let time_to_first_token = HistogramVec::new(
            HistogramOpts::new("time_to_first_token_seconds", "Time to the first streamed token")
                .buckets(LATENCY_BUCKETS.to_vec()),
            LABELS,
        )?;

        let tokens_total = IntCounterVec::new(
            Opts::new("tokens_total", "Tokens processed"),
            &["model", "provider", "api_key_hash", "type"],
        )?;

        let spend_total = CounterVec::new(Opts::new("spend_total", "Spend in USD"), LABELS)?;

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Requests processed"),
            &["model", "provider", "api_key_hash", "status"],
        )?;

        registry.register(Box::new(request_total_latency.clone()))?;
        registry.register(Box::new(llm_api_latency.clone()))?;
        registry.register(Box::new(time_to_first_token.clone()))?;
        registry.register(Box::new(tokens_total.clone()))?;
        registry.register(Box::new(spend_total.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;

        Ok(Self {
            registry,
            request_total_latency,
            llm_api_latency,
            time_to_first_token,
            tokens_total,
            spend_total,
            requests_total,
        })
    }

    /// Record one finished request.
    pub fn observe(&self, request: &RequestMetrics<'_>) {
        let labels = [request.model, request.provider, request.api_key_hash];

        self.request_total_latency
            .with_label_values(&labels)
            .observe(request.total_latency.as_secs_f64());

        if let Some(latency) = request.api_latency {
            self.llm_api_latency
                .with_label_values(&labels)
                .observe(latency.as_secs_f64());
        }

        if let Some(ttft) = request.time_to_first_token {
            self.time_to_first_token
                .with_label_values(&labels)
                .observe(ttft.as_secs_f64());
        }

        if request.prompt_tokens > 0 {
            self.tokens_total
                .with_label_values(&[request.model, request.provider, request.api_key_hash, "prompt"])
                .inc_by(request.prompt_tokens);
        }

        if request.completion_tokens > 0 {
            self.tokens_total
                .with_label_values(&[request.model, request.provider, request.api_key_hash, "completion"])
                .inc_by(request.completion_tokens);
        }

        if request.spend > 0.0 {
            self.spend_total.with_label_values(&labels).inc_by(request.spend);
        }

        self.requests_total
            .with_label_values(&[
                request.model,
                request.provider,
                request.api_key_hash,
                request.status.as_str(),
            ])
            .inc();
    }

    /// Render every family in the Prometheus text format.
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;

        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn find_line<'a>(text: &'a str, prefix: &str, fragments: &[&str]) -> Option<&'a str> {
        text.lines()
            .find(|line| line.starts_with(prefix) && fragments.iter().all(|f| line.contains(f)))
    }

    #[test]
    fn hash_of_key() {
        insta::assert_snapshot!(api_key_hash("sk-m"), @"42d65c49");
        insta::assert_snapshot!(api_key_hash(""), @"_none");
    }

    #[test]
    fn success_and_tokens_are_counted() {
        let aggregator = MetricsAggregator::new().unwrap();
        let hash = api_key_hash("sk-secret-key");

        aggregator.observe(&RequestMetrics {
            model: "gpt-4o",
            provider: "openai",
            api_key_hash: &hash,
            total_latency: Duration::from_millis(120),
            api_latency: Some(Duration::from_millis(100)),
            time_to_first_token: None,
            prompt_tokens: 10,
            completion_tokens: 5,
            spend: 0.5,
            status: RequestStatus::Success,
        });

        let text = aggregator.render().unwrap();

        let requests = find_line(&text, "requests_total{", &["status=\"success\"", "model=\"gpt-4o\""]).unwrap();
        assert!(requests.contains(&format!("api_key_hash=\"{hash}\"")));
        assert!(requests.ends_with(" 1"), "{requests}");

        let prompt = find_line(&text, "tokens_total{", &["type=\"prompt\""]).unwrap();
        assert!(prompt.ends_with(" 10"), "{prompt}");

        let completion = find_line(&text, "tokens_total{", &["type=\"completion\""]).unwrap();
        assert!(completion.ends_with(" 5"), "{completion}");

        assert!(find_line(&text, "spend_total{", &["provider=\"openai\""]).is_some());
        assert!(find_line(&text, "llm_api_latency_seconds_count{", &[]).is_some());
        assert!(find_line(&text, "time_to_first_token_seconds_count{", &[]).is_none());

        assert!(!text.contains("sk-secret-key"));
    }

    #[test]
    fn errors_use_a_single_status_label() {
        let aggregator = MetricsAggregator::new().unwrap();

        for _ in 0..2 {
            aggregator.observe(&RequestMetrics {
                model: "claude",
                provider: "bedrock",
                api_key_hash: "_none",
                total_latency: Duration::from_millis(5),
                api_latency: None,
                time_to_first_token: None,
                prompt_tokens: 0,
                completion_tokens: 0,
                spend: 0.0,
                status: RequestStatus::Error,
            });
        }

        let text = aggregator.render().unwrap();
        let errors = find_line(&text, "requests_total{", &["status=\"error\""]).unwrap();

        assert!(errors.ends_with(" 2"), "{errors}");
        assert!(find_line(&text, "requests_total{", &["status=\"success\""]).is_none());
    }
}
