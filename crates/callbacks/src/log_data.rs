use std::time::Duration;

use jiff::Timestamp;
use serde::{Serialize, Serializer};

/// Outcome of a dispatched call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    /// The call completed and passed every post-call check.
    Success,
    /// The call failed at any stage.
    Failure,
}

/// Error details of a failed call.
#[derive(Debug, Clone, Serialize)]
pub struct LogError {
    /// Error kind as sent to the client, e.g. `rate-limit`.
    pub kind: String,
    /// HTTP status sent to the client.
    pub status_code: u16,
    /// Human readable message.
    pub message: String,
}

/// Record assembled at the end of every dispatched call and handed to the sinks.
#[derive(Debug, Clone, Serialize)]
pub struct LogData {
    /// Unique request identifier.
    pub request_id: String,
    /// Kind of call, e.g. `chat_completion`.
    pub call_type: String,
    /// Model name requested by the client.
    pub model: String,
    /// Model group the request was routed to.
    pub model_group: String,
    /// Provider serving the model.
    pub provider: String,
    /// Short hash of the caller credential. Never the credential itself.
    pub api_key_hash: String,
    /// Full fingerprint of the caller credential, used for spend accounting.
    #[serde(skip)]
    pub key_fingerprint: Option<String>,
    /// Caller user.
    pub user_id: Option<String>,
    /// Caller team.
    pub team_id: Option<String>,
    /// Caller organization.
    pub org_id: Option<String>,
    /// Whether the response was streamed.
    pub stream: bool,
    /// When the request was admitted.
    pub start_time: Timestamp,
    /// When the last byte was produced.
    pub end_time: Timestamp,
    /// Time spent waiting for the upstream.
    #[serde(serialize_with = "seconds_option")]
    pub api_latency: Option<Duration>,
    /// Time to the first streamed chunk.
    #[serde(serialize_with = "seconds_option")]
    pub time_to_first_token: Option<Duration>,
    /// Prompt tokens.
    pub prompt_tokens: u64,
    /// Completion tokens.
    pub completion_tokens: u64,
    /// Prompt tokens served from the upstream prompt cache.
    pub cache_read_tokens: u64,
    /// Prompt tokens written to the upstream prompt cache.
    pub cache_creation_tokens: u64,
    /// Whether any part of the prompt was served from cache.
    pub cache_hit: bool,
    /// Cost in USD.
    pub spend: f64,
    /// Outcome.
    pub status: LogStatus,
    /// Error details when the call failed.
    pub error: Option<LogError>,
    /// Tags of the caller credential.
    pub tags: Vec<String>,
    /// The request as sent upstream, after every mutation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<serde_json::Value>,
    /// The response as returned to the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
}

impl LogData {
    /// A record for a call starting now, to be completed as the call progresses.
    pub fn new(request_id: impl Into<String>, call_type: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        let now = Timestamp::now();

        Self {
            request_id: request_id.into(),
            call_type: call_type.into(),
            model_group: model.clone(),
            model,
            provider: String::new(),
            api_key_hash: "_none".to_string(),
            key_fingerprint: None,
            user_id: None,
            team_id: None,
            org_id: None,
            stream: false,
            start_time: now,
            end_time: now,
            api_latency: None,
            time_to_first_token: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
            cache_hit: false,
            spend: 0.0,
            status: LogStatus::Success,
            error: None,
            tags: Vec::new(),
            request: None,
            response: None,
        }
    }

    /// End-to-end duration of the call.
    pub fn total_latency(&self) -> Duration {
        let span = self.end_time.duration_since(self.start_time);
        Duration::try_from(span).unwrap_or_default()
    }

    /// Whether the call succeeded.
    pub fn is_success(&self) -> bool {
        self.status == LogStatus::Success
    }
}

fn seconds_option<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn serialized_record() {
        let mut data = LogData::new("req-1", "chat_completion", "gpt-4o");
        data.provider = "openai".to_string();
        data.api_key_hash = "42d65c49".to_string();
        data.team_id = Some("team-a".to_string());
        data.start_time = "2025-01-01T00:00:00Z".parse().unwrap();
        data.end_time = "2025-01-01T00:00:01.5Z".parse().unwrap();
        data.api_latency = Some(Duration::from_millis(1200));
        data.prompt_tokens = 10;
        data.completion_tokens = 5;
        data.spend = 0.0001;

        assert_eq!(data.total_latency(), Duration::from_millis(1500));

        insta::assert_json_snapshot!(data, @r#"
        {
          "request_id": "req-1",
          "call_type": "chat_completion",
          "model": "gpt-4o",
          "model_group": "gpt-4o",
          "provider": "openai",
          "api_key_hash": "42d65c49",
          "user_id": null,
          "team_id": "team-a",
          "org_id": null,
          "stream": false,
          "start_time": "2025-01-01T00:00:00Z",
          "end_time": "2025-01-01T00:00:01.5Z",
          "api_latency": 1.2,
          "time_to_first_token": null,
          "prompt_tokens": 10,
          "completion_tokens": 5,
          "cache_read_tokens": 0,
          "cache_creation_tokens": 0,
          "cache_hit": false,
          "spend": 0.0001,
          "status": "success",
          "error": null,
          "tags": []
        }
        "#);
    }
}
