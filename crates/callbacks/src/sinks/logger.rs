use async_trait::async_trait;

use crate::{LogData, Sink};

/// Writes one structured log line per record.
pub struct LogSink {
    name: String,
}

impl LogSink {
    /// Create the sink.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn write(&self, data: &LogData) {
        match serde_json::to_string(data) {
            Ok(line) => log::info!(target: "tianji::callbacks", "{line}"),
            Err(e) => log::warn!("Failed to serialize record for sink '{}': {e}", self.name),
        }
    }
}

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn log_success(&self, data: &LogData) {
        self.write(data);
    }

    async fn log_failure(&self, data: &LogData) {
        self.write(data);
    }
}
