use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::LogData;

/// A destination for finished request records.
///
/// Sinks are called in registration order and are expected to either send quickly
/// or enqueue internally.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Record a successful call.
    async fn log_success(&self, data: &LogData);

    /// Record a failed call.
    async fn log_failure(&self, data: &LogData);
}

/// Every sink of the process, with the background tasks they own.
pub struct CallbackRegistry {
    sinks: Vec<Arc<dyn Sink>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CallbackRegistry {
    /// An empty registry. Background tasks observe `shutdown`.
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            sinks: Vec::new(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Token background tasks of the sinks must observe.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Add a sink at the end of the fan-out.
    pub fn register(&mut self, sink: Arc<dyn Sink>) {
        log::debug!("Registering callback sink '{}'", sink.name());
        self.sinks.push(sink);
    }

    /// Track a background task so shutdown can wait for it.
    pub fn track(&self, task: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(_) => log::warn!("Callback task list is poisoned, task will not be awaited on shutdown"),
        }
    }

    /// Number of registered sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no sink is registered.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Hand a finished record to every sink.
    pub async fn dispatch(&self, data: &LogData) {
        for sink in &self.sinks {
            if data.is_success() {
                sink.log_success(data).await;
            } else {
                sink.log_failure(data).await;
            }
        }
    }

    /// Cancel the background tasks and wait until they drained.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };

        for task in tasks {
            if let Err(e) = task.await {
                log::warn!("Callback background task failed during shutdown: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{LogData, LogError, LogStatus};

    struct Recording {
        name: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Sink for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn log_success(&self, data: &LogData) {
            self.seen.lock().unwrap().push(format!("{}:success:{}", self.name, data.request_id));
        }

        async fn log_failure(&self, data: &LogData) {
            self.seen.lock().unwrap().push(format!("{}:failure:{}", self.name, data.request_id));
        }
    }

    #[tokio::test]
    async fn sinks_are_called_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CallbackRegistry::new(CancellationToken::new());

        registry.register(Arc::new(Recording { name: "first", seen: seen.clone() }));
        registry.register(Arc::new(Recording { name: "second", seen: seen.clone() }));

        registry.dispatch(&LogData::new("a", "chat_completion", "gpt")).await;

        let mut failed = LogData::new("b", "chat_completion", "gpt");
        failed.status = LogStatus::Failure;
        failed.error = Some(LogError {
            kind: "timeout".to_string(),
            status_code: 408,
            message: "upstream timed out".to_string(),
        });

        registry.dispatch(&failed).await;
        registry.shutdown().await;

        insta::assert_debug_snapshot!(seen.lock().unwrap(), @r#"
        [
            "first:success:a",
            "second:success:a",
            "first:failure:b",
            "second:failure:b",
        ]
        "#);
    }
}
