//! Observability fan-out: the per-request log record, the sinks receiving it and
//! alerting on upstream rate-limit headers.

#![deny(missing_docs)]

mod alert;
mod batch;
mod error;
mod log_data;
mod rate_limit_headers;
mod registry;
mod sinks;
mod state;

pub use alert::RateLimitAlerter;
pub use batch::{BatchFlusher, BatchSink};
pub use error::SinkError;
pub use log_data::{LogData, LogError, LogStatus};
pub use rate_limit_headers::{LimitWindow, UnifiedWindow, UpstreamRateLimits};
pub use registry::{CallbackRegistry, Sink};
pub use sinks::{HttpBatchSink, LogSink, MetricsSink, WebhookSink};
pub use state::RateLimitStateCache;
