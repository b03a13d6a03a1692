mod http_batch;
mod logger;
mod metrics;
mod webhook;

pub use self::http_batch::HttpBatchSink;
pub use self::logger::LogSink;
pub use self::metrics::MetricsSink;
pub use self::webhook::WebhookSink;

use std::collections::BTreeMap;

use http::{HeaderMap, HeaderName, HeaderValue};

use crate::SinkError;

pub(crate) fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, SinkError> {
    let mut map = HeaderMap::new();

    for (name, value) in headers {
        let name = HeaderName::try_from(name.as_str()).map_err(|e| SinkError::Header(format!("{name}: {e}")))?;
        let value = HeaderValue::try_from(value.as_str()).map_err(|e| SinkError::Header(format!("{name}: {e}")))?;

        map.insert(name, value);
    }

    Ok(map)
}
