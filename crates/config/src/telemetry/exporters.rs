use duration_str::deserialize_duration;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Exporters configuration for telemetry
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ExportersConfig {
    /// OTLP exporter configuration
    pub otlp: OtlpExporterConfig,
}

/// OTLP exporter configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OtlpExporterConfig {
    /// Whether this exporter is enabled
    #[serde(default)]
    pub enabled: bool,

    /// OTLP endpoint URL
    #[serde(default = "default_endpoint")]
    pub endpoint: Url,

    /// Protocol to use (grpc or http)
    #[serde(default)]
    pub protocol: OtlpProtocol,

    /// Request timeout
    #[serde(deserialize_with = "deserialize_duration", default = "default_timeout")]
    pub timeout: Duration,

    /// Periodic export configuration
    #[serde(default)]
    pub batch_export: BatchExportConfig,
}

fn default_endpoint() -> Url {
    let Ok(url) = Url::parse("http://localhost:4317") else {
        unreachable!("default OTLP endpoint is a valid URL");
    };

    url
}

impl Default for OtlpExporterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
            protocol: OtlpProtocol::default(),
            timeout: default_timeout(),
            batch_export: BatchExportConfig::default(),
        }
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

/// OTLP protocol selection
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    /// gRPC protocol (default)
    #[default]
    Grpc,
    /// HTTP/protobuf protocol
    Http,
}

/// Periodic export configuration for OTLP
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchExportConfig {
    /// Delay between metric snapshot exports
    #[serde(deserialize_with = "deserialize_duration", default = "default_scheduled_delay")]
    pub scheduled_delay: Duration,
}

impl Default for BatchExportConfig {
    fn default() -> Self {
        Self {
            scheduled_delay: default_scheduled_delay(),
        }
    }
}

fn default_scheduled_delay() -> Duration {
    Duration::from_secs(5)
}
