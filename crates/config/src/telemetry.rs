//! Telemetry configuration.

use std::collections::BTreeMap;

use serde::Deserialize;

/// OTLP exporter settings.
pub mod exporters;

pub use self::exporters::{BatchExportConfig, ExportersConfig, OtlpExporterConfig, OtlpProtocol};

/// Default listen address of the Prometheus scrape endpoint.
pub const DEFAULT_METRICS_LISTEN: &str = ":9090";

/// Telemetry configuration for observability
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Service name for telemetry identification
    service_name: Option<String>,

    /// Custom resource attributes to attach to all telemetry
    resource_attributes: BTreeMap<String, String>,

    /// Exporters shipping metric snapshots
    exporters: ExportersConfig,

    /// Prometheus scrape endpoint
    pub metrics: MetricsEndpointConfig,
}

impl TelemetryConfig {
    /// Get the service name
    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    /// Get the resource attributes
    pub fn resource_attributes(&self) -> &BTreeMap<String, String> {
        &self.resource_attributes
    }

    /// Get the exporters configuration
    pub fn exporters(&self) -> &ExportersConfig {
        &self.exporters
    }

    /// The OTLP exporter for metrics, if enabled
    pub fn metrics_otlp_config(&self) -> Option<&OtlpExporterConfig> {
        Some(&self.exporters.otlp).filter(|otlp| otlp.enabled)
    }
}

/// Prometheus scrape endpoint configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsEndpointConfig {
    /// Listen address such as `:9090` or `127.0.0.1:9090`. Falls back to
    /// `METRICS_PORT`, then `:9090`. An empty value disables the endpoint.
    pub listen: Option<String>,
}

impl MetricsEndpointConfig {
    /// The socket address to bind, or `None` when the endpoint is disabled.
    pub fn listen_address(&self) -> anyhow::Result<Option<std::net::SocketAddr>> {
        let listen = self.listen.as_deref().unwrap_or(DEFAULT_METRICS_LISTEN).trim();

        if listen.is_empty() {
            return Ok(None);
        }

        let address = if let Some(port) = listen.strip_prefix(':') {
            format!("0.0.0.0:{port}")
        } else if listen.chars().all(|c| c.is_ascii_digit()) {
            format!("0.0.0.0:{listen}")
        } else {
            listen.to_string()
        };

        address
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid metrics listen address '{listen}': {e}"))
    }
}
