//! Tianji server library.
//!
//! Provides a reusable server function to serve Tianji either for the binary, or for the integration tests.

#![deny(missing_docs)]

mod health;
mod metrics;
mod rate_limit;
mod sinks;

use std::{net::SocketAddr, sync::Arc};

use ::rate_limit::{RateLimitManager, Storage};
use anyhow::anyhow;
use axum::{Router, routing::get};
use axum_server::{Handle, tls_rustls::RustlsConfig};
use config::Config;
use metrics::MetricsLayer;
use rate_limit::RateLimitLayer;
use telemetry::MetricsAggregator;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Configuration for serving Tianji.
pub struct ServeConfig {
    /// The socket address (IP and port) the server will bind to
    pub listen_address: SocketAddr,
    /// The deserialized Tianji TOML configuration, with secret references resolved.
    pub config: Config,
    /// Cancelled to stop accepting connections and shut down gracefully.
    pub shutdown_signal: CancellationToken,
}

/// Starts and runs the Tianji server with the provided configuration.
///
/// Returns once `shutdown_signal` is cancelled, in-flight requests have completed
/// and the callback sinks have flushed.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        shutdown_signal,
    }: ServeConfig,
) -> anyhow::Result<()> {
    let telemetry = telemetry::init(&config.telemetry).await?;

    let storage = Storage::new(&config.server.rate_limits.storage)
        .await
        .map_err(|e| anyhow!("Failed to initialize rate limit storage: {e}"))?;

    let storage = Arc::new(storage);
    let aggregator = Arc::new(MetricsAggregator::new()?);

    let client = reqwest::Client::builder()
        .build()
        .map_err(|e| anyhow!("Failed to create the callback HTTP client: {e}"))?;

    let registry = sinks::registry(&config.callbacks, aggregator.clone(), client)?;

    let mut app = Router::new();

    let callbacks = if config.llm.enabled() {
        let router_config = llm::RouterConfig::builder(config.clone(), storage.clone())
            .callbacks(registry)
            .build();

        let llm = llm::router(router_config).await?;

        if !config.llm.has_providers() {
            log::warn!("No LLM providers are configured, every model request will be rejected");
        }

        app = app.merge(llm.router);
        llm.callbacks
    } else {
        log::warn!("LLM endpoints are disabled, the server only exposes its health endpoint");
        Arc::new(registry)
    };

    let request_limits = RateLimitManager::new(config.server.rate_limits.clone(), storage);

    if request_limits.is_enabled() {
        log::debug!("Applying request rate limits");
        app = app.layer(RateLimitLayer::new(Arc::new(request_limits)));
    }

    app = app.layer(MetricsLayer);

    // health is neither rate limited nor measured
    if config.server.health.enabled {
        if let Some(listen) = config.server.health.listen {
            tokio::spawn(health::bind_health_endpoint(
                listen,
                config.server.tls.clone(),
                config.server.health.clone(),
            ));
        } else {
            app = app.route(&config.server.health.path, get(health::health));
        }
    }

    if let Some(metrics_address) = config.telemetry.metrics.listen_address()? {
        let aggregator = aggregator.clone();
        let shutdown = shutdown_signal.clone();

        tokio::spawn(async move {
            if let Err(e) = metrics::bind_metrics_endpoint(metrics_address, aggregator, shutdown).await {
                log::error!("{e}");
            }
        });
    }

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| anyhow!("Failed to bind to {listen_address}: {e}"))?;

    let service = app.into_make_service_with_connect_info::<SocketAddr>();

    match &config.server.tls {
        Some(tls_config) => {
            let rustls_config = RustlsConfig::from_pem_file(&tls_config.certificate, &tls_config.key)
                .await
                .map_err(|e| anyhow!("Failed to load TLS certificate and key: {e}"))?;

            log::info!("LLM endpoints available at: https://{listen_address}{}", config.llm.path);

            let handle = Handle::new();
            let shutdown_handle = handle.clone();
            let shutdown = shutdown_signal.clone();

            tokio::spawn(async move {
                shutdown.cancelled().await;
                shutdown_handle.graceful_shutdown(None);
            });

            axum_server::from_tcp_rustls(listener.into_std()?, rustls_config)
                .handle(handle)
                .serve(service)
                .await
                .map_err(|e| anyhow!("Failed to start HTTPS server: {e}"))?;
        }
        None => {
            log::info!("LLM endpoints available at: http://{listen_address}{}", config.llm.path);

            let shutdown = shutdown_signal.clone();

            axum::serve(listener, service)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .map_err(|e| anyhow!("Failed to start HTTP server: {e}"))?;
        }
    }

    log::info!("Server stopped accepting connections, flushing callbacks");

    callbacks.shutdown().await;

    if let Err(e) = telemetry.force_flush() {
        log::warn!("{e}");
    }

    Ok(())
}
