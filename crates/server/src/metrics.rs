//! HTTP request metrics and the Prometheus scrape listener.
//!
//! Every request records `http.server.request.duration` through OpenTelemetry. The
//! per-call counters and histograms of the aggregator are served as Prometheus text
//! on a dedicated, unauthenticated listener.

use std::{
    fmt::Display,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use anyhow::anyhow;
use axum::{
    Router,
    body::Body,
    extract::{MatchedPath, State},
    response::IntoResponse,
    routing::get,
};
use http::{Request, Response, StatusCode, header::CONTENT_TYPE};
use telemetry::{
    MetricsAggregator,
    metrics::{self, Recorder},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::Layer;

#[derive(Clone, Default)]
pub struct MetricsLayer;

impl<Service> Layer<Service> for MetricsLayer
where
    Service: Send + Clone,
{
    type Service = MetricsService<Service>;

    fn layer(&self, next: Service) -> Self::Service {
        MetricsService { next }
    }
}

#[derive(Clone)]
pub struct MetricsService<Service> {
    next: Service,
}

impl<Service, ReqBody> tower::Service<Request<ReqBody>> for MetricsService<Service>
where
    Service: tower::Service<Request<ReqBody>, Response = Response<Body>> + Send + Clone + 'static,
    Service::Future: Send,
    Service::Error: Display + 'static,
    ReqBody: http_body::Body + Send + 'static,
{
    type Response = Response<Body>;
    type Error = Service::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.next.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let path = req
            .extensions()
            .get::<MatchedPath>()
            .map(|matched_path| matched_path.as_str().to_owned())
            .unwrap_or_else(|| "unknown".to_string());

        let mut next = self.next.clone();

        Box::pin(async move {
            let mut recorder = Recorder::new(metrics::HTTP_SERVER_REQUEST_DURATION);
            recorder.push_attribute("http.request.method", req.method().to_string());
            recorder.push_attribute("http.route", path);

            let response = next.call(req).await?;
            recorder.push_attribute("http.response.status_code", i64::from(response.status().as_u16()));

            recorder.record();

            Ok(response)
        })
    }
}

async fn scrape(State(aggregator): State<Arc<MetricsAggregator>>) -> impl IntoResponse {
    match aggregator.render() {
        Ok(text) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            text,
        )
            .into_response(),
        Err(e) => {
            log::error!("Failed to render metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serve `GET /metrics` until `shutdown` is cancelled.
pub(super) async fn bind_metrics_endpoint(
    addr: SocketAddr,
    aggregator: Arc<MetricsAggregator>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(scrape)).with_state(aggregator);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow!("Failed to bind the metrics endpoint to {addr}: {e}"))?;

    log::info!("Metrics endpoint exposed at http://{addr}/metrics");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| anyhow!("Failed to serve the metrics endpoint: {e}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use telemetry::{RequestMetrics, RequestStatus};

    use super::*;

    #[tokio::test]
    async fn scrape_renders_prometheus_text() {
        let aggregator = Arc::new(MetricsAggregator::new().unwrap());

        aggregator.observe(&RequestMetrics {
            model: "gpt-4o",
            provider: "openai",
            api_key_hash: "88c1f2f3",
            total_latency: Duration::from_millis(120),
            api_latency: Some(Duration::from_millis(100)),
            time_to_first_token: None,
            prompt_tokens: 10,
            completion_tokens: 5,
            spend: 0.01,
            status: RequestStatus::Success,
        });

        let response = scrape(State(aggregator)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(text.contains("api_key_hash=\"88c1f2f3\""), "{text}");
    }
}
