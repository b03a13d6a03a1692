//! Global and per-IP request limits, applied before authentication.

use std::{
    fmt::Display,
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    Json,
    body::Body,
    extract::ConnectInfo,
    response::{IntoResponse, Response},
};
use http::{HeaderValue, Request, StatusCode, header::RETRY_AFTER};
use rate_limit::{RateLimitError, RateLimitManager};
use serde_json::json;
use tower::Layer;

#[derive(Clone)]
pub struct RateLimitLayer(Arc<RateLimitManager>);

impl RateLimitLayer {
    pub fn new(manager: Arc<RateLimitManager>) -> Self {
        Self(manager)
    }
}

impl<Service> Layer<Service> for RateLimitLayer
where
    Service: Send + Clone,
{
    type Service = RateLimitService<Service>;

    fn layer(&self, next: Service) -> Self::Service {
        RateLimitService {
            next,
            manager: self.0.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<Service> {
    next: Service,
    manager: Arc<RateLimitManager>,
}

impl<Service, ReqBody> tower::Service<Request<ReqBody>> for RateLimitService<Service>
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
        let mut next = self.next.clone();
        let manager = self.manager.clone();

        Box::pin(async move {
            let ip = client_ip(&req);

            let error = match manager.check_request(ip).await {
                Ok(()) => return next.call(req).await,
                // storage failures admit the request
                Err(RateLimitError::Storage(e)) => {
                    log::warn!("Request rate limit check failed, admitting: {e}");
                    return next.call(req).await;
                }
                Err(error) => error,
            };

            log::debug!("Request from {ip:?} rejected: {error}");

            Ok(rejection(&error))
        })
    }
}

fn rejection(error: &RateLimitError) -> Response<Body> {
    let body = json!({
        "error": {
            "message": error.to_string(),
            "type": "rate_limit_error",
            "code": "rate-limit",
        }
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();

    if let Some(retry_after) = error.retry_after() {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(retry_after.as_secs().max(1)));
    }

    response
}

/// The peer address of the connection, else the first `X-Forwarded-For` entry,
/// else `X-Real-IP`.
fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    if let Some(forwarded_for) = req.headers().get("x-forwarded-for") {
        let first = forwarded_for.to_str().ok()?.split(',').next()?;
        return first.trim().parse::<IpAddr>().ok();
    }

    req.headers().get("x-real-ip")?.to_str().ok()?.trim().parse::<IpAddr>().ok()
}
