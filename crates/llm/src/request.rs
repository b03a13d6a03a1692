use std::net::IpAddr;
use std::time::Instant;

use auth::Principal;
use jiff::Timestamp;
use uuid::Uuid;

/// Everything known about the caller of one request, passed explicitly through the pipeline.
#[derive(Debug, Clone)]
pub(crate) struct RequestContext {
    pub principal: Principal,
    pub request_id: String,
    pub client_ip: Option<IpAddr>,
    pub started_at: Timestamp,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(principal: Principal, client_ip: Option<IpAddr>) -> Self {
        Self {
            principal,
            request_id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            client_ip,
            started_at: Timestamp::now(),
            start: Instant::now(),
        }
    }
}
