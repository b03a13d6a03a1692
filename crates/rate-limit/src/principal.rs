//! Per-principal admission: parallel-request slots, RPM sliding windows and TPM
//! reservations, all scaled by the saturation throttle.
//!
//! Storage failures admit the request and skip the affected dimension.

use std::sync::Arc;
use std::time::Duration;

use config::DynamicRateLimitConfig;
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::error::RateLimitError;
use crate::storage::Storage;
use crate::throttle::{effective_limit, throttle_factor};

const WINDOW: Duration = Duration::from_secs(60);
const SLOT_TTL: Duration = Duration::from_secs(60);
const SLOT_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

static LIMIT_REQUESTS: HeaderName = HeaderName::from_static("x-ratelimit-limit-requests");
static REMAINING_REQUESTS: HeaderName = HeaderName::from_static("x-ratelimit-remaining-requests");
static RESET_REQUESTS: HeaderName = HeaderName::from_static("x-ratelimit-reset-requests");
static LIMIT_TOKENS: HeaderName = HeaderName::from_static("x-ratelimit-limit-tokens");
static REMAINING_TOKENS: HeaderName = HeaderName::from_static("x-ratelimit-remaining-tokens");

/// Limits attached to a principal. `None` disables a dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrincipalLimits {
    /// Requests per minute.
    pub rpm_limit: Option<u64>,
    /// Tokens per minute, per model.
    pub tpm_limit: Option<u64>,
    /// In-flight requests.
    pub max_parallel_requests: Option<u64>,
    /// Request class weight for the saturation throttle.
    pub priority: i64,
}

/// One admission decision.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    /// Token fingerprint of the principal.
    pub fingerprint: &'a str,
    /// Public model name, part of the TPM key.
    pub model: &'a str,
    /// Model group whose saturation drives the throttle.
    pub model_group: &'a str,
    /// Projected token usage. `None` skips the TPM check.
    pub estimated_tokens: Option<u64>,
    /// Limits of the principal.
    pub limits: &'a PrincipalLimits,
}

/// Values of the `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// Effective RPM limit.
    pub limit_requests: Option<u64>,
    /// Requests left in the window.
    pub remaining_requests: Option<u64>,
    /// Effective TPM limit.
    pub limit_tokens: Option<u64>,
    /// Tokens left in the window.
    pub remaining_tokens: Option<u64>,
}

impl RateLimitHeaders {
    /// Render the headers. Dimensions that were not checked are left out.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let (Some(limit), Some(remaining)) = (self.limit_requests, self.remaining_requests) {
            headers.insert(LIMIT_REQUESTS.clone(), HeaderValue::from(limit));
            headers.insert(REMAINING_REQUESTS.clone(), HeaderValue::from(remaining));
            headers.insert(RESET_REQUESTS.clone(), HeaderValue::from_static("60s"));
        }

        if let (Some(limit), Some(remaining)) = (self.limit_tokens, self.remaining_tokens) {
            headers.insert(LIMIT_TOKENS.clone(), HeaderValue::from(limit));
            headers.insert(REMAINING_TOKENS.clone(), HeaderValue::from(remaining));
        }

        headers
    }
}

/// Result of a successful admission. Dropping it releases the parallel slot.
#[derive(Debug, Default)]
pub struct Admission {
    /// Header values for the response.
    pub headers: RateLimitHeaders,
    /// Held parallel-request slot.
    pub slot: Option<ParallelSlot>,
    /// TPM reservation to reconcile with the actual usage.
    pub reservation: Option<TokenReservation>,
}

/// A held parallel-request slot.
///
/// The slot is released on drop through a detached task bounded by a five second
/// timeout, so a cancelled request still gives its slot back. If the release fails
/// the counter's TTL reclaims it.
pub struct ParallelSlot {
    storage: Arc<Storage>,
    key: String,
}

impl std::fmt::Debug for ParallelSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelSlot").field("key", &self.key).finish()
    }
}

impl Drop for ParallelSlot {
    fn drop(&mut self) {
        let storage = self.storage.clone();
        let key = std::mem::take(&mut self.key);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!("No runtime to release parallel slot {key}, leaving it to expire");
            return;
        };

        handle.spawn(async move {
            match tokio::time::timeout(SLOT_RELEASE_TIMEOUT, storage.release_slot(&key)).await {
                Ok(Ok(_)) => (),
                Ok(Err(e)) => log::warn!("Failed to release parallel slot {key}: {e}"),
                Err(_) => log::warn!("Timed out releasing parallel slot {key}"),
            }
        });
    }
}

/// Tokens reserved against a TPM window.
pub struct TokenReservation {
    storage: Arc<Storage>,
    key: String,
    estimated: u64,
}

impl std::fmt::Debug for TokenReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenReservation")
            .field("key", &self.key)
            .field("estimated", &self.estimated)
            .finish()
    }
}

impl TokenReservation {
    /// Tokens reserved at admission.
    pub fn estimated(&self) -> u64 {
        self.estimated
    }

    /// Correct the window with the actual usage.
    pub async fn reconcile(self, actual: u64) {
        let delta = actual as i64 - self.estimated as i64;

        if delta == 0 {
            return;
        }

        if let Err(e) = self.storage.adjust(&self.key, delta).await {
            log::warn!("Failed to reconcile token usage for {}: {e}", self.key);
        }
    }
}

/// Admission against the limits of a principal.
pub struct PrincipalRateLimiter {
    storage: Arc<Storage>,
    dynamic: DynamicRateLimitConfig,
}

impl PrincipalRateLimiter {
    /// Create a limiter sharing the given storage.
    pub fn new(storage: Arc<Storage>, dynamic: DynamicRateLimitConfig) -> Self {
        Self { storage, dynamic }
    }

    /// The storage shared by the counters.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Acquire a parallel slot, then check RPM and TPM with limits scaled by the
    /// current saturation.
    ///
    /// On rejection every slot acquired so far is released.
    pub async fn admit(&self, request: &AdmissionRequest<'_>) -> Result<Admission, RateLimitError> {
        let limits = request.limits;
        let mut admission = Admission::default();

        if let Some(limit) = limits.max_parallel_requests {
            admission.slot = self.acquire_slot(request.fingerprint, limit).await?;
        }

        let factor = self.factor(request).await;

        if let Some(limit) = limits.rpm_limit {
            let limit = effective_limit(limit, factor);
            let key = format!("rpm:{}", request.fingerprint);

            match self.storage.record_event(&key, limit, WINDOW).await {
                Ok(result) if result.allowed => {
                    admission.headers.limit_requests = Some(limit);
                    admission.headers.remaining_requests = Some(limit.saturating_sub(result.value));
                }
                Ok(_) => {
                    log::debug!("RPM limit of {limit} reached for {}", request.fingerprint);
                    return Err(RateLimitError::RequestsExceeded { limit });
                }
                Err(e) => log::warn!("RPM check failed for {}, admitting: {e}", request.fingerprint),
            }
        }

        if let (Some(limit), Some(estimated)) = (limits.tpm_limit, request.estimated_tokens) {
            let limit = effective_limit(limit, factor);
            let key = format!("tpm:{}:{}", request.fingerprint, request.model);

            match self.storage.reserve(&key, estimated, limit, WINDOW).await {
                Ok(result) if result.allowed => {
                    admission.headers.limit_tokens = Some(limit);
                    admission.headers.remaining_tokens = Some(limit.saturating_sub(result.value));

                    admission.reservation = Some(TokenReservation {
                        storage: self.storage.clone(),
                        key,
                        estimated,
                    });
                }
                Ok(_) => {
                    log::debug!(
                        "TPM limit of {limit} reached for {} on {}",
                        request.fingerprint,
                        request.model
                    );

                    return Err(RateLimitError::TokensExceeded {
                        model: request.model.to_string(),
                        limit,
                    });
                }
                Err(e) => log::warn!("TPM check failed for {}, admitting: {e}", request.fingerprint),
            }
        }

        Ok(admission)
    }

    async fn acquire_slot(&self, fingerprint: &str, limit: u64) -> Result<Option<ParallelSlot>, RateLimitError> {
        let key = format!("parallel:{fingerprint}");

        match self.storage.acquire_slot(&key, limit, SLOT_TTL).await {
            Ok(result) if result.allowed => Ok(Some(ParallelSlot {
                storage: self.storage.clone(),
                key,
            })),
            Ok(_) => Err(RateLimitError::ParallelExceeded { limit }),
            Err(e) => {
                log::warn!("Parallel slot check failed for {fingerprint}, admitting: {e}");
                Ok(None)
            }
        }
    }

    async fn factor(&self, request: &AdmissionRequest<'_>) -> f64 {
        if !self.dynamic.enabled || request.limits.priority <= 0 {
            return 1.0;
        }

        match self.storage.saturation(request.model_group).await {
            Ok(saturation) => throttle_factor(saturation, self.dynamic.saturation_threshold, request.limits.priority),
            Err(e) => {
                log::warn!("Failed to read saturation of {}: {e}", request.model_group);
                1.0
            }
        }
    }
}
