use std::time::Duration;

use auth::AuthError;
use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use rate_limit::{BudgetExceeded, RateLimitError};
use serde::Serialize;

/// The error taxonomy every failure is mapped into before reaching a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid credentials.
    Authentication,
    /// The caller may not do this.
    Permission,
    /// Unknown model, template or resource.
    NotFound,
    /// Malformed or unsupported request.
    InvalidRequest,
    /// The upstream or a dependency timed out.
    Timeout,
    /// A rate limit was reached.
    RateLimit,
    /// A spend cap was reached.
    BudgetExceeded,
    /// A dependency is down. Retrying may succeed.
    ServiceUnavailable,
    /// The prompt does not fit the model.
    ContextWindowExceeded,
    /// A hook rejected the content.
    ContentPolicyViolation,
    /// A guardrail rejected the content.
    GuardrailBlocked,
    /// A fail-closed infrastructure failure.
    Internal,
}

impl ErrorKind {
    /// Map an upstream HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => ErrorKind::InvalidRequest,
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Permission,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimit,
            500.. => ErrorKind::ServiceUnavailable,
            _ => ErrorKind::InvalidRequest,
        }
    }

    /// HTTP status sent to the client.
    pub fn status_code(self) -> StatusCode {
        match self {
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Permission => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidRequest
            | ErrorKind::ContextWindowExceeded
            | ErrorKind::ContentPolicyViolation
            | ErrorKind::GuardrailBlocked => StatusCode::BAD_REQUEST,
            ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::RateLimit | ErrorKind::BudgetExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The `type` field of the envelope.
    pub fn error_type(self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::Permission => "permission_denied",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::InvalidRequest => "invalid_request_error",
            ErrorKind::Timeout => "timeout_error",
            ErrorKind::RateLimit => "rate_limit_error",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::ContextWindowExceeded => "context_window_exceeded",
            ErrorKind::ContentPolicyViolation => "content_policy_violation",
            ErrorKind::GuardrailBlocked => "guardrail_blocked",
            ErrorKind::Internal => "internal_error",
        }
    }

    /// The default `code` field of the envelope.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::Permission => "permission",
            ErrorKind::NotFound => "not-found",
            ErrorKind::InvalidRequest => "invalid-request",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate-limit",
            ErrorKind::BudgetExceeded => "budget-exceeded",
            ErrorKind::ServiceUnavailable => "service-unavailable",
            ErrorKind::ContextWindowExceeded => "context-window-exceeded",
            ErrorKind::ContentPolicyViolation => "content-policy-violation",
            ErrorKind::GuardrailBlocked => "guardrail-blocked",
            ErrorKind::Internal => "internal",
        }
    }
}

/// A failure on the way to or from an upstream, rendered as the OpenAI error envelope.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct LlmError {
    kind: ErrorKind,
    message: String,
    code: Option<String>,
    param: Option<String>,
    provider: Option<String>,
    model: Option<String>,
    retry_after: Option<Duration>,
    headers: HeaderMap,
}

impl LlmError {
    /// A new error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            param: None,
            provider: None,
            model: None,
            retry_after: None,
            headers: HeaderMap::new(),
        }
    }

    /// `invalid-request` error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    /// `not-found` error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// `permission` error.
    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    /// A fail-closed failure. The details stay in the logs.
    pub fn internal() -> Self {
        Self::new(ErrorKind::Internal, "Internal server error")
    }

    /// Error from a non-success upstream response. Only the upstream `message` field is
    /// ever shown to the client.
    pub fn from_upstream(status: u16, upstream_message: Option<String>) -> Self {
        let mut kind = ErrorKind::from_status(status);

        let message = upstream_message
            .filter(|message| !message.trim().is_empty())
            .unwrap_or_else(|| format!("Upstream provider returned status {status}"));

        let lowered = message.to_ascii_lowercase();

        if kind == ErrorKind::InvalidRequest
            && (lowered.contains("context length") || lowered.contains("context_length_exceeded") || lowered.contains("too many tokens"))
        {
            kind = ErrorKind::ContextWindowExceeded;
        }

        Self::new(kind, message)
    }

    /// Override the envelope `code`.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Set the envelope `param`.
    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    /// Attribute the error to a provider and model.
    pub fn with_origin(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }

    /// Add response headers, e.g. rate-limit state.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    /// The error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The sanitized message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// HTTP status sent to the client.
    pub fn status_code(&self) -> StatusCode {
        self.kind.status_code()
    }

    /// The envelope `code`.
    pub fn code(&self) -> &str {
        self.code.as_deref().unwrap_or(self.kind.code())
    }

    /// The error envelope body.
    pub fn envelope(&self) -> ErrorEnvelope<'_> {
        ErrorEnvelope {
            error: ErrorDetails {
                message: &self.message,
                r#type: self.kind.error_type(),
                code: self.code(),
                param: self.param.as_deref(),
                llm_provider: self.provider.as_deref(),
                model: self.model.as_deref(),
            },
        }
    }
}

/// Error response format compatible with the OpenAI API.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope<'a> {
    error: ErrorDetails<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorDetails<'a> {
    message: &'a str,
    r#type: &'static str,
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    param: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    llm_provider: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

impl IntoResponse for LlmError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            log::error!("Server error ({}): {}", status.as_u16(), self.message);
        }

        let mut headers = self.headers.clone();

        if let Some(retry_after) = self.retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after.as_secs().max(1)));
        }

        (status, headers, Json(self.envelope())).into_response()
    }
}

impl From<AuthError> for LlmError {
    fn from(error: AuthError) -> Self {
        let kind = match &error {
            AuthError::MissingCredential | AuthError::InvalidCredential | AuthError::InvalidToken(_) => {
                ErrorKind::Authentication
            }
            AuthError::CredentialBlocked | AuthError::AccessDenied { .. } => ErrorKind::Permission,
            AuthError::StoreUnavailable(message) => {
                log::error!("Credential store unavailable: {message}");

                return LlmError::new(
                    ErrorKind::ServiceUnavailable,
                    "Credential store temporarily unavailable, please retry",
                )
                .with_code("service-temporarily-unavailable");
            }
        };

        LlmError::new(kind, error.to_string())
    }
}

impl From<RateLimitError> for LlmError {
    fn from(error: RateLimitError) -> Self {
        let mut llm_error = LlmError::new(ErrorKind::RateLimit, error.to_string());
        llm_error.retry_after = error.retry_after();
        llm_error
    }
}

impl From<BudgetExceeded> for LlmError {
    fn from(error: BudgetExceeded) -> Self {
        LlmError::new(ErrorKind::BudgetExceeded, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    #[test]
    fn upstream_status_mapping() {
        let kinds: Vec<_> = [400, 401, 403, 404, 408, 429, 500, 502, 503, 418]
            .into_iter()
            .map(|status| (status, ErrorKind::from_status(status).error_type()))
            .collect();

        insta::assert_debug_snapshot!(kinds, @r#"
        [
            (
                400,
                "invalid_request_error",
            ),
            (
                401,
                "authentication_error",
            ),
            (
                403,
                "permission_denied",
            ),
            (
                404,
                "not_found_error",
            ),
            (
                408,
                "timeout_error",
            ),
            (
                429,
                "rate_limit_error",
            ),
            (
                500,
                "service_unavailable",
            ),
            (
                502,
                "service_unavailable",
            ),
            (
                503,
                "service_unavailable",
            ),
            (
                418,
                "invalid_request_error",
            ),
        ]
        "#);
    }

    #[test]
    fn context_window_is_detected() {
        let error = LlmError::from_upstream(400, Some("This model's maximum context length is 8192 tokens".into()));
        assert_eq!(error.kind(), ErrorKind::ContextWindowExceeded);

        let error = LlmError::from_upstream(502, None);
        insta::assert_snapshot!(error, @"Upstream provider returned status 502");
    }

    #[tokio::test]
    async fn envelope() {
        let response = LlmError::from_upstream(429, Some("Slow down".into()))
            .with_origin("openai", "gpt-4o")
            .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();

        insta::assert_json_snapshot!(body, @r#"
        {
          "error": {
            "message": "Slow down",
            "type": "rate_limit_error",
            "code": "rate-limit",
            "llm_provider": "openai",
            "model": "gpt-4o"
          }
        }
        "#);
    }

    #[test]
    fn store_outage_is_retryable() {
        let error = LlmError::from(AuthError::StoreUnavailable("connection refused".into()));

        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.code(), "service-temporarily-unavailable");
        assert!(!error.message().contains("connection refused"));
    }
}
