//! Endpoints forwarded without translation, and the Responses API with its signed ids.

use std::{sync::Arc, time::Instant};

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use callbacks::LogData;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header::CONTENT_TYPE};
use rate_limit::AdmissionRequest;
use serde::Deserialize;

use crate::{
    error::{ErrorKind, LlmError},
    hooks::ManagementEvent,
    messages::Usage,
    provider::{Provider, ResolvedModel, upstream_error_message},
    request::RequestContext,
    server::{LlmServer, log_data, mark_failure},
};

/// A successful upstream answer, ready to be returned.
struct Forwarded {
    status: StatusCode,
    content_type: Option<HeaderValue>,
    body: Bytes,
    /// Rate-limit state of the caller.
    headers: HeaderMap,
}

impl IntoResponse for Forwarded {
    fn into_response(self) -> Response {
        let mut headers = self.headers;

        if let Some(content_type) = self.content_type {
            headers.insert(CONTENT_TYPE, content_type);
        }

        (self.status, headers, self.body).into_response()
    }
}

#[derive(Deserialize)]
struct ModelField {
    model: Option<String>,
}

#[derive(Deserialize)]
struct UsageField {
    usage: Option<Usage>,
}

impl LlmServer {
    /// Forward a call to `path` of the provider serving its `model`, or of the
    /// passthrough provider.
    pub async fn passthrough(
        &self,
        context: RequestContext,
        call_type: &str,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> crate::Result<Response> {
        let forwarded = self.forward(&context, call_type, method, path, headers, body).await?;

        Ok(forwarded.into_response())
    }

    /// `POST /v1/responses`. The returned id is bound to the caller.
    pub async fn create_response(&self, context: RequestContext, headers: &HeaderMap, body: Bytes) -> crate::Result<Response> {
        let forwarded = self
            .forward(&context, "responses", Method::POST, "/v1/responses", headers, body)
            .await?;

        self.signed_response(&context, forwarded, "create")
    }

    /// `GET` or `DELETE /v1/responses/{id}`. Only the principal the id was issued to,
    /// or an admin, may use it.
    pub async fn response(&self, context: RequestContext, method: Method, id: &str) -> crate::Result<Response> {
        let raw_id = self.shared.response_ids.unwrap(id, &context.principal)?;
        let action = if method == Method::DELETE { "delete" } else { "retrieve" };

        let forwarded = self
            .forward(
                &context,
                "responses",
                method,
                &format!("/v1/responses/{raw_id}"),
                &HeaderMap::new(),
                Bytes::new(),
            )
            .await?;

        self.signed_response(&context, forwarded, action)
    }

    fn signed_response(&self, context: &RequestContext, forwarded: Forwarded, action: &'static str) -> crate::Result<Response> {
        let Ok(mut body) = serde_json::from_slice::<serde_json::Value>(&forwarded.body) else {
            return Ok(forwarded.into_response());
        };

        self.shared.response_ids.wrap_body(&mut body, &context.principal);

        if action != "retrieve"
            && let Some(id) = body.get("id").and_then(|id| id.as_str())
        {
            self.shared
                .hooks
                .emit(&ManagementEvent::new(action, "response", id, &context.principal));
        }

        Ok((forwarded.status, forwarded.headers, Json(body)).into_response())
    }

    /// Admit, send and record one forwarded call.
    async fn forward(
        &self,
        context: &RequestContext,
        call_type: &str,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> crate::Result<Forwarded> {
        let requested = requested_model(headers, &body);

        let mut data = log_data(context, requested.as_deref().unwrap_or_default(), false, None);
        data.call_type = call_type.to_string();

        let result = self
            .forward_admitted(context, method, path, headers, body, requested, &mut data)
            .await;

        if let Err(error) = &result {
            log::debug!("Forwarded request {} to {path} failed: {error}", context.request_id);
            mark_failure(&mut data, error);
        }

        data.end_time = jiff::Timestamp::now();
        self.shared.callbacks.dispatch(&data).await;

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn forward_admitted(
        &self,
        context: &RequestContext,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        mut body: Bytes,
        requested: Option<String>,
        data: &mut LogData,
    ) -> crate::Result<Forwarded> {
        let principal = &context.principal;

        let (provider, model) = self.passthrough_target(requested.as_deref(), path)?;
        let model_name = model
            .as_ref()
            .map(|model| model.public_name.clone())
            .or(requested)
            .unwrap_or_default();

        if !model_name.is_empty() && !principal.can_call_model(&model_name) {
            return Err(LlmError::permission(format!(
                "This key is not allowed to call model '{model_name}'"
            )));
        }

        rate_limit::check_budget(&principal.info.budget, &model_name)?;

        if let Some(model) = &model {
            self.shared.model_budgets.check(&model.public_name)?;
            body = replace_model(body, &model.upstream_model);

            data.model_group = model.group.clone();
        }

        data.model = model_name.clone();
        data.provider = provider.name().to_string();

        let admission = self
            .shared
            .limiter
            .admit(&AdmissionRequest {
                fingerprint: &principal.fingerprint,
                model: &model_name,
                model_group: &data.model_group,
                estimated_tokens: None,
                limits: &principal.info.limits,
            })
            .await?;

        let upstream = provider.transform_passthrough(method, path, headers, body)?;

        let started = Instant::now();
        let response = self.shared.dispatcher.send(provider.as_ref(), upstream).await?;

        let status = response.status();
        let content_type = response.headers().get(CONTENT_TYPE).cloned();

        let body = response.bytes().await.map_err(|e| {
            log::warn!("Failed to read response of provider '{}': {e}", provider.name());
            LlmError::new(ErrorKind::ServiceUnavailable, "Upstream response was interrupted")
        })?;

        data.api_latency = Some(started.elapsed());

        if !status.is_success() {
            let error = LlmError::from_upstream(status.as_u16(), upstream_error_message(&body));

            return Err(match &model {
                Some(model) => error.with_origin(&model.provider, &model.public_name),
                None => error.with_origin(provider.name(), model_name),
            });
        }

        if let Ok(UsageField { usage: Some(usage) }) = serde_json::from_slice::<UsageField>(&body) {
            data.prompt_tokens = u64::from(usage.prompt_tokens);
            data.completion_tokens = u64::from(usage.completion_tokens);

            if let Some(model) = &model {
                data.spend = model.cost(&usage);
                self.shared.saturation.record(&model.group, u64::from(usage.total_tokens)).await;
            }
        }

        Ok(Forwarded {
            status,
            content_type,
            body,
            headers: admission.headers.to_header_map(),
        })
    }

    /// The provider serving `model`, else the configured passthrough provider.
    fn passthrough_target(
        &self,
        requested: Option<&str>,
        path: &str,
    ) -> crate::Result<(Arc<dyn Provider>, Option<ResolvedModel>)> {
        if let Some(model) = requested.and_then(|model| self.shared.models.resolve(model)) {
            let Some(provider) = self.shared.providers.get(&model.provider) else {
                log::error!("Model '{}' refers to unknown provider '{}'", model.public_name, model.provider);
                return Err(LlmError::internal());
            };

            return Ok((provider.clone(), Some(model)));
        }

        let provider = self
            .shared
            .passthrough_provider
            .as_ref()
            .and_then(|name| self.shared.providers.get(name));

        match (provider, requested) {
            (Some(provider), _) => Ok((provider.clone(), None)),
            (None, Some(model)) => Err(LlmError::not_found(format!("Model '{model}' not found")).with_param("model")),
            (None, None) => Err(LlmError::invalid_request(format!(
                "No provider is configured to serve {path}"
            ))),
        }
    }
}

/// The `model` of a JSON body. Multipart and binary bodies have none.
fn requested_model(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_none_or(|value| value.starts_with("application/json"));

    if !is_json || body.is_empty() {
        return None;
    }

    serde_json::from_slice::<ModelField>(body).ok()?.model
}

fn replace_model(body: Bytes, upstream_model: &str) -> Bytes {
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return body;
    };

    let Some(object) = value.as_object_mut() else {
        return body;
    };

    object.insert("model".to_string(), serde_json::Value::from(upstream_model));

    match serde_json::to_vec(&value) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => body,
    }
}
