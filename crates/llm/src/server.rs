//! The admission and dispatch pipeline behind the OpenAI endpoints.
//!
//! A chat request is authenticated, checked against the caller's model, cache and
//! budget allowances, admitted by the rate limiter, run through hooks, prompt
//! templates and guardrails, dispatched upstream, checked again and finally recorded.

mod builder;
mod dispatch;
mod metrics;
mod passthrough;
mod stream;

use std::{
    collections::BTreeMap,
    net::IpAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use auth::{Authenticator, Principal};
use callbacks::{CallbackRegistry, LogData, LogError, LogStatus};
use futures::StreamExt;
use http::HeaderMap;
use ipnet::IpNet;
use jiff::Timestamp;
use rate_limit::{Admission, AdmissionRequest, ModelBudgetLimiter, PrincipalRateLimiter};
use telemetry::metrics::Recorder;

pub(crate) use builder::LlmServerBuilder;
pub(crate) use dispatch::ChatCompletionStream;

use crate::{
    error::LlmError,
    guardrails::{GuardrailRegistry, PolicyResolver},
    hooks::HookPipeline,
    messages::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ModelsResponse, Usage},
    prompts::PromptResolver,
    provider::{ModelManager, Provider, ResolvedModel},
    request::RequestContext,
    response_id::ResponseIdSigner,
    saturation::SaturationCoordinator,
    token_counter,
};

use dispatch::Dispatcher;
use metrics::OperationMetrics;
use stream::{ObservedStream, StreamRecord};

/// Result of a chat completion.
pub(crate) enum Completion {
    Response(ChatCompletionResponse),
    Stream(ChatCompletionStream),
}

#[derive(Clone)]
pub(crate) struct LlmServer {
    shared: Arc<LlmServerInner>,
}

pub(crate) struct LlmServerInner {
    authenticator: Authenticator,
    ip_whitelist: Vec<IpNet>,
    models: ModelManager,
    providers: BTreeMap<String, Arc<dyn Provider>>,
    passthrough_provider: Option<String>,
    limiter: PrincipalRateLimiter,
    model_budgets: Arc<ModelBudgetLimiter>,
    hooks: HookPipeline,
    prompts: PromptResolver,
    guardrails: GuardrailRegistry,
    policies: PolicyResolver,
    response_ids: ResponseIdSigner,
    dispatcher: Dispatcher,
    saturation: SaturationCoordinator,
    callbacks: Arc<CallbackRegistry>,
    metrics: OperationMetrics,
}

/// One admitted chat completion, carried from admission to its log record.
struct Call {
    context: RequestContext,
    model: ResolvedModel,
    provider: Arc<dyn Provider>,
    admission: Admission,
    stream: bool,
    guardrails: Arc<Vec<String>>,
    recorder: Recorder,
    /// The request as sent upstream.
    sent: Option<serde_json::Value>,
    /// The response as returned to the client.
    returned: Option<serde_json::Value>,
    api_latency: Option<Duration>,
    time_to_first_token: Option<Duration>,
    usage: Option<Usage>,
    upstream_ok: bool,
}

impl Call {
    fn new(
        context: RequestContext,
        model: ResolvedModel,
        provider: Arc<dyn Provider>,
        admission: Admission,
        stream: bool,
    ) -> Self {
        let recorder = OperationMetrics::operation_recorder(&model, stream);

        Self {
            context,
            model,
            provider,
            admission,
            stream,
            guardrails: Arc::new(Vec::new()),
            recorder,
            sent: None,
            returned: None,
            api_latency: None,
            time_to_first_token: None,
            usage: None,
            upstream_ok: false,
        }
    }
}

impl LlmServer {
    /// Authenticate the caller and check its address against the whitelist.
    pub async fn authorize(
        &self,
        headers: &HeaderMap,
        path: &str,
        client_ip: Option<IpAddr>,
    ) -> crate::Result<RequestContext> {
        let principal = self.shared.authenticator.authenticate(headers, path).await?;

        if !self.ip_allowed(client_ip) {
            log::debug!(
                "Rejecting key {} from address {client_ip:?} outside the whitelist",
                principal.api_key_hash()
            );

            return Err(LlmError::permission("Access from this IP address is not allowed").with_code("ip-not-allowed"));
        }

        Ok(RequestContext::new(principal, client_ip))
    }

    fn ip_allowed(&self, client_ip: Option<IpAddr>) -> bool {
        let whitelist = &self.shared.ip_whitelist;

        whitelist.is_empty() || client_ip.is_some_and(|ip| whitelist.iter().any(|network| network.contains(&ip)))
    }

    /// Configured models the principal may call.
    pub fn models(&self, principal: &Principal) -> ModelsResponse {
        let data = self
            .shared
            .models
            .models()
            .into_iter()
            .filter(|model| principal.can_call_model(&model.id))
            .collect();

        ModelsResponse { object: "list", data }
    }

    /// Run a chat completion through the whole pipeline. The returned headers carry
    /// the caller's rate-limit state.
    pub async fn completions(
        &self,
        context: RequestContext,
        request: ChatCompletionRequest,
    ) -> crate::Result<(Completion, HeaderMap)> {
        let stream = request.is_stream();

        let (model, provider, admission) = match self.admit(&context, &request).await {
            Ok(admitted) => admitted,
            Err(error) => {
                self.reject(&context, &request.model, stream, &error).await;
                return Err(error);
            }
        };

        log::debug!(
            "Admitted request {} for model '{}' on provider '{}'",
            context.request_id,
            model.public_name,
            model.provider
        );

        let headers = admission.headers.to_header_map();
        let mut call = Call::new(context, model, provider, admission, stream);

        let request = match self.prepare(&mut call, request).await {
            Ok(request) => request,
            Err(error) => return Err(self.fail(call, error).await.with_headers(headers)),
        };

        let completion = if stream {
            self.stream(call, request).await.map(Completion::Stream)
        } else {
            self.complete(call, request).await.map(Completion::Response)
        };

        match completion {
            Ok(completion) => Ok((completion, headers)),
            Err(error) => Err(error.with_headers(headers)),
        }
    }

    /// Model, cache-control, budget and rate-limit admission.
    async fn admit(
        &self,
        context: &RequestContext,
        request: &ChatCompletionRequest,
    ) -> crate::Result<(ResolvedModel, Arc<dyn Provider>, Admission)> {
        let principal = &context.principal;

        let Some(model) = self.shared.models.resolve(&request.model) else {
            log::debug!("Model '{}' is not configured", request.model);
            return Err(LlmError::not_found(format!("Model '{}' not found", request.model)).with_param("model"));
        };

        if !principal.can_call_model(&model.public_name) {
            return Err(LlmError::permission(format!(
                "This key is not allowed to call model '{}'",
                model.public_name
            )));
        }

        check_cache_controls(principal, request)?;

        let Some(provider) = self.shared.providers.get(&model.provider).cloned() else {
            log::error!("Model '{}' refers to unknown provider '{}'", model.public_name, model.provider);
            return Err(LlmError::internal());
        };

        rate_limit::check_budget(&principal.info.budget, &model.public_name)?;
        self.shared.model_budgets.check(&model.public_name)?;

        let admission = self
            .shared
            .limiter
            .admit(&AdmissionRequest {
                fingerprint: &principal.fingerprint,
                model: &model.public_name,
                model_group: &model.group,
                estimated_tokens: Some(token_counter::estimate_request_tokens(request)),
                limits: &principal.info.limits,
            })
            .await?;

        Ok((model, provider, admission))
    }

    /// Pre-call hooks, prompt templates and pre-call guardrails. Returns the request
    /// translated for the upstream.
    async fn prepare(&self, call: &mut Call, mut request: ChatCompletionRequest) -> crate::Result<ChatCompletionRequest> {
        let principal = &call.context.principal;

        self.shared.hooks.pre_call(principal, &request).await?;
        self.shared.prompts.apply(&mut request).await?;

        let guardrails = self.shared.policies.resolve(&call.model.public_name, principal);

        let mut request = self
            .shared
            .guardrails
            .run_pre_call(&guardrails, principal, request)
            .await?;

        call.guardrails = guardrails;

        request.model = call.model.upstream_model.clone();
        call.provider.map_params(&mut request);

        call.sent = serde_json::to_value(&request).ok();

        Ok(request)
    }

    async fn complete(&self, mut call: Call, request: ChatCompletionRequest) -> crate::Result<ChatCompletionResponse> {
        let upstream = Instant::now();
        let result = self.shared.dispatcher.complete(call.provider.as_ref(), &request).await;
        call.api_latency = Some(upstream.elapsed());

        let mut response = match result {
            Ok(response) => response,
            Err(error) => {
                let error = error.with_origin(&call.model.provider, &call.model.public_name);
                return Err(self.fail(call, error).await);
            }
        };

        call.upstream_ok = true;
        call.usage = response.usage;
        response.model = call.model.public_name.clone();

        if let Err(error) = self.post_call(&call, &request, &response).await {
            return Err(self.fail(call, error).await);
        }

        call.returned = serde_json::to_value(&response).ok();
        self.finish(call, None).await;

        Ok(response)
    }

    /// Start the upstream stream. Post-call checks and the log record run once it has
    /// ended; a post-call rejection becomes the last item of the stream.
    async fn stream(&self, mut call: Call, request: ChatCompletionRequest) -> crate::Result<ChatCompletionStream> {
        let upstream = Instant::now();
        let result = self.shared.dispatcher.stream(call.provider.clone(), &request).await;
        call.api_latency = Some(upstream.elapsed());

        let chunks = match result {
            Ok(chunks) => chunks,
            Err(error) => {
                let error = error.with_origin(&call.model.provider, &call.model.public_name);
                return Err(self.fail(call, error).await);
            }
        };

        let observed = ObservedStream::new(
            chunks,
            &call.context.request_id,
            &call.model.public_name,
            OperationMetrics::ttft_recorder(&call.model),
        );

        let record = observed.record();
        let server = self.clone();

        let finalize = futures::stream::once(async move { server.finish_stream(call, request, record).await })
            .filter_map(|error| async move { error.map(Err::<ChatCompletionChunk, _>) });

        Ok(Box::pin(observed.chain(finalize)))
    }

    async fn finish_stream(
        &self,
        mut call: Call,
        request: ChatCompletionRequest,
        record: Arc<Mutex<StreamRecord>>,
    ) -> Option<LlmError> {
        let observed = record
            .lock()
            .map(|mut record| {
                (
                    record.response(),
                    record.usage(),
                    record.take_error(),
                    record.time_to_first_token(),
                )
            })
            .ok();

        let Some((response, usage, error, time_to_first_token)) = observed else {
            log::error!("Stream record of request {} is poisoned", call.context.request_id);
            return Some(self.fail(call, LlmError::internal()).await);
        };

        call.usage = usage;
        call.time_to_first_token = time_to_first_token;

        // already delivered to the client as the last item of the stream
        if let Some(error) = error {
            self.fail(call, error).await;
            return None;
        }

        call.upstream_ok = true;

        if let Err(error) = self.post_call(&call, &request, &response).await {
            return Some(self.fail(call, error).await);
        }

        call.returned = serde_json::to_value(&response).ok();
        self.finish(call, None).await;

        None
    }

    async fn post_call(
        &self,
        call: &Call,
        request: &ChatCompletionRequest,
        response: &ChatCompletionResponse,
    ) -> crate::Result<()> {
        let principal = &call.context.principal;

        self.shared
            .guardrails
            .run_post_call(&call.guardrails, principal, request, response)
            .await?;

        self.shared.hooks.post_call(principal, request, response).await
    }

    /// Record a call that failed after admission and hand the error back.
    async fn fail(&self, call: Call, error: LlmError) -> LlmError {
        log::debug!("Request {} failed: {error}", call.context.request_id);

        self.finish(call, Some(&error)).await;
        error
    }

    /// Log record, metrics, TPM reconciliation and saturation of a finished call. The
    /// parallel slot is released when the call is dropped at the end.
    async fn finish(&self, call: Call, error: Option<&LlmError>) {
        let Call {
            context,
            model,
            mut admission,
            stream,
            mut recorder,
            sent,
            returned,
            api_latency,
            time_to_first_token,
            usage,
            upstream_ok,
            ..
        } = call;

        let mut data = log_data(&context, &model.public_name, stream, error);

        data.model_group = model.group.clone();
        data.provider = model.provider.clone();
        data.api_latency = api_latency;
        data.time_to_first_token = time_to_first_token;
        data.request = sent;
        data.response = returned;

        let total_tokens = match usage {
            Some(usage) => {
                data.prompt_tokens = u64::from(usage.prompt_tokens);
                data.completion_tokens = u64::from(usage.completion_tokens);
                data.cache_read_tokens = u64::from(usage.cached_tokens());
                data.cache_creation_tokens = u64::from(usage.cache_creation_input_tokens.unwrap_or_default());
                data.cache_hit = data.cache_read_tokens > 0;
                data.spend = model.cost(&usage);

                self.shared.metrics.record_usage(&model, &usage);

                u64::from(usage.total_tokens)
            }
            None => 0,
        };

        match error {
            Some(error) => recorder.push_attribute("error.type", error.kind().code()),
            None => recorder.push_attribute("tianji.request.status", "success"),
        }

        recorder.record();

        self.shared.callbacks.dispatch(&data).await;

        if let Some(reservation) = admission.reservation.take() {
            reservation.reconcile(total_tokens).await;
        }

        if upstream_ok {
            self.shared.saturation.record(&model.group, total_tokens).await;
        }
    }

    /// Record a call rejected before admission completed.
    async fn reject(&self, context: &RequestContext, model: &str, stream: bool, error: &LlmError) {
        log::debug!("Request {} rejected: {error}", context.request_id);

        let data = log_data(context, model, stream, Some(error));
        self.shared.callbacks.dispatch(&data).await;
    }
}

/// Every requested cache directive must be allowed for the key. Admins may use any.
fn check_cache_controls(principal: &Principal, request: &ChatCompletionRequest) -> crate::Result<()> {
    let Some(cache) = &request.cache else {
        return Ok(());
    };

    if principal.is_admin() {
        return Ok(());
    }

    match cache
        .keys()
        .find(|directive| !principal.info.allowed_cache_controls.contains(directive.as_str()))
    {
        Some(directive) => Err(LlmError::permission(format!(
            "Cache control '{directive}' is not allowed for this key"
        ))
        .with_param("cache")),
        None => Ok(()),
    }
}

fn log_data(context: &RequestContext, model: &str, stream: bool, error: Option<&LlmError>) -> LogData {
    let principal = &context.principal;
    let mut data = LogData::new(&context.request_id, "chat_completion", model);

    data.api_key_hash = principal.api_key_hash().to_string();
    data.key_fingerprint = Some(principal.fingerprint.clone());
    data.user_id = principal.info.user_id.clone();
    data.team_id = principal.info.team_id.clone();
    data.org_id = principal.info.org_id.clone();
    data.tags = principal.info.tags.clone();
    data.stream = stream;
    data.start_time = context.started_at;
    data.end_time = Timestamp::now();

    if let Some(error) = error {
        mark_failure(&mut data, error);
    }

    data
}

fn mark_failure(data: &mut LogData, error: &LlmError) {
    data.status = LogStatus::Failure;
    data.error = Some(LogError {
        kind: error.kind().code().to_string(),
        status_code: error.status_code().as_u16(),
        message: error.message().to_string(),
    });
}
