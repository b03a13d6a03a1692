//! OpenAI compatible endpoints of the gateway.
//!
//! Chat completions run through the full admission and dispatch pipeline. The other
//! OpenAI endpoints are forwarded to the provider serving the requested model.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use auth::CredentialStore;
use axum::{
    Router,
    extract::{ConnectInfo, Extension, Json, Path, State},
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::{get, post},
};
use bytes::Bytes;
use callbacks::CallbackRegistry;
use futures::StreamExt;
use rate_limit::Storage;

mod error;
mod guardrails;
mod hooks;
mod messages;
mod prompts;
mod provider;
mod request;
mod response_id;
mod saturation;
mod server;
mod spend;
pub mod token_counter;

use error::LlmError;
use messages::ChatCompletionRequest;
use server::{Completion, LlmServer, LlmServerBuilder};

pub(crate) type Result<T> = std::result::Result<T, LlmError>;

/// Forwarded endpoints and the call type their log records carry.
const PASSTHROUGH_ROUTES: &[(&str, &str)] = &[
    ("/v1/embeddings", "embeddings"),
    ("/v1/images/generations", "image_generation"),
    ("/v1/audio/transcriptions", "transcription"),
    ("/v1/audio/speech", "speech"),
    ("/v1/moderations", "moderation"),
    ("/v1/completions", "text_completion"),
    ("/v1/rerank", "rerank"),
];

/// Resource collections, reachable with any method and on nested paths.
const RESOURCE_ROUTES: &[(&str, &str)] = &[
    ("/v1/files", "files"),
    ("/v1/batches", "batches"),
    ("/v1/fine_tuning/jobs", "fine_tuning"),
];

/// Configuration for creating the LLM router.
pub struct RouterConfig {
    config: config::Config,
    storage: Arc<Storage>,
    callbacks: CallbackRegistry,
    credential_store: Option<Arc<dyn CredentialStore>>,
}

impl RouterConfig {
    /// Create a new router configuration builder.
    pub fn builder(config: config::Config, storage: Arc<Storage>) -> RouterConfigBuilder {
        RouterConfigBuilder {
            config,
            storage,
            callbacks: None,
            credential_store: None,
        }
    }
}

/// Builder for creating router configuration.
pub struct RouterConfigBuilder {
    config: config::Config,
    storage: Arc<Storage>,
    callbacks: Option<CallbackRegistry>,
    credential_store: Option<Arc<dyn CredentialStore>>,
}

impl RouterConfigBuilder {
    /// Sinks receiving the log record of every call. The spend sink is added to them.
    pub fn callbacks(mut self, callbacks: CallbackRegistry) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Use a credential store other than the static keys of `[auth]`.
    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credential_store = Some(store);
        self
    }

    /// Build the router configuration.
    pub fn build(self) -> RouterConfig {
        RouterConfig {
            config: self.config,
            storage: self.storage,
            callbacks: self
                .callbacks
                .unwrap_or_else(|| CallbackRegistry::new(Default::default())),
            credential_store: self.credential_store,
        }
    }
}

/// The LLM routes with the callback registry they dispatch to.
pub struct LlmRouter {
    /// Routes mounted at the configured path.
    pub router: Router,
    /// Must be shut down after the server stopped so batched records are flushed.
    pub callbacks: Arc<CallbackRegistry>,
}

/// Creates an axum router for LLM endpoints.
pub async fn router(config: RouterConfig) -> anyhow::Result<LlmRouter> {
    let RouterConfig {
        config,
        storage,
        callbacks,
        credential_store,
    } = config;

    let mut builder = LlmServerBuilder::new(&config, storage, callbacks);

    if let Some(store) = credential_store {
        builder = builder.credential_store(store);
    }

    let (server, callbacks) = builder
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to initialize LLM server: {e}"))?;

    let mut routes = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/v1/responses", post(create_response))
        .route("/v1/responses/{id}", get(response).delete(response));

    for (path, _) in PASSTHROUGH_ROUTES {
        routes = routes.route(path, post(passthrough));
    }

    for (path, _) in RESOURCE_ROUTES {
        routes = routes
            .route(path, get(passthrough).post(passthrough))
            .route(&format!("{path}/{{*rest}}"), get(passthrough).post(passthrough).delete(passthrough));
    }

    let routes = routes.with_state(server);
    let path = config.llm.path.trim_end_matches('/');

    log::info!("Mounting LLM endpoints at '{}'", config.llm.path);

    let router = if path.is_empty() {
        Router::new().merge(routes)
    } else {
        Router::new().nest(path, routes)
    };

    Ok(LlmRouter { router, callbacks })
}

type ClientAddress = Option<Extension<ConnectInfo<SocketAddr>>>;

fn client_ip(address: ClientAddress) -> Option<std::net::IpAddr> {
    address.map(|Extension(ConnectInfo(address))| address.ip())
}

/// Handle chat completion requests.
///
/// When `stream: true` is set in the request, the response is sent as Server-Sent
/// Events. Otherwise, a standard JSON response is returned.
async fn chat_completions(
    State(server): State<LlmServer>,
    address: ClientAddress,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let context = server.authorize(&headers, uri.path(), client_ip(address)).await?;

    let request: ChatCompletionRequest = serde_json::from_slice(&body).map_err(|e| {
        log::debug!("Rejecting malformed chat completion request: {e}");
        LlmError::invalid_request(format!("Invalid request body: {e}"))
    })?;

    log::debug!(
        "Chat completion request {} for model '{}' with {} messages",
        context.request_id,
        request.model,
        request.messages.len()
    );

    let (completion, rate_limit_headers) = server.completions(context, request).await?;

    let response = match completion {
        Completion::Response(response) => {
            log::debug!("Returning chat completion with {} choices", response.choices.len());
            Json(response).into_response()
        }
        Completion::Stream(stream) => {
            let events = stream
                .map(|result| {
                    let event = match result {
                        Ok(chunk) => {
                            let json = sonic_rs::to_string(&chunk).unwrap_or_else(|e| {
                                log::error!("Failed to serialize chunk: {e}");
                                r#"{"error":{"message":"Internal server error","type":"internal_error","code":"internal"}}"#
                                    .to_string()
                            });

                            Event::default().data(json)
                        }
                        Err(error) => {
                            log::debug!("Stream ended with error: {error}");
                            Event::default().data(error_event(&error))
                        }
                    };

                    Ok::<_, Infallible>(event)
                })
                .chain(futures::stream::once(async {
                    Ok::<_, Infallible>(Event::default().data("[DONE]"))
                }));

            Sse::new(events).into_response()
        }
    };

    Ok((rate_limit_headers, response).into_response())
}

fn error_event(error: &LlmError) -> String {
    serde_json::to_string(&error.envelope()).unwrap_or_else(|_| format!(r#"{{"error":{{"message":"{error}"}}}}"#))
}

/// Handle list models requests.
async fn list_models(
    State(server): State<LlmServer>,
    address: ClientAddress,
    uri: Uri,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let context = server.authorize(&headers, uri.path(), client_ip(address)).await?;
    let response = server.models(&context.principal);

    log::debug!("Returning {} models", response.data.len());
    Ok(Json(response))
}

async fn passthrough(
    State(server): State<LlmServer>,
    address: ClientAddress,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let path = uri.path();
    let context = server.authorize(&headers, path, client_ip(address)).await?;

    let call_type = PASSTHROUGH_ROUTES
        .iter()
        .chain(RESOURCE_ROUTES)
        .find(|(prefix, _)| path == *prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/')))
        .map(|(_, call_type)| *call_type)
        .unwrap_or("passthrough");

    let path = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };

    server
        .passthrough(context, call_type, method, &path, &headers, body)
        .await
}

async fn create_response(
    State(server): State<LlmServer>,
    address: ClientAddress,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let context = server.authorize(&headers, uri.path(), client_ip(address)).await?;
    server.create_response(context, &headers, body).await
}

async fn response(
    State(server): State<LlmServer>,
    address: ClientAddress,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response> {
    let context = server.authorize(&headers, uri.path(), client_ip(address)).await?;
    server.response(context, method, &id).await
}
