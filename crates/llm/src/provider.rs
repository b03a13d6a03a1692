//! The contract every upstream dialect satisfies, and the registry that builds
//! providers from configuration.

pub(crate) mod bedrock;
mod model_manager;
pub(crate) mod openai;

use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;
use config::{ProviderConfig, ProviderType};
use http::{HeaderMap, Method};
use secrecy::SecretString;
use url::Url;

pub(crate) use model_manager::{GroupCapacity, ModelManager, ResolvedModel};

use crate::{
    error::LlmError,
    messages::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse},
};

/// An HTTP request ready to be sent upstream.
#[derive(Debug, Clone)]
pub(crate) struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// How a streaming response body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamFraming {
    /// Server-sent events, one JSON document per `data:` line.
    ServerSentEvents,
    /// AWS event-stream binary messages.
    AwsEventStream,
}

/// Result of translating one upstream stream frame.
#[derive(Debug, Default)]
pub(crate) struct StreamEvent {
    /// The OpenAI chunk for this frame, if it carries anything the client sees.
    pub chunk: Option<ChatCompletionChunk>,
    /// The frame finished the message. Trailing frames may still carry usage.
    pub is_final: bool,
}

/// A dialect translator between the OpenAI wire format and an upstream API.
///
/// Providers never perform I/O themselves: the dispatcher sends what
/// [`Provider::transform_request`] builds and hands the body back for translation.
pub(crate) trait Provider: Send + Sync {
    /// Configured provider name.
    fn name(&self) -> &str;

    /// Credential forwarded upstream, if any.
    fn credential(&self) -> Option<&SecretString>;

    /// Request parameters this provider natively honours.
    fn supported_params(&self) -> &'static [&'static str];

    /// Rename or drop parameters the upstream does not understand.
    fn map_params(&self, request: &mut ChatCompletionRequest);

    /// Build the upstream call for a chat request. `request.model` is the upstream model id.
    fn transform_request(
        &self,
        request: &ChatCompletionRequest,
        credential: Option<&SecretString>,
    ) -> crate::Result<UpstreamRequest>;

    /// Translate an upstream response, successful or not.
    fn transform_response(&self, status: u16, body: &[u8]) -> crate::Result<ChatCompletionResponse>;

    /// Framing of streaming response bodies.
    fn stream_framing(&self) -> StreamFraming;

    /// Translate one frame of a streaming response.
    fn transform_stream_chunk(&self, frame: &[u8]) -> crate::Result<StreamEvent>;

    /// Build a call forwarded verbatim to `path` of the upstream API, for endpoints
    /// the gateway does not translate.
    fn transform_passthrough(
        &self,
        method: Method,
        path: &str,
        _headers: &HeaderMap,
        _body: Bytes,
    ) -> crate::Result<UpstreamRequest> {
        log::debug!("Provider '{}' cannot forward {method} {path}", self.name());

        Err(LlmError::invalid_request(format!(
            "Provider '{}' does not support the {path} endpoint",
            self.name()
        )))
    }
}

/// Builds a provider from its configuration.
pub(crate) type ProviderFactory = Box<dyn Fn(&str, &ProviderConfig) -> crate::Result<Arc<dyn Provider>> + Send + Sync>;

/// Provider factories by provider type.
#[derive(Default)]
pub(crate) struct ProviderRegistry {
    factories: BTreeMap<&'static str, ProviderFactory>,
}

impl ProviderRegistry {
    /// The registry with every provider type this crate ships.
    pub fn builtin() -> Self {
        let mut registry = Self::default();

        registry.register(
            type_name(ProviderType::Openai),
            Box::new(|name, config| Ok(Arc::new(openai::OpenAiProvider::new(name, config)?))),
        );

        registry.register(
            type_name(ProviderType::Bedrock),
            Box::new(|name, config| Ok(Arc::new(bedrock::BedrockProvider::new(name, config)?))),
        );

        registry
    }

    pub fn register(&mut self, provider_type: &'static str, factory: ProviderFactory) {
        self.factories.insert(provider_type, factory);
    }

    pub fn build(&self, name: &str, config: &ProviderConfig) -> crate::Result<Arc<dyn Provider>> {
        let provider_type = type_name(config.provider_type);

        let Some(factory) = self.factories.get(provider_type) else {
            log::error!("No factory registered for provider type '{provider_type}'");
            return Err(LlmError::internal());
        };

        factory(name, config)
    }
}

fn type_name(provider_type: ProviderType) -> &'static str {
    match provider_type {
        ProviderType::Openai => "openai",
        ProviderType::Bedrock => "bedrock",
    }
}

/// Parse a configured base URL, making sure relative joins keep its path.
pub(crate) fn base_url(provider: &str, configured: Option<&str>, default: &str) -> crate::Result<Url> {
    let raw = configured.unwrap_or(default);

    let raw = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };

    Url::parse(&raw).map_err(|e| {
        log::error!("Invalid base URL '{raw}' for provider '{provider}': {e}");
        LlmError::internal()
    })
}

/// Join a relative path onto a base URL.
pub(crate) fn join(base: &Url, path: &str) -> crate::Result<Url> {
    base.join(path.trim_start_matches('/')).map_err(|e| {
        log::error!("Failed to build upstream URL from '{base}' and '{path}': {e}");
        LlmError::internal()
    })
}

/// The `message` of an upstream error body, looked up at the top level and
/// inside an `error` object.
pub(crate) fn upstream_error_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;

    value
        .get("message")
        .or_else(|| value.get("error").and_then(|error| error.get("message")))
        .or_else(|| value.get("Message"))
        .and_then(|message| message.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_keeps_path() {
        let base = base_url("openai", Some("http://localhost:8080/v1"), "https://api.openai.com/v1").unwrap();
        let url = join(&base, "/chat/completions").unwrap();

        insta::assert_snapshot!(url, @"http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            upstream_error_message(br#"{"error":{"message":"bad key","type":"invalid_request_error"}}"#).as_deref(),
            Some("bad key")
        );
        assert_eq!(
            upstream_error_message(br#"{"message":"Too many requests"}"#).as_deref(),
            Some("Too many requests")
        );
        assert_eq!(upstream_error_message(b"<html>oops</html>"), None);
    }
}
