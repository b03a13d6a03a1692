use bytes::Bytes;
use config::ProviderConfig;
use http::{
    HeaderMap, HeaderValue, Method,
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::{
    error::LlmError,
    messages::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, StreamOptions},
    provider::{Provider, StreamEvent, StreamFraming, UpstreamRequest, base_url, join, upstream_error_message},
};

const DEFAULT_OPENAI_API_URL: &str = "https://api.openai.com/v1";

const SUPPORTED_PARAMS: &[&str] = &[
    "model",
    "messages",
    "stream",
    "stream_options",
    "max_tokens",
    "max_completion_tokens",
    "temperature",
    "top_p",
    "n",
    "stop",
    "seed",
    "tools",
    "tool_choice",
    "parallel_tool_calls",
    "response_format",
    "presence_penalty",
    "frequency_penalty",
    "logit_bias",
    "logprobs",
    "top_logprobs",
    "user",
];

/// Any upstream speaking the OpenAI dialect. Requests go out as they came in.
pub(crate) struct OpenAiProvider {
    name: String,
    base_url: Url,
    api_key: Option<SecretString>,
}

impl OpenAiProvider {
    pub fn new(name: &str, config: &ProviderConfig) -> crate::Result<Self> {
        Ok(Self {
            name: name.to_string(),
            base_url: base_url(name, config.base_url.as_deref(), DEFAULT_OPENAI_API_URL)?,
            api_key: config.api_key.clone(),
        })
    }

    fn headers(&self, credential: Option<&SecretString>, content_type: HeaderValue) -> crate::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, content_type);

        if let Some(key) = credential {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret())).map_err(|_| {
                log::error!("API key of provider '{}' is not a valid header value", self.name);
                LlmError::internal()
            })?;

            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        Ok(headers)
    }
}

impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn credential(&self) -> Option<&SecretString> {
        self.api_key.as_ref()
    }

    fn supported_params(&self) -> &'static [&'static str] {
        SUPPORTED_PARAMS
    }

    fn map_params(&self, request: &mut ChatCompletionRequest) {
        // usage arrives only when asked for
        if request.is_stream() {
            request
                .stream_options
                .get_or_insert_with(StreamOptions::default)
                .include_usage = Some(true);
        }
    }

    fn transform_request(
        &self,
        request: &ChatCompletionRequest,
        credential: Option<&SecretString>,
    ) -> crate::Result<UpstreamRequest> {
        let body = serde_json::to_vec(request).map_err(|e| {
            log::error!("Failed to serialize OpenAI request: {e}");
            LlmError::internal()
        })?;

        Ok(UpstreamRequest {
            method: Method::POST,
            url: join(&self.base_url, "chat/completions")?,
            headers: self.headers(credential, HeaderValue::from_static("application/json"))?,
            body: Bytes::from(body),
        })
    }

    fn transform_response(&self, status: u16, body: &[u8]) -> crate::Result<ChatCompletionResponse> {
        if !(200..300).contains(&status) {
            log::debug!("OpenAI API error ({status}) from provider '{}'", self.name);
            return Err(LlmError::from_upstream(status, upstream_error_message(body)));
        }

        sonic_rs::from_slice(body).map_err(|e| {
            log::error!("Failed to parse OpenAI chat completion response: {e}");
            LlmError::internal()
        })
    }

    fn stream_framing(&self) -> StreamFraming {
        StreamFraming::ServerSentEvents
    }

    fn transform_stream_chunk(&self, frame: &[u8]) -> crate::Result<StreamEvent> {
        if frame.trim_ascii() == b"[DONE]" {
            return Ok(StreamEvent {
                chunk: None,
                is_final: true,
            });
        }

        match sonic_rs::from_slice::<ChatCompletionChunk>(frame) {
            Ok(chunk) => Ok(StreamEvent {
                chunk: Some(chunk),
                is_final: false,
            }),
            Err(e) => {
                log::warn!("Failed to parse OpenAI streaming chunk: {e}");
                Ok(StreamEvent::default())
            }
        }
    }

    fn transform_passthrough(
        &self,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> crate::Result<UpstreamRequest> {
        let content_type = headers
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("application/json"));

        let path = path.strip_prefix("/v1").unwrap_or(path);

        Ok(UpstreamRequest {
            method,
            url: join(&self.base_url, path)?,
            headers: self.headers(self.credential(), content_type)?,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::error::ErrorKind;

    fn provider() -> OpenAiProvider {
        let config: ProviderConfig = toml::from_str(indoc! {r#"
            type = "openai"
            api_key = "sk-upstream"
            base_url = "http://localhost:9000/v1"
        "#})
        .unwrap();

        OpenAiProvider::new("openai", &config).unwrap()
    }

    #[test]
    fn streaming_requests_ask_for_usage() {
        let provider = provider();

        let mut request: ChatCompletionRequest = serde_json::from_str(indoc! {r#"
            {"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}], "stream": true, "seed": 7}
        "#})
        .unwrap();

        provider.map_params(&mut request);

        let upstream = provider.transform_request(&request, provider.credential()).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&upstream.body).unwrap();

        assert_eq!(upstream.url.as_str(), "http://localhost:9000/v1/chat/completions");
        assert_eq!(upstream.headers[AUTHORIZATION], "Bearer sk-upstream");

        insta::assert_json_snapshot!(body, @r#"
        {
          "model": "gpt-4o",
          "messages": [
            {
              "role": "user",
              "content": "hi"
            }
          ],
          "stream": true,
          "stream_options": {
            "include_usage": true
          },
          "seed": 7
        }
        "#);
    }

    #[test]
    fn errors_use_upstream_message() {
        let error = provider()
            .transform_response(401, br#"{"error":{"message":"Incorrect API key provided: sk-up***","code":"invalid_api_key"}}"#)
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Authentication);
        insta::assert_snapshot!(error, @"Incorrect API key provided: sk-up***");
    }

    #[test]
    fn stream_frames() {
        let provider = provider();

        let event = provider
            .transform_stream_chunk(br#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"Hi"}}]}"#)
            .unwrap();

        assert!(!event.is_final);
        assert_eq!(event.chunk.unwrap().choices[0].delta.content.as_deref(), Some("Hi"));

        let done = provider.transform_stream_chunk(b"[DONE]").unwrap();
        assert!(done.is_final && done.chunk.is_none());

        let garbage = provider.transform_stream_chunk(b"{not json").unwrap();
        assert!(!garbage.is_final && garbage.chunk.is_none());
    }

    #[test]
    fn passthrough_keeps_body() {
        let provider = provider();
        let body = Bytes::from_static(br#"{"model":"text-embedding-3-small","input":"hi"}"#);

        let upstream = provider
            .transform_passthrough(Method::POST, "/v1/embeddings", &HeaderMap::new(), body.clone())
            .unwrap();

        assert_eq!(upstream.url.as_str(), "http://localhost:9000/v1/embeddings");
        assert_eq!(upstream.body, body);
    }
}
