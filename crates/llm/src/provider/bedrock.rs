//! AWS Bedrock through the Converse API.
//!
//! Requests authenticate with a Bedrock API key sent as a bearer token. Streaming
//! responses are framed as AWS event-stream messages, which the dispatcher decodes
//! into `{"<event-type>": payload}` frames before they reach this provider.

pub(crate) mod event_stream;
mod input;
mod output;

use bytes::Bytes;
use config::ProviderConfig;
use http::{
    HeaderMap, HeaderValue, Method,
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::{
    error::LlmError,
    messages::{ChatCompletionRequest, ChatCompletionResponse},
    provider::{Provider, StreamEvent, StreamFraming, UpstreamRequest, base_url, upstream_error_message},
};

const DEFAULT_REGION: &str = "us-east-1";

const SUPPORTED_PARAMS: &[&str] = &[
    "model",
    "messages",
    "stream",
    "max_tokens",
    "temperature",
    "top_p",
    "stop",
    "tools",
    "tool_choice",
];

pub(crate) struct BedrockProvider {
    name: String,
    base_url: Url,
    api_key: Option<SecretString>,
}

impl BedrockProvider {
    pub fn new(name: &str, config: &ProviderConfig) -> crate::Result<Self> {
        let region = config.region.as_deref().unwrap_or(DEFAULT_REGION);
        let default_url = format!("https://bedrock-runtime.{region}.amazonaws.com");

        Ok(Self {
            name: name.to_string(),
            base_url: base_url(name, config.base_url.as_deref(), &default_url)?,
            api_key: config.api_key.clone(),
        })
    }

    fn endpoint(&self, model: &str, stream: bool) -> crate::Result<Url> {
        let mut url = self.base_url.clone();

        // model ids contain colons and slashes, so they go in as a single encoded segment
        url.path_segments_mut()
            .map_err(|_| {
                log::error!("Base URL of provider '{}' cannot carry a path", self.name);
                LlmError::internal()
            })?
            .pop_if_empty()
            .push("model")
            .push(model)
            .push(if stream { "converse-stream" } else { "converse" });

        Ok(url)
    }
}

impl Provider for BedrockProvider {
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
        if !request.extra.is_empty() {
            let dropped: Vec<&str> = request.extra.keys().map(String::as_str).collect();
            log::debug!("Dropping parameters unsupported by Bedrock: {}", dropped.join(", "));

            request.extra.clear();
        }

        request.stream_options = None;
        request.user = None;
    }

    fn transform_request(
        &self,
        request: &ChatCompletionRequest,
        credential: Option<&SecretString>,
    ) -> crate::Result<UpstreamRequest> {
        let converse = input::ConverseRequest::from(request);

        let body = serde_json::to_vec(&converse).map_err(|e| {
            log::error!("Failed to serialize Bedrock Converse request: {e}");
            LlmError::internal()
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if request.is_stream() {
            headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.amazon.eventstream"));
        }

        if let Some(key) = credential {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret())).map_err(|_| {
                log::error!("API key of provider '{}' is not a valid header value", self.name);
                LlmError::internal()
            })?;

            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        Ok(UpstreamRequest {
            method: Method::POST,
            url: self.endpoint(&request.model, request.is_stream())?,
            headers,
            body: Bytes::from(body),
        })
    }

    fn transform_response(&self, status: u16, body: &[u8]) -> crate::Result<ChatCompletionResponse> {
        if !(200..300).contains(&status) {
            log::debug!("Bedrock API error ({status}) from provider '{}'", self.name);
            return Err(LlmError::from_upstream(status, upstream_error_message(body)));
        }

        let response: output::ConverseResponse = serde_json::from_slice(body).map_err(|e| {
            log::error!("Failed to parse Bedrock Converse response: {e}");
            LlmError::internal()
        })?;

        Ok(response.into())
    }

    fn stream_framing(&self) -> StreamFraming {
        StreamFraming::AwsEventStream
    }

    fn transform_stream_chunk(&self, frame: &[u8]) -> crate::Result<StreamEvent> {
        output::stream_event(frame)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::error::ErrorKind;

    fn provider(extra: &str) -> BedrockProvider {
        let config: ProviderConfig = toml::from_str(&format!("type = \"bedrock\"\napi_key = \"br-key\"\n{extra}")).unwrap();
        BedrockProvider::new("bedrock", &config).unwrap()
    }

    fn request(stream: bool) -> ChatCompletionRequest {
        let mut request: ChatCompletionRequest = serde_json::from_str(indoc! {r#"
            {
              "model": "anthropic.claude-3-5-sonnet-20240620-v1:0",
              "messages": [{"role": "user", "content": "hi"}],
              "seed": 7,
              "user": "alice"
            }
        "#})
        .unwrap();

        request.stream = Some(stream);
        request
    }

    #[test]
    fn regional_endpoint() {
        let provider = provider("region = \"eu-west-1\"");
        let upstream = provider.transform_request(&request(false), provider.credential()).unwrap();

        insta::assert_snapshot!(
            upstream.url,
            @"https://bedrock-runtime.eu-west-1.amazonaws.com/model/anthropic.claude-3-5-sonnet-20240620-v1:0/converse"
        );
        assert_eq!(upstream.headers[AUTHORIZATION], "Bearer br-key");
    }

    #[test]
    fn streaming_endpoint_behind_proxy() {
        let provider = provider("base_url = \"http://localhost:9100/bedrock\"");
        let upstream = provider.transform_request(&request(true), None).unwrap();

        insta::assert_snapshot!(
            upstream.url,
            @"http://localhost:9100/bedrock/model/anthropic.claude-3-5-sonnet-20240620-v1:0/converse-stream"
        );
        assert_eq!(upstream.headers[ACCEPT], "application/vnd.amazon.eventstream");
        assert!(upstream.headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn unsupported_params_are_dropped() {
        let provider = provider("");
        let mut request = request(false);

        provider.map_params(&mut request);

        assert!(request.extra.is_empty());
        assert!(request.user.is_none());

        let upstream = provider.transform_request(&request, None).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&upstream.body).unwrap();

        insta::assert_json_snapshot!(body, @r#"
        {
          "messages": [
            {
              "role": "user",
              "content": [
                {
                  "text": "hi"
                }
              ]
            }
          ]
        }
        "#);
    }

    #[test]
    fn errors_use_upstream_message() {
        let error = provider("")
            .transform_response(429, br#"{"message":"Too many requests, please wait before trying again."}"#)
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::RateLimit);
        insta::assert_snapshot!(error, @"Too many requests, please wait before trying again.");
    }

    #[test]
    fn decoded_stream_frames() {
        let provider = provider("");
        let mut decoder = event_stream::EventStreamDecoder::default();

        decoder.push(&event_stream::tests::event(
            "contentBlockDelta",
            r#"{"contentBlockIndex":0,"delta":{"text":"Hello"}}"#,
        ));

        let frame = decoder.next_message().unwrap().unwrap().to_frame().unwrap();
        let event = provider.transform_stream_chunk(&frame).unwrap();

        assert_eq!(event.chunk.unwrap().choices[0].delta.content.as_deref(), Some("Hello"));
    }
}
