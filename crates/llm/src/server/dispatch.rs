//! Sends translated calls upstream and turns the answers back into OpenAI types.

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use callbacks::{RateLimitAlerter, RateLimitStateCache, UpstreamRateLimits};
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use http::HeaderMap;
use secrecy::ExposeSecret;

use crate::{
    error::{ErrorKind, LlmError},
    messages::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse},
    provider::{
        Provider, StreamFraming, UpstreamRequest,
        bedrock::event_stream::{EventStreamDecoder, FrameError},
    },
};

/// Chunks of a streamed chat completion, already in the OpenAI format.
pub(crate) type ChatCompletionStream = Pin<Box<dyn Stream<Item = crate::Result<ChatCompletionChunk>> + Send>>;

type FrameStream = Pin<Box<dyn Stream<Item = crate::Result<Bytes>> + Send>>;

/// The HTTP side of every upstream call.
pub(crate) struct Dispatcher {
    client: reqwest::Client,
    rate_limits: Arc<RateLimitStateCache>,
    alerter: Option<RateLimitAlerter>,
}

impl Dispatcher {
    pub fn new(client: reqwest::Client, rate_limits: Arc<RateLimitStateCache>, alerter: Option<RateLimitAlerter>) -> Self {
        Self {
            client,
            rate_limits,
            alerter,
        }
    }

    /// Send a prepared request. Rate-limit headers of the answer are recorded whatever
    /// its status.
    pub async fn send(&self, provider: &dyn Provider, request: UpstreamRequest) -> crate::Result<reqwest::Response> {
        log::debug!("Sending {} {} for provider '{}'", request.method, request.url, provider.name());

        let response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| transport_error(provider.name(), e))?;

        self.observe(provider, response.headers());

        Ok(response)
    }

    /// A non-streaming chat completion.
    pub async fn complete(
        &self,
        provider: &dyn Provider,
        request: &ChatCompletionRequest,
    ) -> crate::Result<ChatCompletionResponse> {
        let upstream = provider.transform_request(request, provider.credential())?;
        let response = self.send(provider, upstream).await?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| transport_error(provider.name(), e))?;

        provider.transform_response(status, &body)
    }

    /// A streaming chat completion. Fails before the first chunk when the upstream
    /// rejects the call.
    pub async fn stream(
        &self,
        provider: Arc<dyn Provider>,
        request: &ChatCompletionRequest,
    ) -> crate::Result<ChatCompletionStream> {
        let upstream = provider.transform_request(request, provider.credential())?;
        let response = self.send(provider.as_ref(), upstream).await?;

        let status = response.status();

        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();

            return Err(match provider.transform_response(status.as_u16(), &body) {
                Err(error) => error,
                Ok(_) => LlmError::from_upstream(status.as_u16(), None),
            });
        }

        let name = provider.name().to_string();
        let bytes = response.bytes_stream();

        let frames: FrameStream = match provider.stream_framing() {
            StreamFraming::ServerSentEvents => Box::pin(sse_frames(bytes, name)),
            StreamFraming::AwsEventStream => Box::pin(event_stream_frames(bytes, name)),
        };

        let chunks = frames.filter_map(move |frame| {
            let provider = provider.clone();

            async move {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(error) => return Some(Err(error)),
                };

                match provider.transform_stream_chunk(&frame) {
                    Ok(event) => event.chunk.map(Ok),
                    Err(error) => Some(Err(error)),
                }
            }
        });

        Ok(Box::pin(chunks))
    }

    fn observe(&self, provider: &dyn Provider, headers: &HeaderMap) {
        let Some(limits) = UpstreamRateLimits::from_headers(headers) else {
            return;
        };

        if let Some(alerter) = &self.alerter {
            for message in alerter.observe(provider.name(), &limits) {
                log::info!("Rate-limit alert sent: {message}");
            }
        }

        let key = match provider.credential() {
            Some(credential) => auth::fingerprint(credential.expose_secret()),
            None => provider.name().to_string(),
        };

        self.rate_limits.update(&key, limits);
    }
}

fn sse_frames(
    bytes: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    provider: String,
) -> impl Stream<Item = crate::Result<Bytes>> + Send {
    bytes.eventsource().filter_map(move |event| {
        let result = match event {
            Ok(event) if event.data.is_empty() => None,
            Ok(event) => Some(Ok(Bytes::from(event.data))),
            Err(e) => {
                log::warn!("Stream from provider '{provider}' broke off: {e}");
                Some(Err(interrupted(&provider)))
            }
        };

        async move { result }
    })
}

struct FrameState<S> {
    bytes: Pin<Box<S>>,
    decoder: EventStreamDecoder,
    provider: String,
    done: bool,
}

fn event_stream_frames<S>(bytes: S, provider: String) -> impl Stream<Item = crate::Result<Bytes>> + Send
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let state = FrameState {
        bytes: Box::pin(bytes),
        decoder: EventStreamDecoder::default(),
        provider,
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(message) = state.decoder.next_message() {
                let frame = message
                    .and_then(|message| message.to_frame())
                    .map(Bytes::from)
                    .map_err(|e| frame_error(&state.provider, e));

                // a broken frame leaves nothing to resynchronize on
                if frame.is_err() {
                    state.done = true;
                }

                return Some((frame, state));
            }

            if state.done {
                if state.decoder.has_remaining() {
                    log::warn!("Stream from provider '{}' ended inside a message", state.provider);
                }

                return None;
            }

            match state.bytes.next().await {
                Some(Ok(bytes)) => state.decoder.push(&bytes),
                Some(Err(e)) => {
                    log::warn!("Stream from provider '{}' broke off: {e}", state.provider);
                    state.done = true;

                    let error = interrupted(&state.provider);
                    return Some((Err(error), state));
                }
                None => state.done = true,
            }
        }
    })
}

fn frame_error(provider: &str, error: FrameError) -> LlmError {
    match error {
        FrameError::Remote { code, message } => {
            log::warn!("Provider '{provider}' sent stream error {code}: {message}");
            LlmError::new(ErrorKind::ServiceUnavailable, message)
        }
        error => {
            log::error!("Malformed event stream from provider '{provider}': {error}");
            LlmError::new(ErrorKind::ServiceUnavailable, "Malformed response stream from upstream provider")
        }
    }
}

fn interrupted(provider: &str) -> LlmError {
    LlmError::new(
        ErrorKind::ServiceUnavailable,
        format!("Response stream from provider '{provider}' was interrupted"),
    )
}

fn transport_error(provider: &str, error: reqwest::Error) -> LlmError {
    if error.is_timeout() {
        log::warn!("Request to provider '{provider}' timed out: {error}");
        return LlmError::new(ErrorKind::Timeout, format!("Request to provider '{provider}' timed out"));
    }

    log::error!("Failed to reach provider '{provider}': {error}");

    LlmError::new(
        ErrorKind::ServiceUnavailable,
        format!("Provider '{provider}' is temporarily unavailable"),
    )
}
