use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use futures::Stream;
use telemetry::metrics::Recorder;

use crate::{
    error::LlmError,
    messages::{ChatCompletionChunk, ChatCompletionResponse, StreamAssembler, Usage},
    server::dispatch::ChatCompletionStream,
};

/// What an [`ObservedStream`] saw, read once the stream has ended.
#[derive(Default)]
pub(super) struct StreamRecord {
    assembler: StreamAssembler,
    error: Option<LlmError>,
    first_token: Option<Duration>,
}

impl StreamRecord {
    /// The response rebuilt from every forwarded chunk.
    pub fn response(&self) -> ChatCompletionResponse {
        self.assembler.finish()
    }

    pub fn usage(&self) -> Option<Usage> {
        self.assembler.usage()
    }

    /// The error that ended the stream early.
    pub fn take_error(&mut self) -> Option<LlmError> {
        self.error.take()
    }

    pub fn time_to_first_token(&self) -> Option<Duration> {
        self.first_token
    }
}

/// Forwards upstream chunks under the gateway's id and public model name while keeping
/// a copy for post-call checks.
///
/// The stream ends after the first error.
pub(super) struct ObservedStream {
    inner: ChatCompletionStream,
    record: Arc<Mutex<StreamRecord>>,
    ttft_recorder: Option<Recorder>,
    id: String,
    model: String,
    done: bool,
}

impl ObservedStream {
    pub fn new(inner: ChatCompletionStream, id: &str, model: &str, ttft_recorder: Recorder) -> Self {
        Self {
            inner,
            record: Arc::new(Mutex::new(StreamRecord::default())),
            ttft_recorder: Some(ttft_recorder),
            id: id.to_string(),
            model: model.to_string(),
            done: false,
        }
    }

    /// Shared view of what the stream forwarded.
    pub fn record(&self) -> Arc<Mutex<StreamRecord>> {
        self.record.clone()
    }

    fn observe(&mut self, chunk: &mut ChatCompletionChunk) {
        if chunk.id.is_empty() {
            chunk.id = self.id.clone();
        }

        chunk.model = self.model.clone();

        let mut first_token = None;

        // tool calls count as the first output as well
        if let Some(recorder) = self.ttft_recorder.take() {
            let has_output = chunk
                .choices
                .first()
                .is_some_and(|choice| choice.delta.content.is_some() || choice.delta.tool_calls.is_some());

            if has_output {
                first_token = Some(recorder.elapsed());
                recorder.record();
            } else {
                self.ttft_recorder = Some(recorder);
            }
        }

        match self.record.lock() {
            Ok(mut record) => {
                record.assembler.push(chunk);

                if first_token.is_some() {
                    record.first_token = first_token;
                }
            }
            Err(_) => log::warn!("Stream record of {} is poisoned, chunk not observed", self.id),
        }
    }

    fn fail(&mut self, error: &LlmError) {
        self.done = true;

        match self.record.lock() {
            Ok(mut record) => record.error = Some(error.clone()),
            Err(_) => log::warn!("Stream record of {} is poisoned, error not observed", self.id),
        }
    }
}

impl Stream for ObservedStream {
    type Item = crate::Result<ChatCompletionChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(mut chunk))) => {
                self.observe(&mut chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                self.fail(&error);
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
