//! Bedrock Converse responses and stream events translated to the OpenAI format.

use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
    error::{ErrorKind, LlmError},
    messages::{
        ChatChoice, ChatCompletionChunk, ChatCompletionResponse, ChatDelta, ChatMessage, FunctionCall,
        FunctionDelta, MessageContent, PromptTokensDetails, ToolCall, ToolCallDelta, Usage, now,
    },
    provider::StreamEvent,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ConverseResponse {
    #[serde(default)]
    output: Option<ConverseOutput>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<BedrockUsage>,
}

#[derive(Debug, Deserialize)]
struct ConverseOutput {
    #[serde(default)]
    message: Option<OutputMessage>,
}

#[derive(Debug, Deserialize)]
struct OutputMessage {
    #[serde(default)]
    content: Vec<OutputBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutputBlock {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    tool_use: Option<ToolUse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolUse {
    tool_use_id: String,
    name: String,
    #[serde(default)]
    input: Value,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BedrockUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    cache_read_input_tokens: Option<u32>,
    #[serde(default)]
    cache_write_input_tokens: Option<u32>,
}

impl From<BedrockUsage> for Usage {
    fn from(usage: BedrockUsage) -> Self {
        let mut converted = Usage::new(usage.input_tokens, usage.output_tokens);

        converted.prompt_tokens_details = usage
            .cache_read_input_tokens
            .map(|cached_tokens| PromptTokensDetails { cached_tokens });
        converted.cache_creation_input_tokens = usage.cache_write_input_tokens;

        converted
    }
}

impl From<ConverseResponse> for ChatCompletionResponse {
    fn from(response: ConverseResponse) -> Self {
        let blocks = response
            .output
            .and_then(|output| output.message)
            .map(|message| message.content)
            .unwrap_or_default();

        if blocks.is_empty() {
            log::debug!("Bedrock Converse API returned empty content");
        }

        let mut content = String::new();
        let mut tool_calls = Vec::new();

        for block in blocks {
            if let Some(text) = block.text {
                content.push_str(&text);
            }

            if let Some(tool_use) = block.tool_use {
                tool_calls.push(ToolCall {
                    id: tool_use.tool_use_id,
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: tool_use.name,
                        arguments: tool_use.input.to_string(),
                    },
                });
            }
        }

        ChatCompletionResponse {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            object: "chat.completion".to_string(),
            created: now(),
            model: String::new(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content: Some(MessageContent::Text(content)),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    ..Default::default()
                },
                finish_reason: response.stop_reason.as_deref().map(finish_reason),
                logprobs: None,
            }],
            usage: response.usage.map(Usage::from),
            extra: Map::new(),
        }
    }
}

pub(super) fn finish_reason(stop_reason: &str) -> String {
    match stop_reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "guardrail_intervened" | "content_filtered" => "content_filter",
        other => other,
    }
    .to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum ConverseStreamEvent {
    MessageStart(MessageStart),
    ContentBlockStart(ContentBlockStart),
    ContentBlockDelta(ContentBlockDelta),
    ContentBlockStop(Value),
    MessageStop(MessageStop),
    Metadata(Metadata),
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    role: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentBlockStart {
    #[serde(default)]
    content_block_index: u32,
    #[serde(default)]
    start: Option<BlockStart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockStart {
    #[serde(default)]
    tool_use: Option<ToolUseStart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolUseStart {
    tool_use_id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentBlockDelta {
    #[serde(default)]
    content_block_index: u32,
    delta: BlockDelta,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    tool_use: Option<ToolUseDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolUseDelta {
    #[serde(default)]
    input: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageStop {
    stop_reason: String,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(default)]
    usage: Option<BedrockUsage>,
}

/// Translate one `{"<event-type>": payload}` frame of a Converse stream.
pub(super) fn stream_event(frame: &[u8]) -> crate::Result<StreamEvent> {
    let value: Value = serde_json::from_slice(frame).map_err(|e| {
        log::error!("Failed to parse Bedrock stream frame: {e}");
        LlmError::internal()
    })?;

    if let Some((name, payload)) = value.as_object().and_then(|object| object.iter().next())
        && name.ends_with("Exception")
    {
        return Err(stream_exception(name, payload));
    }

    let event = match serde_json::from_value::<ConverseStreamEvent>(value) {
        Ok(event) => event,
        Err(e) => {
            log::debug!("Skipping unknown Bedrock stream event: {e}");
            return Ok(StreamEvent::default());
        }
    };

    let (delta, finish) = match event {
        ConverseStreamEvent::MessageStart(start) => (
            ChatDelta {
                role: Some(start.role),
                ..Default::default()
            },
            None,
        ),
        ConverseStreamEvent::ContentBlockStart(ContentBlockStart {
            content_block_index,
            start: Some(BlockStart {
                tool_use: Some(tool_use),
            }),
        }) => (
            ChatDelta {
                tool_calls: Some(vec![ToolCallDelta {
                    index: content_block_index,
                    id: Some(tool_use.tool_use_id),
                    kind: Some("function".to_string()),
                    function: Some(FunctionDelta {
                        name: Some(tool_use.name),
                        arguments: None,
                    }),
                }]),
                ..Default::default()
            },
            None,
        ),
        ConverseStreamEvent::ContentBlockDelta(block) => match block.delta {
            BlockDelta { text: Some(text), .. } => (
                ChatDelta {
                    content: Some(text),
                    ..Default::default()
                },
                None,
            ),
            BlockDelta {
                tool_use: Some(tool_use),
                ..
            } => (
                ChatDelta {
                    tool_calls: Some(vec![ToolCallDelta {
                        index: block.content_block_index,
                        function: Some(FunctionDelta {
                            name: None,
                            arguments: Some(tool_use.input),
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
                None,
            ),
            _ => return Ok(StreamEvent::default()),
        },
        ConverseStreamEvent::MessageStop(stop) => (ChatDelta::default(), Some(finish_reason(&stop.stop_reason))),
        ConverseStreamEvent::Metadata(Metadata { usage: Some(usage) }) => {
            let mut chunk = ChatCompletionChunk::with_delta("", "", ChatDelta::default());
            chunk.choices.clear();
            chunk.usage = Some(usage.into());

            return Ok(StreamEvent {
                chunk: Some(chunk),
                is_final: false,
            });
        }
        ConverseStreamEvent::ContentBlockStart(_)
        | ConverseStreamEvent::ContentBlockStop(_)
        | ConverseStreamEvent::Metadata(_) => return Ok(StreamEvent::default()),
    };

    let is_final = finish.is_some();
    let mut chunk = ChatCompletionChunk::with_delta("", "", delta);

    if let Some(choice) = chunk.choices.first_mut() {
        choice.finish_reason = finish;
    }

    Ok(StreamEvent {
        chunk: Some(chunk),
        is_final,
    })
}

fn stream_exception(name: &str, payload: &Value) -> LlmError {
    let kind = match name {
        "throttlingException" => ErrorKind::RateLimit,
        "validationException" => ErrorKind::InvalidRequest,
        _ => ErrorKind::ServiceUnavailable,
    };

    let message = payload
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("Bedrock stream failed");

    log::warn!("Bedrock stream returned {name}: {message}");

    LlmError::new(kind, message)
}
