//! OpenAI-compatible wire types.
//!
//! Unknown top-level keys of a request are kept in `extra` and written back when the
//! request is serialized for an upstream.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// OpenAI-compatible chat completion request.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Gateway cache directives. Never forwarded.
    #[serde(default, skip_serializing)]
    pub cache: Option<Map<String, Value>>,
    /// Prompt template to render into the conversation. Never forwarded.
    #[serde(default, skip_serializing)]
    pub prompt_id: Option<String>,
    /// Variables for the prompt template. Never forwarded.
    #[serde(default, skip_serializing)]
    pub prompt_variables: Option<Map<String, Value>>,
    /// Parameters this gateway does not model, forwarded as they came.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// The string content of the last message. Multimodal content yields an empty string.
    pub fn last_message_text(&self) -> &str {
        self.messages.last().and_then(ChatMessage::text).unwrap_or_default()
    }

    /// Names of the tools offered to the model.
    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().flatten().map(|tool| tool.function.name.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StopSequences::One(stop) => vec![stop.clone()],
            StopSequences::Many(stops) => stops.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StreamOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_usage: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Chat message in OpenAI format.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(MessageContent::Text(content.into())),
            ..Default::default()
        }
    }

    /// String content, `None` for multimodal or missing content.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            Some(MessageContent::Text(text)) => Some(text),
            _ => None,
        }
    }

    /// Mutable string content, `None` for multimodal or missing content.
    pub fn text_mut(&mut self) -> Option<&mut String> {
        match &mut self.content {
            Some(MessageContent::Text(text)) => Some(text),
            _ => None,
        }
    }
}

/// Message content: a plain string or a list of multimodal parts.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tool {
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// OpenAI-compatible chat completion response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    #[serde(default = "completion_object")]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn completion_object() -> String {
    "chat.completion".to_string()
}

impl ChatCompletionResponse {
    /// The string content of the first choice.
    pub fn first_choice_text(&self) -> &str {
        self.choices
            .first()
            .and_then(|choice| choice.message.text())
            .unwrap_or_default()
    }
}

/// Chat completion choice.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<Value>,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
    /// Prompt tokens written to the upstream prompt cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            prompt_tokens_details: None,
            cache_creation_input_tokens: None,
        }
    }

    /// Prompt tokens read from the upstream prompt cache.
    pub fn cached_tokens(&self) -> u32 {
        self.prompt_tokens_details
            .map(|details| details.cached_tokens)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: u32,
}

/// One event of a streamed chat completion.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    #[serde(default = "chunk_object")]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

fn chunk_object() -> String {
    "chat.completion.chunk".to_string()
}

impl ChatCompletionChunk {
    /// A chunk with a single choice carrying `delta`.
    pub fn with_delta(id: &str, model: &str, delta: ChatDelta) -> Self {
        Self {
            id: id.to_string(),
            object: chunk_object(),
            created: now(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: None,
                logprobs: None,
            }],
            usage: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChatDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChatDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FunctionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Rebuilds a complete response from streamed chunks, so post-call checks can run
/// once the stream has ended.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    id: String,
    model: String,
    created: u64,
    role: Option<String>,
    content: String,
    tool_calls: Vec<ToolCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl StreamAssembler {
    pub fn push(&mut self, chunk: &ChatCompletionChunk) {
        if self.id.is_empty() {
            self.id = chunk.id.clone();
            self.model = chunk.model.clone();
            self.created = chunk.created;
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        for choice in chunk.choices.iter().filter(|choice| choice.index == 0) {
            if let Some(ref role) = choice.delta.role {
                self.role = Some(role.clone());
            }

            if let Some(ref content) = choice.delta.content {
                self.content.push_str(content);
            }

            for delta in choice.delta.tool_calls.iter().flatten() {
                let index = delta.index as usize;

                while self.tool_calls.len() <= index {
                    self.tool_calls.push(ToolCall {
                        id: String::new(),
                        kind: function_type(),
                        function: FunctionCall {
                            name: String::new(),
                            arguments: String::new(),
                        },
                    });
                }

                let call = &mut self.tool_calls[index];

                if let Some(ref id) = delta.id {
                    call.id = id.clone();
                }

                if let Some(ref function) = delta.function {
                    if let Some(ref name) = function.name {
                        call.function.name.push_str(name);
                    }

                    if let Some(ref arguments) = function.arguments {
                        call.function.arguments.push_str(arguments);
                    }
                }
            }

            if let Some(ref reason) = choice.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
        }
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    pub fn finish(&self) -> ChatCompletionResponse {
        // text blocks of Bedrock streams occupy tool call indexes without filling them
        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .iter()
            .filter(|call| !call.id.is_empty() || !call.function.name.is_empty())
            .cloned()
            .collect();

        let tool_calls = (!tool_calls.is_empty()).then_some(tool_calls);

        ChatCompletionResponse {
            id: self.id.clone(),
            object: completion_object(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage {
                    role: self.role.clone().unwrap_or_else(|| "assistant".to_string()),
                    content: Some(MessageContent::Text(self.content.clone())),
                    tool_calls,
                    ..Default::default()
                },
                finish_reason: self.finish_reason.clone(),
                logprobs: None,
            }],
            usage: self.usage,
            extra: Map::new(),
        }
    }
}

/// Model information.
#[derive(Debug, Clone, Serialize)]
pub struct Model {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: String,
}

/// Models list response.
#[derive(Debug, Clone, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<Model>,
}

/// Seconds since the epoch.
pub(crate) fn now() -> u64 {
    jiff::Timestamp::now().as_second().max(0) as u64
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn unknown_parameters_are_forwarded() {
        let request = indoc! {r#"
            {
              "model": "gpt-4o",
              "messages": [{"role": "user", "content": "hi"}],
              "seed": 42,
              "response_format": {"type": "json_object"},
              "prompt_id": "support",
              "cache": {"no-cache": true}
            }
        "#};

        let request: ChatCompletionRequest = serde_json::from_str(request).unwrap();

        assert_eq!(request.prompt_id.as_deref(), Some("support"));
        assert!(request.cache.is_some());

        insta::assert_json_snapshot!(request, @r#"
        {
          "model": "gpt-4o",
          "messages": [
            {
              "role": "user",
              "content": "hi"
            }
          ],
          "seed": 42,
          "response_format": {
            "type": "json_object"
          }
        }
        "#);
    }

    #[test]
    fn multimodal_content_has_no_text() {
        let message: ChatMessage = serde_json::from_str(indoc! {r#"
            {"role": "user", "content": [{"type": "text", "text": "what is this"}, {"type": "image_url", "image_url": {"url": "data:"}}]}
        "#})
        .unwrap();

        assert_eq!(message.text(), None);
        assert!(matches!(message.content, Some(MessageContent::Parts(ref parts)) if parts.len() == 2));
    }

    #[test]
    fn assembled_stream() {
        let chunks = [
            r#"{"id":"c1","model":"gpt-4o","created":1,"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#,
            r#"{"id":"c1","model":"gpt-4o","created":1,"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#,
            r#"{"id":"c1","model":"gpt-4o","created":1,"choices":[{"index":0,"delta":{"content":"lo"}}]}"#,
            r#"{"id":"c1","model":"gpt-4o","created":1,"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"lookup","arguments":"{\"q\":"}}]}}]}"#,
            r#"{"id":"c1","model":"gpt-4o","created":1,"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"1}"}}]},"finish_reason":"tool_calls"}]}"#,
            r#"{"id":"c1","model":"gpt-4o","created":1,"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":3,"total_tokens":8}}"#,
        ];

        let mut assembler = StreamAssembler::default();

        for chunk in chunks {
            assembler.push(&serde_json::from_str(chunk).unwrap());
        }

        insta::assert_json_snapshot!(assembler.finish(), @r#"
        {
          "id": "c1",
          "object": "chat.completion",
          "created": 1,
          "model": "gpt-4o",
          "choices": [
            {
              "index": 0,
              "message": {
                "role": "assistant",
                "content": "Hello",
                "tool_calls": [
                  {
                    "id": "call_1",
                    "type": "function",
                    "function": {
                      "name": "lookup",
                      "arguments": "{\"q\":1}"
                    }
                  }
                ]
              },
              "finish_reason": "tool_calls"
            }
          ],
          "usage": {
            "prompt_tokens": 5,
            "completion_tokens": 3,
            "total_tokens": 8
          }
        }
        "#);
    }
}
