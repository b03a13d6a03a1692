//! OpenAI chat requests translated to the Bedrock Converse request body.

use serde::Serialize;
use serde_json::{Value, json};

use crate::messages::{ChatCompletionRequest, ChatMessage, MessageContent, Tool};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ConverseRequest {
    messages: Vec<BedrockMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    system: Vec<SystemBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inference_config: Option<InferenceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<ToolConfig>,
}

#[derive(Debug, Serialize)]
struct BedrockMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
struct SystemBlock {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum ContentBlock {
    Text(String),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolUseBlock {
    tool_use_id: String,
    name: String,
    input: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResultBlock {
    tool_use_id: String,
    content: Vec<ToolResultContent>,
}

#[derive(Debug, Serialize)]
struct ToolResultContent {
    text: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct InferenceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolConfig {
    tools: Vec<BedrockTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BedrockTool {
    tool_spec: ToolSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolSpec {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: InputSchema,
}

#[derive(Debug, Serialize)]
struct InputSchema {
    json: Value,
}

impl From<&ChatCompletionRequest> for ConverseRequest {
    fn from(request: &ChatCompletionRequest) -> Self {
        let mut system = Vec::new();
        let mut messages: Vec<BedrockMessage> = Vec::new();

        for message in &request.messages {
            if message.role == "system" {
                if let Some(text) = plain_text(message) {
                    system.push(SystemBlock { text });
                }

                continue;
            }

            let role = match message.role.as_str() {
                "assistant" => "assistant",
                _ => "user",
            };

            let content = content_blocks(message);

            if content.is_empty() {
                continue;
            }

            // Converse requires alternating turns
            match messages.last_mut() {
                Some(last) if last.role == role => last.content.extend(content),
                _ => messages.push(BedrockMessage { role, content }),
            }
        }

        let inference_config = InferenceConfig {
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop.as_ref().map(|stop| stop.to_vec()),
        };

        let inference_config = (inference_config.max_tokens.is_some()
            || inference_config.temperature.is_some()
            || inference_config.top_p.is_some()
            || inference_config.stop_sequences.is_some())
        .then_some(inference_config);

        Self {
            messages,
            system,
            inference_config,
            tool_config: tool_config(request),
        }
    }
}

fn content_blocks(message: &ChatMessage) -> Vec<ContentBlock> {
    if let Some(ref tool_use_id) = message.tool_call_id {
        return vec![ContentBlock::ToolResult(ToolResultBlock {
            tool_use_id: tool_use_id.clone(),
            content: vec![ToolResultContent {
                text: plain_text(message).unwrap_or_default(),
            }],
        })];
    }

    let mut blocks = Vec::new();

    if let Some(text) = plain_text(message).filter(|text| !text.is_empty()) {
        blocks.push(ContentBlock::Text(text));
    }

    for call in message.tool_calls.iter().flatten() {
        let input = match serde_json::from_str(&call.function.arguments) {
            Ok(input) => input,
            Err(_) if call.function.arguments.trim().is_empty() => json!({}),
            Err(e) => {
                log::warn!("Tool call {} has arguments that are not JSON, sending them as a string: {e}", call.id);
                Value::String(call.function.arguments.clone())
            }
        };

        blocks.push(ContentBlock::ToolUse(ToolUseBlock {
            tool_use_id: call.id.clone(),
            name: call.function.name.clone(),
            input,
        }));
    }

    blocks
}

/// String content, with the text parts of multimodal content joined.
fn plain_text(message: &ChatMessage) -> Option<String> {
    match message.content.as_ref()? {
        MessageContent::Text(text) => Some(text.clone()),
        MessageContent::Parts(parts) => {
            let texts: Vec<_> = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();

            if texts.len() < parts.len() {
                log::debug!("Dropping non-text content parts not supported by Bedrock Converse");
            }

            Some(texts.join("\n"))
        }
    }
}

fn tool_config(request: &ChatCompletionRequest) -> Option<ToolConfig> {
    let tools = request.tools.as_ref().filter(|tools| !tools.is_empty())?;

    let tool_choice = match request.tool_choice.as_ref() {
        None => None,
        Some(Value::String(choice)) => match choice.as_str() {
            "none" => return None,
            "required" => Some(json!({ "any": {} })),
            _ => Some(json!({ "auto": {} })),
        },
        Some(choice) => choice
            .pointer("/function/name")
            .and_then(Value::as_str)
            .map(|name| json!({ "tool": { "name": name } })),
    };

    Some(ToolConfig {
        tools: tools.iter().map(bedrock_tool).collect(),
        tool_choice,
    })
}

fn bedrock_tool(tool: &Tool) -> BedrockTool {
    BedrockTool {
        tool_spec: ToolSpec {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            input_schema: InputSchema {
                json: tool
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn conversation_with_tools() {
        let request: ChatCompletionRequest = serde_json::from_str(indoc! {r#"
            {
              "model": "claude",
              "max_tokens": 256,
              "top_p": 0.9,
              "stop": "END",
              "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "Weather in Oslo?"},
                {"role": "assistant", "content": null, "tool_calls": [
                  {"id": "call_1", "type": "function", "function": {"name": "weather", "arguments": "{\"city\":\"Oslo\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "-3C"},
                {"role": "user", "content": "Thanks"}
              ],
              "tools": [
                {"type": "function", "function": {"name": "weather", "description": "Current weather", "parameters": {"type": "object"}}}
              ],
              "tool_choice": "required"
            }
        "#})
        .unwrap();

        insta::assert_json_snapshot!(ConverseRequest::from(&request), @r#"
        {
          "messages": [
            {
              "role": "user",
              "content": [
                {
                  "text": "Weather in Oslo?"
                }
              ]
            },
            {
              "role": "assistant",
              "content": [
                {
                  "toolUse": {
                    "toolUseId": "call_1",
                    "name": "weather",
                    "input": {
                      "city": "Oslo"
                    }
                  }
                }
              ]
            },
            {
              "role": "user",
              "content": [
                {
                  "toolResult": {
                    "toolUseId": "call_1",
                    "content": [
                      {
                        "text": "-3C"
                      }
                    ]
                  }
                },
                {
                  "text": "Thanks"
                }
              ]
            }
          ],
          "system": [
            {
              "text": "Be brief."
            }
          ],
          "inferenceConfig": {
            "maxTokens": 256,
            "topP": 0.9,
            "stopSequences": [
              "END"
            ]
          },
          "toolConfig": {
            "tools": [
              {
                "toolSpec": {
                  "name": "weather",
                  "description": "Current weather",
                  "inputSchema": {
                    "json": {
                      "type": "object"
                    }
                  }
                }
              }
            ],
            "toolChoice": {
              "any": {}
            }
          }
        }
        "#);
    }

    #[test]
    fn no_inference_config_without_parameters() {
        let request: ChatCompletionRequest = serde_json::from_str(indoc! {r#"
            {"model": "claude", "messages": [{"role": "user", "content": "hi"}]}
        "#})
        .unwrap();

        let body = serde_json::to_value(ConverseRequest::from(&request)).unwrap();

        assert!(body.get("inferenceConfig").is_none());
        assert!(body.get("toolConfig").is_none());
        assert!(body.get("system").is_none());
    }
}
