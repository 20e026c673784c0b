use regex::Regex;
use serde_json::{json, Value};
use tracing::warn;

use super::base::Usage;
use crate::errors::ProviderError;
use crate::models::message::{Message, MessageContent};
use crate::models::tool::{Tool, ToolCall};

/// Convert internal messages to the OpenAI-style message specification.
///
/// When `exclusive_tool_turns` is set, an assistant turn carrying both text
/// and tool calls is rewritten to carry only the tool calls before
/// transmission. Stricter providers reject the combined shape; the
/// user-visible history is not touched.
pub fn messages_to_openai_spec(messages: &[Message], exclusive_tool_turns: bool) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        let mut converted = json!({
            "role": message.role
        });

        let mut output = Vec::new();

        for content in &message.content {
            match content {
                MessageContent::Text(text) => {
                    if !text.is_empty() {
                        converted["content"] = json!(text);
                    }
                }
                MessageContent::ToolRequest(request) => {
                    let sanitized_name = sanitize_function_name(&request.tool_call.name);
                    let tool_calls = converted
                        .as_object_mut()
                        .unwrap()
                        .entry("tool_calls")
                        .or_insert(json!([]));

                    tool_calls.as_array_mut().unwrap().push(json!({
                        "id": request.id,
                        "type": "function",
                        "function": {
                            "name": sanitized_name,
                            "arguments": request.tool_call.arguments.to_string(),
                        }
                    }));
                }
                MessageContent::ToolResponse(response) => match &response.tool_result {
                    Ok(result) => {
                        output.push(json!({
                            "role": "tool",
                            "content": result,
                            "tool_call_id": response.id
                        }));
                    }
                    Err(e) => {
                        // Failure text is sent as output so the model can
                        // interpret and react to it
                        output.push(json!({
                            "role": "tool",
                            "content": format!("The tool call returned the following error:\n{}", e),
                            "tool_call_id": response.id
                        }));
                    }
                },
            }
        }

        if exclusive_tool_turns
            && converted.get("tool_calls").is_some()
            && converted.get("content").is_some()
        {
            converted.as_object_mut().unwrap().remove("content");
        }

        if converted.get("content").is_some() || converted.get("tool_calls").is_some() {
            output.insert(0, converted);
        }
        messages_spec.extend(output);
    }

    messages_spec
}

/// Convert internal tools to the OpenAI function-call tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>, ProviderError> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(ProviderError::Internal(format!(
                "Duplicate tool name: {}",
                tool.name
            )));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            }
        }));
    }

    Ok(result)
}

/// Convert an OpenAI-style non-streaming response body to a message.
/// Malformed tool calls are logged and skipped; they never abort the turn.
pub fn openai_response_to_message(response: &Value) -> Message {
    let original = &response["choices"][0]["message"];
    let mut message = Message::assistant();

    if let Some(text) = original.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            message = message.with_text(text);
        }
    }

    if let Some(tool_calls) = original.get("tool_calls").and_then(|t| t.as_array()) {
        for tool_call in tool_calls {
            let id = tool_call["id"].as_str().unwrap_or_default().to_string();
            let function_name = tool_call["function"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let arguments = tool_call["function"]["arguments"]
                .as_str()
                .unwrap_or_default();

            if !is_valid_function_name(&function_name) {
                warn!(name = %function_name, "skipping tool call with invalid function name");
                continue;
            }
            let arguments: Value = if arguments.trim().is_empty() {
                json!({})
            } else {
                match serde_json::from_str(arguments) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(id = %id, error = %e, "skipping tool call with unparseable arguments");
                        continue;
                    }
                }
            };

            message = message.with_tool_request(
                id.clone(),
                ToolCall::new(&function_name, arguments).with_id(id),
            );
        }
    }

    message
}

/// Extract token counters from an OpenAI-style `usage` object
pub fn openai_usage(data: &Value) -> Usage {
    let usage = &data["usage"];

    let input_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);

    let output_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);

    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32)
        .or_else(|| match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(input + output),
            _ => None,
        });

    Usage::new(input_tokens, output_tokens, total_tokens)
}

pub fn sanitize_function_name(name: &str) -> String {
    let re = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    re.replace_all(name, "_").to_string()
}

pub fn is_valid_function_name(name: &str) -> bool {
    let re = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
    re.is_match(name)
}

/// Map a context-length API error into its dedicated variant so callers can
/// react (trim history, switch model) instead of treating it as generic
pub fn check_context_length_error(error: &Value) -> Option<ProviderError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        Some(ProviderError::ContextLengthExceeded(message))
    } else {
        None
    }
}
