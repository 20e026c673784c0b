//! JSON-marker tool call forms: `to=functions json{...}`, `to=<tool>
//! json{...}`, and fenced ```json blocks carrying a `tool_call` object.

use std::collections::HashSet;

use regex::Regex;
use serde_json::{json, Value};

use super::balanced_json_object;
use crate::models::tool::ToolCall;

/// Name of the synthetic call produced when the model asks for a tool that
/// does not exist. Surfaced back to the model as a corrective signal.
pub const ERROR_RESPONSE_TOOL: &str = "error_response";

/// `to=functions json{"name": ..., "arguments": {...}}`
pub fn extract_nested_function(text: &str) -> Option<Vec<ToolCall>> {
    let marker = Regex::new(r"to=functions\s+json\s*").unwrap();

    let mut calls = Vec::new();
    for found in marker.find_iter(text) {
        let Some(object) = balanced_json_object(&text[found.end()..]) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(object) else {
            continue;
        };
        let Some(name) = value["name"].as_str().filter(|n| !n.is_empty()) else {
            continue;
        };
        let arguments = match value.get("arguments") {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            _ => json!({}),
        };
        calls.push(ToolCall::new(name, arguments));
    }

    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

/// `to=<tool> json{...}` with the tool name asserted against the available
/// set. An unrecognized name short-circuits into a single `error_response`
/// call naming the invalid tool and listing the valid alternatives.
pub fn extract_to_tool(text: &str, names: &HashSet<&str>) -> Option<Vec<ToolCall>> {
    let marker = Regex::new(r"to=([a-zA-Z0-9_-]+)\s+json\s*").unwrap();

    let mut calls = Vec::new();
    for captures in marker.captures_iter(text) {
        let name = &captures[1];
        if name == "functions" {
            continue;
        }

        if !names.contains(name) {
            let mut valid: Vec<&str> = names.iter().copied().collect();
            valid.sort_unstable();
            return Some(vec![ToolCall::new(
                ERROR_RESPONSE_TOOL,
                json!({
                    "error": format!(
                        "Unknown tool '{}'. Valid tools: {}",
                        name,
                        valid.join(", ")
                    ),
                    "invalid_tool": name,
                    "valid_tools": valid,
                }),
            )]);
        }

        let after = captures.get(0).unwrap().end();
        let Some(object) = balanced_json_object(&text[after..]) else {
            continue;
        };
        let Ok(arguments) = serde_json::from_str::<Value>(object) else {
            continue;
        };
        if arguments.is_object() {
            calls.push(ToolCall::new(name, arguments));
        }
    }

    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

/// Fenced ```json block containing `{"tool_call": {"name", "arguments"}}`
pub fn extract_fenced(text: &str) -> Option<Vec<ToolCall>> {
    let fence = Regex::new(r"(?s)```json\s*(.*?)```").unwrap();

    let mut calls = Vec::new();
    for captures in fence.captures_iter(text) {
        let Ok(value) = serde_json::from_str::<Value>(captures[1].trim()) else {
            continue;
        };
        let tool_call = &value["tool_call"];
        let Some(name) = tool_call["name"].as_str().filter(|n| !n.is_empty()) else {
            continue;
        };
        let arguments = match tool_call.get("arguments") {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            _ => json!({}),
        };
        calls.push(ToolCall::new(name, arguments));
    }

    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}
