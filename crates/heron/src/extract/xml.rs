//! XML-tag tool call form: `<tool_name><param>value</param></tool_name>`.

use std::collections::HashSet;

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::models::tool::ToolCall;

/// Find XML-form calls for the available tool names. Unknown tags never
/// match because only registered names are scanned for.
pub fn extract(text: &str, names: &HashSet<&str>) -> Option<Vec<ToolCall>> {
    let mut found: Vec<(usize, ToolCall)> = Vec::new();

    for name in names {
        let pattern = format!(r"(?s)<{0}>(.*?)</{0}>", regex::escape(name));
        let re = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(_) => continue,
        };
        for captures in re.captures_iter(text) {
            let whole = captures.get(0).unwrap();
            let inner = captures.get(1).map(|m| m.as_str()).unwrap_or("");
            found.push((
                whole.start(),
                ToolCall::new(*name, parse_arguments(inner)),
            ));
        }
    }

    if found.is_empty() {
        return None;
    }
    found.sort_by_key(|(start, _)| *start);
    Some(found.into_iter().map(|(_, call)| call).collect())
}

/// Child tags become named string arguments; repeated child tags of the
/// same name accumulate into an array. Without child tags the inner text is
/// parsed as JSON when it looks like an object or array, else passed
/// through as a single `input` argument.
fn parse_arguments(inner: &str) -> Value {
    let child_re = Regex::new(r"(?s)<([a-zA-Z0-9_]+)>(.*?)</([a-zA-Z0-9_]+)>").unwrap();

    let mut arguments = Map::new();
    for captures in child_re.captures_iter(inner) {
        let open = &captures[1];
        let close = &captures[3];
        if open != close {
            continue;
        }
        let value = captures[2].trim().to_string();
        match arguments.entry(open.to_string()) {
            serde_json::map::Entry::Vacant(slot) => {
                slot.insert(json!(value));
            }
            serde_json::map::Entry::Occupied(mut slot) => match slot.get_mut() {
                Value::Array(items) => items.push(json!(value)),
                existing => {
                    let first = existing.take();
                    *existing = json!([first, value]);
                }
            },
        }
    }

    if !arguments.is_empty() {
        return Value::Object(arguments);
    }

    let trimmed = inner.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return match value {
                Value::Object(map) => Value::Object(map),
                other => json!({ "input": other }),
            };
        }
    }
    json!({ "input": trimmed })
}
