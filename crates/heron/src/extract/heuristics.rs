//! Best-effort fallback patterns. Both are speculative and opt-in: they
//! trade recall for a real false-positive risk, so the cascade only reaches
//! them when explicitly enabled.

use std::collections::HashSet;

use regex::Regex;
use serde_json::Value;

use super::balanced_json_object;
use crate::models::tool::ToolCall;

/// `tool_name({"arg": "value"})` call syntax for a known tool name.
pub fn extract_call_syntax(text: &str, names: &HashSet<&str>) -> Option<Vec<ToolCall>> {
    let call = Regex::new(r"\b([a-zA-Z_][a-zA-Z0-9_-]*)\s*\(").unwrap();

    let mut calls = Vec::new();
    for captures in call.captures_iter(text) {
        let name = &captures[1];
        if !names.contains(name) {
            continue;
        }
        let after = captures.get(0).unwrap().end();
        let rest = text[after..].trim_start();
        let Some(object) = balanced_json_object(rest) else {
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

/// A JSON object located shortly after a mention of a known tool name. The
/// loosest pattern of the cascade.
pub fn extract_json_near_mention(text: &str, names: &HashSet<&str>) -> Option<Vec<ToolCall>> {
    const WINDOW: usize = 200;

    let mut calls = Vec::new();
    for name in names {
        let Ok(mention) = Regex::new(&format!(r"\b{}\b", regex::escape(name))) else {
            continue;
        };
        for found in mention.find_iter(text) {
            let window_end = (found.end() + WINDOW).min(text.len());
            // Clamp to a char boundary so the slice is valid
            let window_end = (window_end..text.len())
                .find(|&i| text.is_char_boundary(i))
                .unwrap_or(text.len());
            let window = &text[found.end()..window_end];

            let Some(brace) = window.find('{') else {
                continue;
            };
            let Some(object) = balanced_json_object(&window[brace..]) else {
                continue;
            };
            let Ok(arguments) = serde_json::from_str::<Value>(object) else {
                continue;
            };
            // Only key:value maps are credible as arguments
            if arguments.as_object().map_or(false, |map| !map.is_empty()) {
                calls.push(ToolCall::new(*name, arguments));
                break;
            }
        }
    }

    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names<'a>(list: &'a [&'a str]) -> HashSet<&'a str> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_call_syntax() {
        let calls = extract_call_syntax(
            r#"Let me run web_search({"query": "cats"}) for you."#,
            &names(&["web_search"]),
        )
        .unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, json!({"query": "cats"}));
    }

    #[test]
    fn test_call_syntax_unknown_name_ignored() {
        assert!(extract_call_syntax(
            r#"print({"query": "cats"})"#,
            &names(&["web_search"])
        )
        .is_none());
    }

    #[test]
    fn test_call_syntax_non_json_parens_ignored() {
        assert!(
            extract_call_syntax("web_search(the internet)", &names(&["web_search"])).is_none()
        );
    }

    #[test]
    fn test_json_near_mention() {
        let calls = extract_json_near_mention(
            r#"Use web_search with these parameters: {"query": "cats", "limit": 3}"#,
            &names(&["web_search"]),
        )
        .unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, json!({"query": "cats", "limit": 3}));
    }

    #[test]
    fn test_json_near_mention_outside_window() {
        let padding = "x".repeat(300);
        let text = format!(r#"web_search {} {{"query": "cats"}}"#, padding);
        assert!(extract_json_near_mention(&text, &names(&["web_search"])).is_none());
    }

    #[test]
    fn test_json_near_mention_empty_object_ignored() {
        assert!(
            extract_json_near_mention("web_search {}", &names(&["web_search"])).is_none()
        );
    }
}
