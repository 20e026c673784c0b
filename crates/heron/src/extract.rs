//! Text-based tool call recovery.
//!
//! Providers with no native function-calling field still emit tool calls as
//! patterns in free text. Each recognized pattern is an independent pure
//! function returning `Option<Vec<ToolCall>>`; they compose first-match-wins
//! in decreasing order of format confidence. The extractor never fails:
//! unparseable candidates are skipped, and an empty result means "no tool
//! call present".

mod heuristics;
mod json_forms;
mod xml;

use std::collections::HashSet;

use crate::models::tool::ToolCall;

pub use json_forms::ERROR_RESPONSE_TOOL;

/// Tag names that look like tool calls but never are. Ignored even when a
/// registered tool happens to share the name.
const IGNORED_TAGS: &[&str] = &[
    "thinking",
    "think",
    "reasoning",
    "reflection",
    "output",
    "response",
    "answer",
];

/// Extraction configuration. The two fallbacks are speculative by nature
/// and carry a higher false-positive risk, so they are opt-in.
#[derive(Debug, Clone, Default)]
pub struct ExtractorConfig {
    /// Scan for `tool_name({...})` call syntax
    pub call_syntax_fallback: bool,
    /// Scan for a JSON object near a mention of a known tool name
    pub json_scan_fallback: bool,
}

/// Recover tool calls from free-form model output.
///
/// Strategies run in priority order and the first one that yields any match
/// wins. Identical `(name, arguments)` pairs collapse to one call.
pub fn extract_tool_calls(
    text: &str,
    available: &[String],
    config: &ExtractorConfig,
) -> Vec<ToolCall> {
    let names: HashSet<&str> = available
        .iter()
        .map(|s| s.as_str())
        .filter(|name| !IGNORED_TAGS.contains(name))
        .collect();

    let found = xml::extract(text, &names)
        .or_else(|| json_forms::extract_nested_function(text))
        .or_else(|| json_forms::extract_to_tool(text, &names))
        .or_else(|| json_forms::extract_fenced(text))
        .or_else(|| {
            if config.call_syntax_fallback {
                heuristics::extract_call_syntax(text, &names)
            } else {
                None
            }
        })
        .or_else(|| {
            if config.json_scan_fallback {
                heuristics::extract_json_near_mention(text, &names)
            } else {
                None
            }
        })
        .unwrap_or_default();

    dedup(found)
}

fn dedup(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut seen = HashSet::new();
    calls
        .into_iter()
        .filter(|call| seen.insert(call.dedup_key()))
        .collect()
}

/// Scan a balanced JSON object starting at the first byte of `text`, which
/// must be `{`. Returns the object's source text.
pub(crate) fn balanced_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.first() != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
