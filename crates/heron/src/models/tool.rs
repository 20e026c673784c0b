use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool that can be used by a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    /// The name of the tool
    pub name: String,
    /// A description of what the tool does
    pub description: String,
    /// JSON schema for the parameters the tool accepts
    pub parameters: Value,
}

impl Tool {
    pub fn new<N, D>(name: N, description: D, parameters: Value) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        Tool {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// The two tool shapes that arrive from the outside world: MCP servers
/// describe tools as `{name, description, inputSchema}`, OpenAI-style
/// callers as `{type: "function", function: {...}}`. Both normalize into
/// [`Tool`] before any provider sees them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawToolSpec {
    Function {
        #[serde(rename = "type")]
        kind: String,
        function: FunctionSpec,
    },
    Mcp {
        name: String,
        #[serde(default)]
        description: String,
        #[serde(rename = "inputSchema", default)]
        input_schema: Value,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

impl RawToolSpec {
    pub fn normalize(self) -> Tool {
        match self {
            RawToolSpec::Function { function, .. } => Tool {
                name: function.name,
                description: function.description,
                parameters: function.parameters,
            },
            RawToolSpec::Mcp {
                name,
                description,
                input_schema,
            } => Tool {
                name,
                description,
                parameters: input_schema,
            },
        }
    }
}

/// A tool call request emitted by a model.
///
/// `id` is present when the provider correlates results to calls by
/// identifier and must round-trip untouched; providers without native tool
/// calling get a locally synthesized id before execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new<S: Into<String>>(name: S, arguments: Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            arguments,
        }
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Deduplication key: tool name plus canonicalized arguments. Two calls
    /// with the same key execute once and share one result.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.name, canonical_json(&self.arguments))
    }
}

/// One executed tool call. Immutable after creation; owned by the batch
/// that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub id: Option<String>,
    pub name: String,
    pub result: String,
    pub success: bool,
    pub duration: Duration,
}

/// Serialize a value with object keys sorted recursively, so argument maps
/// compare equal regardless of insertion order.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let entries: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", entries.join(","))
        }
        Value::Array(items) => {
            let entries: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", entries.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_function_shape() {
        let raw: RawToolSpec = serde_json::from_value(json!({
            "type": "function",
            "function": {
                "name": "web_search",
                "description": "Search the web",
                "parameters": {"type": "object", "properties": {"query": {"type": "string"}}}
            }
        }))
        .unwrap();

        let tool = raw.normalize();
        assert_eq!(tool.name, "web_search");
        assert_eq!(tool.description, "Search the web");
        assert_eq!(tool.parameters["type"], "object");
    }

    #[test]
    fn test_normalize_mcp_shape() {
        let raw: RawToolSpec = serde_json::from_value(json!({
            "name": "list_directory",
            "description": "List a directory",
            "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}}
        }))
        .unwrap();

        let tool = raw.normalize();
        assert_eq!(tool.name, "list_directory");
        assert_eq!(tool.parameters["properties"]["path"]["type"], "string");
    }

    #[test]
    fn test_dedup_key_ignores_argument_order() {
        let a = ToolCall::new("search", json!({"query": "cats", "limit": 5}));
        let b = ToolCall::new("search", json!({"limit": 5, "query": "cats"}));
        assert_eq!(a.dedup_key(), b.dedup_key());

        let c = ToolCall::new("search", json!({"query": "dogs", "limit": 5}));
        assert_ne!(a.dedup_key(), c.dedup_key());
    }

    #[test]
    fn test_dedup_key_includes_name() {
        let a = ToolCall::new("read_file", json!({"path": "/tmp"}));
        let b = ToolCall::new("list_directory", json!({"path": "/tmp"}));
        assert_ne!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_canonical_json_nested() {
        let v = json!({"b": {"d": 1, "c": [2, 3]}, "a": true});
        assert_eq!(canonical_json(&v), r#"{"a":true,"b":{"c":[2,3],"d":1}}"#);
    }
}
