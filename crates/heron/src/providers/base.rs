use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::models::tool::{Tool, ToolCall};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }

    /// Fold another round's usage into this one (multi-round replies)
    pub fn accumulate(&mut self, other: &Usage) {
        fn add(a: Option<i32>, b: Option<i32>) -> Option<i32> {
            match (a, b) {
                (Some(a), Some(b)) => Some(a + b),
                (a, None) => a,
                (None, b) => b,
            }
        }
        self.input_tokens = add(self.input_tokens, other.input_tokens);
        self.output_tokens = add(self.output_tokens, other.output_tokens);
        self.total_tokens = add(self.total_tokens, other.total_tokens);
    }
}

/// Cost of one reply, filled in by a caller-supplied pricing function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

/// The externally visible result of one reply, which may internally span
/// several network round trips.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LLMResponse {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<Cost>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tool_calls: Vec<ToolCall>,
}

/// One unit of incremental data decoded from a provider's response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental model-generated text
    Text(String),
    /// A fragment of a tool call. `id` and `name` arrive at most once per
    /// index; `arguments` arrives as successive substrings to concatenate.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    },
    /// Token counters, typically carried by the terminal frame
    Usage(Usage),
    /// End of stream
    Done,
}

pub type CompletionStream =
    tokio_stream::wrappers::ReceiverStream<Result<StreamEvent, ProviderError>>;

/// Base trait for AI providers (OpenAI-compatible, local native servers, etc)
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// Base URL this provider talks to, used as part of the capability
    /// cache key
    fn host(&self) -> &str;

    /// Whether the provider's API has a first-class field for tool calls.
    /// When false the orchestrator describes tools in the system prompt and
    /// recovers calls from the response text.
    fn supports_native_tools(&self) -> bool {
        true
    }

    /// Generate the next message in one request/response exchange
    async fn complete(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
    ) -> Result<(Message, Usage), ProviderError>;

    /// Stream the next message incrementally. The returned stream yields
    /// text and tool-call fragments in network order and ends with `Done`.
    /// Cancellation must surface as `ProviderError::Cancelled`.
    async fn stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        cancel: CancellationToken,
    ) -> Result<CompletionStream, ProviderError>;
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Folds stream events into a complete message.
///
/// Tool call fragments accumulate by index. Indices may be sparse and
/// non-sequential, so accumulation is map-based rather than positional.
#[derive(Debug, Default)]
pub struct StreamingAccumulator {
    text: String,
    tool_calls: HashMap<usize, PartialToolCall>,
    usage: Usage,
}

impl StreamingAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event. Returns true when the stream is complete.
    pub fn apply(&mut self, event: StreamEvent) -> bool {
        match event {
            StreamEvent::Text(text) => {
                self.text.push_str(&text);
                false
            }
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                let partial = self.tool_calls.entry(index).or_default();
                if let Some(id) = id {
                    partial.id = Some(id);
                }
                if let Some(name) = name {
                    partial.name = name;
                }
                if let Some(arguments) = arguments {
                    partial.arguments.push_str(&arguments);
                }
                false
            }
            StreamEvent::Usage(usage) => {
                self.usage.accumulate(&usage);
                false
            }
            StreamEvent::Done => true,
        }
    }

    /// Assemble the final assistant message and usage. Fragments with an
    /// empty name or unparseable arguments are logged and dropped; they
    /// never abort the stream.
    pub fn finish(self) -> (Message, Usage) {
        let mut message = Message::assistant();
        if !self.text.is_empty() {
            message = message.with_text(self.text);
        }

        let mut indices: Vec<usize> = self.tool_calls.keys().copied().collect();
        indices.sort_unstable();
        let mut tool_calls = self.tool_calls;
        for index in indices {
            let partial = tool_calls.remove(&index).unwrap_or_default();
            if partial.name.is_empty() {
                continue;
            }
            let arguments = if partial.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                match serde_json::from_str(&partial.arguments) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(
                            tool = %partial.name,
                            error = %e,
                            "dropping tool call with unparseable arguments"
                        );
                        continue;
                    }
                }
            };
            let id = partial
                .id
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
            message = message.with_tool_request(
                id.clone(),
                ToolCall::new(&partial.name, arguments).with_id(id),
            );
        }

        (message, self.usage)
    }
}
