//! The per-conversation control loop.
//!
//! One `reply` call may span several network round trips: send the request,
//! stream the response, execute any tool calls, feed the results back, and
//! repeat until the model stops asking for tools or the iteration ceiling
//! is reached. Text already forwarded to the chunk handler stays delivered
//! even when a later round fails.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::capability::CapabilityCache;
use crate::errors::ProviderError;
use crate::execute::{summarize, ToolExecutionConfig, ToolExecutionManager, ToolRegistry};
use crate::extract::{extract_tool_calls, ExtractorConfig, ERROR_RESPONSE_TOOL};
use crate::models::message::Message;
use crate::models::tool::{Tool, ToolCall, ToolResult};
use crate::providers::base::{Cost, LLMResponse, Provider, StreamEvent, StreamingAccumulator, Usage};

/// Where the loop currently is. Also traced, so a hung conversation can be
/// located from logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingModel,
    ToolsFound,
    ExecutingTools,
    BuildingFollowup,
    Done,
    Cancelled,
}

pub type ChunkHandler<'a> = &'a (dyn Fn(&str) + Send + Sync);
pub type PricingFn = Box<dyn Fn(&str, &str, &Usage) -> Cost + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Ceiling on model round trips within one reply, so multi-hop tool
    /// chains always terminate
    pub max_iterations: usize,
    /// Emit a delimited status block to the chunk handler after each tool
    /// round
    pub emit_tool_status: bool,
    pub extractor: ExtractorConfig,
    pub execution: ToolExecutionConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            emit_tool_status: false,
            extractor: ExtractorConfig::default(),
            execution: ToolExecutionConfig::default(),
        }
    }
}

/// Agent drives one provider plus one tool registry through the agentic
/// loop
pub struct Agent {
    provider: Box<dyn Provider>,
    registry: Arc<dyn ToolRegistry>,
    capabilities: Arc<CapabilityCache>,
    manager: ToolExecutionManager,
    config: AgentConfig,
    pricing: Option<PricingFn>,
}

impl Agent {
    pub fn new(provider: Box<dyn Provider>, registry: Arc<dyn ToolRegistry>) -> Self {
        let config = AgentConfig::default();
        Self {
            provider,
            registry,
            capabilities: Arc::new(CapabilityCache::new()),
            manager: ToolExecutionManager::new(config.execution.clone()),
            config,
            pricing: None,
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.manager = ToolExecutionManager::new(config.execution.clone());
        self.config = config;
        self
    }

    /// Share a capability cache across agents
    pub fn with_capabilities(mut self, capabilities: Arc<CapabilityCache>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Install a pricing function used to fill `LLMResponse::cost`
    pub fn with_pricing(mut self, pricing: PricingFn) -> Self {
        self.pricing = Some(pricing);
        self
    }

    /// Send one user message and drive the loop to completion.
    ///
    /// `history` is the caller-visible conversation so far; the new user
    /// turn is appended internally and the whole sequence is sent on every
    /// round, so the system prompt and the most recent user turn are always
    /// present in follow-ups. When `on_chunk` is provided the model turns
    /// are streamed and text is forwarded as it arrives.
    pub async fn reply(
        &self,
        message: &str,
        system: &str,
        history: &[Message],
        on_chunk: Option<ChunkHandler<'_>>,
        cancel: CancellationToken,
        conversation_id: Option<&str>,
    ) -> Result<LLMResponse, ProviderError> {
        let conversation = conversation_id.unwrap_or("-");
        let tools = self.registry.list_tools();
        let tool_names: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();

        let mut native = self.provider.supports_native_tools();
        if native {
            if let Some(cached) = self
                .capabilities
                .native_tools(self.provider.model(), self.provider.host())
            {
                native = cached;
            }
        }

        let mut messages = history.to_vec();
        messages.push(Message::user().with_text(message));

        let mut usage_total = Usage::default();
        let mut all_tool_calls: Vec<ToolCall> = Vec::new();
        let mut last_text = String::new();
        let mut iterations = 0;

        while iterations < self.config.max_iterations {
            self.trace_state(conversation, LoopState::AwaitingModel);
            if cancel.is_cancelled() {
                self.trace_state(conversation, LoopState::Cancelled);
                return Err(ProviderError::Cancelled);
            }

            let (system_prompt, send_tools) = if native {
                (system.to_string(), tools.as_slice())
            } else {
                (text_mode_system(system, &tools), &[][..])
            };

            let turn = self
                .turn(&system_prompt, &messages, send_tools, on_chunk, &cancel)
                .await;

            let (mut response, usage) = match turn {
                Ok(turn) => turn,
                Err(error) if native && !tools.is_empty() && is_tools_rejection(&error) => {
                    // The endpoint rejected the tools field; learn it once
                    // and redo this round text-based.
                    warn!(
                        model = self.provider.model(),
                        "provider rejected tools, switching to text-based tool calling"
                    );
                    self.capabilities.record_native_tools(
                        self.provider.model(),
                        self.provider.host(),
                        false,
                    );
                    native = false;
                    continue;
                }
                Err(error) => return Err(error),
            };
            iterations += 1;
            usage_total.accumulate(&usage);

            if !native && !response.has_tool_requests() {
                let text = response.text();
                for call in extract_tool_calls(&text, &tool_names, &self.config.extractor) {
                    let id = call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
                    response = response.with_tool_request(id.clone(), call.with_id(id));
                }
            }

            let requests = response.tool_requests();
            if requests.is_empty() {
                last_text = response.text();
                messages.push(response);
                self.trace_state(conversation, LoopState::Done);
                return Ok(self.finish(last_text, usage_total, all_tool_calls));
            }

            self.trace_state(conversation, LoopState::ToolsFound);
            let calls: Vec<ToolCall> = requests
                .iter()
                .map(|request| {
                    let mut call = request.tool_call.clone();
                    if call.id.is_none() {
                        call.id = Some(request.id.clone());
                    }
                    call
                })
                .collect();
            all_tool_calls.extend(calls.clone());

            if cancel.is_cancelled() {
                self.trace_state(conversation, LoopState::Cancelled);
                return Err(ProviderError::Cancelled);
            }

            self.trace_state(conversation, LoopState::ExecutingTools);
            // Synthetic corrective calls never reach the registry; their
            // failure text is the extractor's own message.
            let (error_calls, exec_calls): (Vec<ToolCall>, Vec<ToolCall>) = calls
                .iter()
                .cloned()
                .partition(|call| call.name == ERROR_RESPONSE_TOOL);
            let mut results = self
                .manager
                .execute_batch(&exec_calls, self.registry.as_ref(), &cancel)
                .await;
            for call in error_calls {
                results.push(ToolResult {
                    id: call.id,
                    name: call.name,
                    result: call.arguments["error"]
                        .as_str()
                        .unwrap_or("unknown tool requested")
                        .to_string(),
                    success: false,
                    duration: Duration::ZERO,
                });
            }
            if cancel.is_cancelled() {
                self.trace_state(conversation, LoopState::Cancelled);
                return Err(ProviderError::Cancelled);
            }

            // Every id we are about to answer must match an id we were
            // asked for; anything else would desynchronize provider-side
            // conversation state.
            verify_id_correlation(&calls, &results)?;

            if self.config.emit_tool_status {
                if let Some(on_chunk) = on_chunk {
                    on_chunk(&format!("\n{}\n", summarize(&results)));
                }
            }

            self.trace_state(conversation, LoopState::BuildingFollowup);
            last_text = response.text();
            messages.push(response);
            let mut tool_message = Message::user();
            for result in &results {
                let id = result.id.clone().unwrap_or_default();
                let outcome = if result.success {
                    Ok(result.result.clone())
                } else {
                    Err(crate::errors::ToolError::ExecutionError(
                        result.result.clone(),
                    ))
                };
                tool_message = tool_message.with_tool_response(id, outcome);
            }
            messages.push(tool_message);
        }

        debug!(
            conversation,
            iterations, "reply reached the iteration ceiling"
        );
        Ok(self.finish(last_text, usage_total, all_tool_calls))
    }

    /// One model round trip: streaming when a chunk handler is given,
    /// otherwise a single completion call.
    async fn turn(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[Tool],
        on_chunk: Option<ChunkHandler<'_>>,
        cancel: &CancellationToken,
    ) -> Result<(Message, Usage), ProviderError> {
        match on_chunk {
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ProviderError::Cancelled),
                    turn = self.provider.complete(system, messages, tools) => turn,
                }
            }
            Some(on_chunk) => {
                let mut stream = self
                    .provider
                    .stream(system, messages, tools, cancel.clone())
                    .await?;
                let mut accumulator = StreamingAccumulator::new();
                while let Some(event) = stream.next().await {
                    let event = event?;
                    if let StreamEvent::Text(text) = &event {
                        on_chunk(text);
                    }
                    if accumulator.apply(event) {
                        break;
                    }
                }
                Ok(accumulator.finish())
            }
        }
    }

    fn finish(&self, content: String, usage: Usage, tool_calls: Vec<ToolCall>) -> LLMResponse {
        let cost = self
            .pricing
            .as_ref()
            .map(|pricing| pricing(self.provider.name(), self.provider.model(), &usage));
        LLMResponse {
            content,
            usage: Some(usage),
            cost,
            tool_calls,
        }
    }

    fn trace_state(&self, conversation: &str, state: LoopState) {
        debug!(conversation, state = ?state, "agent loop");
    }
}

/// The set of result ids must exactly equal the set of call ids: no
/// additions, no omissions, no renaming. A mismatch is fatal for the run.
fn verify_id_correlation(
    calls: &[ToolCall],
    results: &[ToolResult],
) -> Result<(), ProviderError> {
    let call_ids: HashSet<&str> = calls.iter().filter_map(|c| c.id.as_deref()).collect();
    let result_ids: HashSet<&str> = results.iter().filter_map(|r| r.id.as_deref()).collect();

    if call_ids != result_ids {
        let mut requested: Vec<&str> = call_ids.iter().copied().collect();
        let mut resolved: Vec<&str> = result_ids.iter().copied().collect();
        requested.sort_unstable();
        resolved.sort_unstable();
        return Err(ProviderError::Protocol(format!(
            "tool result ids do not match tool call ids (requested: [{}], resolved: [{}])",
            requested.join(", "),
            resolved.join(", ")
        )));
    }
    Ok(())
}

/// Whether an API rejection is about the tools field rather than the
/// request as a whole.
fn is_tools_rejection(error: &ProviderError) -> bool {
    match error {
        ProviderError::Api {
            status, message, ..
        } if *status == 400 || *status == 422 => {
            let lower = message.to_lowercase();
            lower.contains("tool") || lower.contains("function")
        }
        _ => false,
    }
}

/// System prompt suffix describing the registered tools and the XML calling
/// convention, for providers with no native function calling.
fn text_mode_system(system: &str, tools: &[Tool]) -> String {
    let mut sections = vec![
        system.to_string(),
        "You have access to the following tools. To call one, respond with an XML block \
         shaped like <tool_name><param>value</param></tool_name>, using one child tag per \
         argument. Do not wrap the block in code fences."
            .to_string(),
    ];
    for tool in tools {
        sections.push(format!(
            "- {}: {}\n  parameters: {}",
            tool.name, tool.description, tool.parameters
        ));
    }
    sections.join("\n\n")
}
