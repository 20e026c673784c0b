use anyhow::{Context, Result};
use std::env;

/// Unified enum to wrap different provider configurations
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    OpenAi(OpenAiProviderConfig),
    Ollama(OllamaProviderConfig),
}

/// Configuration for OpenAI-compatible HTTP+SSE endpoints. Several hosted
/// services speak this shape; the two flags cover the family's quirks.
#[derive(Debug, Clone)]
pub struct OpenAiProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
    /// False for endpoints with no function-call support; the orchestrator
    /// then describes tools in the system prompt and parses the text.
    pub native_tool_calling: bool,
    /// True for providers that reject an assistant turn carrying both text
    /// and tool_calls.
    pub exclusive_tool_turns: bool,
}

impl OpenAiProviderConfig {
    pub fn new(host: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            native_tool_calling: true,
            exclusive_tool_turns: false,
        }
    }

    pub fn from_env() -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable is required")?;
        let host = env::var("OPENAI_HOST").unwrap_or_else(|_| "https://api.openai.com".to_string());
        let model = env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        Ok(Self::new(host, api_key, model))
    }
}

/// Configuration for a locally hosted model server speaking the native
/// newline-delimited JSON protocol.
#[derive(Debug, Clone)]
pub struct OllamaProviderConfig {
    pub host: String,
    pub model: String,
    pub temperature: Option<f32>,
    /// Maps to `options.num_predict` on the wire
    pub num_predict: Option<i32>,
}

impl OllamaProviderConfig {
    pub fn new(host: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            model: model.into(),
            temperature: None,
            num_predict: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        let host =
            env::var("OLLAMA_HOST").unwrap_or_else(|_| "http://localhost:11434".to_string());
        let model = env::var("OLLAMA_MODEL").unwrap_or_else(|_| "qwen2.5".to_string());
        Ok(Self::new(host, model))
    }
}
