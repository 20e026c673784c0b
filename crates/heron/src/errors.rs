use serde::{Deserialize, Serialize};
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    ExecutionError(String),

    #[error("Tool execution timed out after {0}ms")]
    Timeout(u64),
}

pub type ToolResultOutput = Result<String, ToolError>;

/// Errors surfaced by provider adapters and the orchestration loop.
///
/// Cancellation is its own variant so callers can tell "the user stopped
/// this" apart from "the model call failed".
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{provider} API error {status}: {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Context length exceeded. Message: {0}")]
    ContextLengthExceeded(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl ProviderError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }

    /// Status-aware constructor that attaches friendly remediation text for
    /// the codes users actually hit.
    pub fn from_status(provider: &str, status: u16, body: String) -> Self {
        let message = match status {
            401 => format!(
                "Authentication failed. Check that your API key is set and valid.\n{}",
                body
            ),
            429 => format!(
                "Rate limit exceeded. Wait a moment before retrying, or lower your request rate.\n{}",
                body
            ),
            503 => format!(
                "The service is temporarily unavailable. Try again shortly.\n{}",
                body
            ),
            _ => body,
        };
        ProviderError::Api {
            provider: provider.to_string(),
            status,
            message,
        }
    }
}
