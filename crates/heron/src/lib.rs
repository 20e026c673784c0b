pub mod agent;
pub mod capability;
pub mod errors;
pub mod execute;
pub mod extract;
pub mod models;
pub mod providers;

pub use agent::{Agent, AgentConfig};
pub use capability::CapabilityCache;
pub use errors::{ProviderError, ToolError};
pub use execute::{ToolExecutionConfig, ToolExecutionManager, ToolRegistry};
pub use models::message::Message;
pub use models::tool::{Tool, ToolCall, ToolResult};
pub use providers::base::{LLMResponse, Provider, Usage};
