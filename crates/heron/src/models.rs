//! The data model passed between the orchestrator, providers, and tools.
//!
//! Several wire formats overlap here: OpenAI-style messages/tools sent to
//! providers, native local-server messages, and the text-recovered tool
//! calls for providers with no function calling at all. Everything is
//! converted into these internal structs at the boundary, so no provider
//! shape leaks past its adapter.
pub mod message;
pub mod role;
pub mod tool;
