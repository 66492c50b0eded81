//! Core types for the tidegate LLM gateway.
//!
//! This crate defines the foundational abstractions shared across the
//! workspace: chat turns, gateway configuration, the error taxonomy, and
//! the context builder that fits conversation history into a token budget.

pub mod config;
pub mod context;
pub mod error;
pub mod message;

pub use config::{EndpointConfig, GatewayConfig, ProtocolKind};
pub use context::{ContextBuilder, Summarizer, estimate_tokens};
pub use error::GatewayError;
pub use message::{ChatRole, ChatTurn};
