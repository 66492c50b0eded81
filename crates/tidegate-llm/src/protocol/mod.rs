//! Protocol adapters for the two supported backend wire formats.
//!
//! Both variants satisfy one capability interface so everything above the
//! adapter is protocol-agnostic: blocking completions normalize to
//! [`Completion`], streaming completions to a finite fragment stream.

mod line_json;
mod sse;

pub use line_json::LineJsonAdapter;
pub use sse::SseAdapter;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use tidegate_core::{ChatTurn, GatewayError};

use crate::registry::Endpoint;

/// A finite, non-restartable stream of generated text fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>;

/// Token accounting reported by a backend, when available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Normalized result of a blocking completion, identical across variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// One completion call, already resolved to a concrete model.
#[derive(Debug, Clone)]
pub struct ChatCall {
    pub model: String,
    pub messages: Vec<ChatTurn>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

/// Per-call deadlines, taken from the gateway config.
///
/// Streaming gets a minutes-scale budget since generation is slow;
/// metadata calls must stay seconds-scale so they never block routing.
#[derive(Debug, Clone, Copy)]
pub struct HttpTimeouts {
    pub request: Duration,
    pub streaming: Duration,
    pub metadata: Duration,
    pub embedding: Duration,
}

/// Capability interface every backend protocol satisfies.
///
/// Adapters do not retry or fail over; a transport failure propagates to
/// the caller, which owns health accounting and re-routing policy.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// List model names the endpoint serves.
    async fn list_models(&self, endpoint: &Endpoint) -> Result<Vec<String>, GatewayError>;

    /// Blocking completion.
    async fn complete(
        &self,
        endpoint: &Endpoint,
        call: &ChatCall,
    ) -> Result<Completion, GatewayError>;

    /// Streaming completion, yielding fragments as they arrive.
    async fn stream(
        &self,
        endpoint: &Endpoint,
        call: &ChatCall,
    ) -> Result<FragmentStream, GatewayError>;

    /// Embed one text into a vector.
    async fn embed(
        &self,
        endpoint: &Endpoint,
        model: &str,
        text: &str,
    ) -> Result<Vec<f32>, GatewayError>;
}

/// Role/content pair as both wire formats expect it.
#[derive(Debug, Serialize)]
pub(crate) struct WireMessage<'a> {
    pub role: &'static str,
    pub content: &'a str,
}

pub(crate) fn wire_messages(messages: &[ChatTurn]) -> Vec<WireMessage<'_>> {
    messages
        .iter()
        .map(|turn| WireMessage {
            role: turn.role.as_str(),
            content: &turn.content,
        })
        .collect()
}

pub(crate) fn transport_error(e: reqwest::Error, deadline: Duration) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout(deadline.as_secs())
    } else {
        GatewayError::Network(e.to_string())
    }
}

pub(crate) fn status_error(status: reqwest::StatusCode, body: &str) -> GatewayError {
    GatewayError::Generation(format!("backend error {}: {}", status.as_u16(), body))
}
