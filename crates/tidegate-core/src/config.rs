//! Gateway configuration.
//!
//! Endpoints are declared once at startup; everything else has serde
//! defaults so a minimal config only needs the endpoint list.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::GatewayError;

/// Which of the two supported wire formats an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    /// Line-delimited JSON chat protocol (`/api/chat`, `done: true` terminal).
    LineJson,
    /// SSE-chunked OpenAI-compatible protocol (`/v1/chat/completions`,
    /// `data: [DONE]` terminal).
    SseOpenai,
}

/// One configured backend inference service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Unique name within the registry.
    pub name: String,

    /// Wire protocol the endpoint speaks.
    pub kind: ProtocolKind,

    /// Base URL, e.g. "http://localhost:11434". A trailing slash is stripped.
    pub url: String,

    /// Model used when a request does not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Bearer token for endpoints that require one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, kind: ProtocolKind, url: impl Into<String>) -> Self {
        let url: String = url.into();
        Self {
            name: name.into(),
            kind,
            url: url.trim_end_matches('/').to_string(),
            model: None,
            api_key: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

fn default_model() -> String {
    "qwen2.5:32b-instruct".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_context_budget() -> usize {
    4000
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_streaming_timeout_secs() -> u64 {
    900
}

fn default_metadata_timeout_secs() -> u64 {
    10
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_embedding_timeout_secs() -> u64 {
    30
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_liveness_timeout_secs() -> u64 {
    90
}

fn default_receive_timeout_secs() -> u64 {
    120
}

/// Gateway-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Backend endpoints, in selection-tiebreak order.
    pub endpoints: Vec<EndpointConfig>,

    /// Endpoint used when a request carries no preference, if healthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_endpoint: Option<String>,

    /// Model used when neither request nor endpoint names one.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Model used for embedding calls.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Token budget for context assembly.
    #[serde(default = "default_context_budget")]
    pub context_budget: usize,

    /// Timeout for blocking completions. Generation can be slow.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Timeout for streaming completions, end to end.
    #[serde(default = "default_streaming_timeout_secs")]
    pub streaming_timeout_secs: u64,

    /// Timeout for model listing. Must not block request routing.
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,

    /// Timeout for health probes.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Timeout for embedding calls.
    #[serde(default = "default_embedding_timeout_secs")]
    pub embedding_timeout_secs: u64,

    /// Interval between session liveness pings.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Inbound silence after which a session is considered dead.
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,

    /// How long the session loop waits for one inbound frame before
    /// re-checking liveness. Bounds staleness detection latency.
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            default_endpoint: None,
            default_model: default_model(),
            embedding_model: default_embedding_model(),
            context_budget: default_context_budget(),
            request_timeout_secs: default_request_timeout_secs(),
            streaming_timeout_secs: default_streaming_timeout_secs(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            embedding_timeout_secs: default_embedding_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
            receive_timeout_secs: default_receive_timeout_secs(),
        }
    }
}

impl GatewayConfig {
    /// Parse a config from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, GatewayError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| GatewayError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from the `TIDEGATE_ENDPOINTS` environment variable,
    /// a comma-separated list of line-json base URLs.
    pub fn from_env() -> Result<Self, GatewayError> {
        let raw = std::env::var("TIDEGATE_ENDPOINTS")
            .map_err(|_| GatewayError::Config("TIDEGATE_ENDPOINTS is not set".into()))?;
        let endpoints = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|url| EndpointConfig::new(url, ProtocolKind::LineJson, url))
            .collect::<Vec<_>>();

        let mut config = Self {
            endpoints,
            ..Self::default()
        };
        if let Ok(model) = std::env::var("TIDEGATE_DEFAULT_MODEL") {
            config.default_model = model;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject empty or duplicated endpoint declarations. Fatal at startup.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.endpoints.is_empty() {
            return Err(GatewayError::Config("no endpoints configured".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for ep in &self.endpoints {
            if ep.name.is_empty() || ep.url.is_empty() {
                return Err(GatewayError::Config(
                    "endpoint name and url must be non-empty".into(),
                ));
            }
            if !seen.insert(ep.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate endpoint name: {}",
                    ep.name
                )));
            }
        }
        if let Some(default) = &self.default_endpoint {
            if !self.endpoints.iter().any(|ep| &ep.name == default) {
                return Err(GatewayError::Config(format!(
                    "default endpoint {default} is not declared"
                )));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn streaming_timeout(&self) -> Duration {
        Duration::from_secs(self.streaming_timeout_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }
}
