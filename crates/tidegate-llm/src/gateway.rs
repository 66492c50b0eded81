//! Gateway facade over the registry, selector, and protocol adapters.
//!
//! This is the only module that dispatches on an endpoint's protocol
//! kind; everything above it works with protocol-neutral requests and
//! normalized results. The gateway also owns health accounting: every
//! backend call it makes records success or failure on the endpoint it
//! was routed to.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use futures::StreamExt;
use serde::Serialize;

use tidegate_core::{ChatTurn, GatewayConfig, GatewayError, ProtocolKind};

use crate::cache::ResponseCache;
use crate::protocol::{
    ChatCall, Completion, FragmentStream, HttpTimeouts, LineJsonAdapter, ProtocolAdapter,
    SseAdapter,
};
use crate::registry::{Endpoint, EndpointRegistry, EndpointStats};
use crate::selector::BackendSelector;

/// How long cached deterministic completions stay valid.
const CACHE_TTL: Duration = Duration::from_secs(3600);

fn default_temperature() -> f32 {
    0.7
}

/// One generation request as callers see it, before routing.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<ChatTurn>,
    /// Model override; falls back to the endpoint's model, then the
    /// gateway default.
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Endpoint to try first, by name.
    pub preferred_endpoint: Option<String>,
}

impl GenerationRequest {
    pub fn new(messages: Vec<ChatTurn>) -> Self {
        Self {
            messages,
            model: None,
            temperature: default_temperature(),
            max_tokens: None,
            preferred_endpoint: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_preferred_endpoint(mut self, name: impl Into<String>) -> Self {
        self.preferred_endpoint = Some(name.into());
        self
    }
}

/// Fleet-level health summary returned by the status route.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy_endpoints: usize,
    pub total_endpoints: usize,
    pub endpoints: Vec<EndpointStats>,
}

/// A routed streaming generation: the model that actually ran plus the
/// fragment stream it produces.
pub struct StreamingGeneration {
    pub model: String,
    pub fragments: FragmentStream,
}

pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<EndpointRegistry>,
    selector: BackendSelector,
    line_json: LineJsonAdapter,
    sse: SseAdapter,
    cache: Option<Arc<dyn ResponseCache>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let registry = Arc::new(EndpointRegistry::from_config(&config.endpoints));
        let selector = BackendSelector::new(registry.clone(), config.default_endpoint.clone());
        let timeouts = HttpTimeouts {
            request: config.request_timeout(),
            streaming: config.streaming_timeout(),
            metadata: config.metadata_timeout(),
            embedding: config.embedding_timeout(),
        };
        Ok(Self {
            line_json: LineJsonAdapter::new(timeouts)?,
            sse: SseAdapter::new(timeouts)?,
            config,
            registry,
            selector,
            cache: None,
        })
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    fn adapter(&self, kind: ProtocolKind) -> &dyn ProtocolAdapter {
        match kind {
            ProtocolKind::LineJson => &self.line_json,
            ProtocolKind::SseOpenai => &self.sse,
        }
    }

    fn route(&self, preferred: Option<&str>) -> Result<Arc<Endpoint>, GatewayError> {
        self.selector
            .select(preferred)
            .ok_or(GatewayError::NoEndpoints)
    }

    fn resolve_model(&self, request: &GenerationRequest, endpoint: &Endpoint) -> String {
        request
            .model
            .clone()
            .or_else(|| endpoint.default_model().map(str::to_string))
            .unwrap_or_else(|| self.config.default_model.clone())
    }

    /// Blocking completion with routing, health accounting, and caching
    /// of deterministic results.
    pub async fn complete(
        &self,
        request: &GenerationRequest,
    ) -> Result<Completion, GatewayError> {
        let endpoint = self.route(request.preferred_endpoint.as_deref())?;
        let model = self.resolve_model(request, &endpoint);
        let call = ChatCall {
            model: model.clone(),
            messages: request.messages.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        // Only temperature-zero output is reproducible enough to cache.
        let cache_key = if request.temperature == 0.0 {
            Some(response_cache_key(&model, &request.messages))
        } else {
            None
        };

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(hit) = cache.get(key).await {
                if let Ok(completion) = serde_json::from_str::<Completion>(&hit) {
                    tracing::debug!(%key, "response cache hit");
                    return Ok(completion);
                }
            }
        }

        let started = Instant::now();
        match self.adapter(endpoint.kind()).complete(&endpoint, &call).await {
            Ok(completion) => {
                endpoint.record_success(started.elapsed());
                if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
                    if let Ok(payload) = serde_json::to_string(&completion) {
                        cache.set(key, payload, CACHE_TTL).await;
                    }
                }
                Ok(completion)
            }
            Err(e) => {
                if e.counts_against_endpoint() {
                    endpoint.record_failure();
                }
                Err(e)
            }
        }
    }

    /// Streaming completion. Health is recorded when the stream finishes:
    /// success on clean exhaustion, failure on the first transported error.
    pub async fn stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<StreamingGeneration, GatewayError> {
        let endpoint = self.route(request.preferred_endpoint.as_deref())?;
        let model = self.resolve_model(request, &endpoint);
        let call = ChatCall {
            model: model.clone(),
            messages: request.messages.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let started = Instant::now();
        let inner = match self.adapter(endpoint.kind()).stream(&endpoint, &call).await {
            Ok(inner) => inner,
            Err(e) => {
                if e.counts_against_endpoint() {
                    endpoint.record_failure();
                }
                return Err(e);
            }
        };

        let wrapped = stream! {
            let mut inner = inner;
            while let Some(item) = inner.next().await {
                match item {
                    Ok(fragment) => yield Ok(fragment),
                    Err(e) => {
                        if e.counts_against_endpoint() {
                            endpoint.record_failure();
                        }
                        yield Err(e);
                        return;
                    }
                }
            }
            endpoint.record_success(started.elapsed());
        };
        Ok(StreamingGeneration {
            model,
            fragments: Box::pin(wrapped),
        })
    }

    /// Embed one text with the configured embedding model.
    pub async fn embed(
        &self,
        text: &str,
        preferred_endpoint: Option<&str>,
    ) -> Result<Vec<f32>, GatewayError> {
        let endpoint = self.route(preferred_endpoint)?;
        let started = Instant::now();
        match self
            .adapter(endpoint.kind())
            .embed(&endpoint, &self.config.embedding_model, text)
            .await
        {
            Ok(vector) => {
                endpoint.record_success(started.elapsed());
                Ok(vector)
            }
            Err(e) => {
                if e.counts_against_endpoint() {
                    endpoint.record_failure();
                }
                Err(e)
            }
        }
    }

    /// Union of model names across healthy endpoints, first-seen order.
    /// An endpoint that fails to answer is recorded and skipped.
    pub async fn list_models(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut models = Vec::new();
        for endpoint in self.registry.list() {
            if !endpoint.is_healthy() {
                continue;
            }
            match self.adapter(endpoint.kind()).list_models(endpoint).await {
                Ok(names) => {
                    for name in names {
                        if seen.insert(name.clone()) {
                            models.push(name);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(endpoint = endpoint.name(), error = %e, "model listing failed");
                    if e.counts_against_endpoint() {
                        endpoint.record_failure();
                    }
                }
            }
        }
        models
    }

    /// Probe every endpoint and report fleet health. A successful probe
    /// restores a demoted endpoint; a failed probe is reported but never
    /// counted against the endpoint, so status polling cannot demote a
    /// backend that generations are still reaching.
    pub async fn health_check(&self) -> HealthReport {
        let mut stats = Vec::with_capacity(self.registry.len());
        for endpoint in self.registry.list() {
            let probe = tokio::time::timeout(
                self.config.probe_timeout(),
                self.adapter(endpoint.kind()).list_models(endpoint),
            )
            .await;
            let reachable = match probe {
                Ok(Ok(_)) => {
                    endpoint.reset_health();
                    true
                }
                Ok(Err(e)) => {
                    tracing::debug!(endpoint = endpoint.name(), error = %e, "probe failed");
                    false
                }
                Err(_) => {
                    tracing::debug!(endpoint = endpoint.name(), "probe timed out");
                    false
                }
            };
            let mut snapshot = endpoint.stats();
            snapshot.is_healthy = reachable;
            stats.push(snapshot);
        }

        HealthReport {
            healthy_endpoints: stats.iter().filter(|s| s.is_healthy).count(),
            total_endpoints: stats.len(),
            endpoints: stats,
        }
    }
}

/// Cache key for a deterministic completion. Hashes the message list so
/// the key stays bounded regardless of conversation size.
fn response_cache_key(model: &str, messages: &[ChatTurn]) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    for turn in messages {
        turn.role.as_str().hash(&mut hasher);
        turn.content.hash(&mut hasher);
    }
    format!("llm:response:{}:{:x}", model, hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidegate_core::{EndpointConfig, ProtocolKind};

    fn config(endpoints: Vec<EndpointConfig>) -> GatewayConfig {
        GatewayConfig {
            endpoints,
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_complete_without_endpoints() {
        let gateway = Gateway::new(config(Vec::new())).unwrap();
        let request = GenerationRequest::new(vec![ChatTurn::user("hi")]);
        let err = gateway.complete(&request).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoEndpoints));
    }

    #[tokio::test]
    async fn test_stream_without_endpoints() {
        let gateway = Gateway::new(config(Vec::new())).unwrap();
        let request = GenerationRequest::new(vec![ChatTurn::user("hi")]);
        assert!(matches!(
            gateway.stream(&request).await.err(),
            Some(GatewayError::NoEndpoints)
        ));
    }

    #[tokio::test]
    async fn test_list_models_skips_unhealthy() {
        let gateway = Gateway::new(config(vec![EndpointConfig::new(
            "down",
            ProtocolKind::LineJson,
            "http://203.0.113.1:1",
        )]))
        .unwrap();
        for _ in 0..3 {
            gateway.registry().get("down").unwrap().record_failure();
        }
        // The only endpoint is demoted, so no probe is even attempted.
        assert!(gateway.list_models().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_probe_reports_without_demoting() {
        // Nothing listens on port 1, so the probe fails fast.
        let gateway = Gateway::new(config(vec![EndpointConfig::new(
            "down",
            ProtocolKind::LineJson,
            "http://127.0.0.1:1",
        )]))
        .unwrap();

        let report = gateway.health_check().await;
        assert_eq!(report.healthy_endpoints, 0);
        assert!(!report.endpoints[0].is_healthy);

        // Probes report; only generation failures feed the error counter.
        let endpoint = gateway.registry().get("down").unwrap();
        assert!(endpoint.is_healthy());
        assert_eq!(endpoint.stats().error_count, 0);
    }

    #[test]
    fn test_cache_key_shape_and_stability() {
        let messages = vec![ChatTurn::system("s"), ChatTurn::user("q")];
        let key = response_cache_key("qwen2.5:32b-instruct", &messages);
        assert!(key.starts_with("llm:response:qwen2.5:32b-instruct:"));
        assert_eq!(key, response_cache_key("qwen2.5:32b-instruct", &messages));

        let other = vec![ChatTurn::system("s"), ChatTurn::user("different")];
        assert_ne!(key, response_cache_key("qwen2.5:32b-instruct", &other));
    }

    #[test]
    fn test_resolve_model_precedence() {
        let gateway = Gateway::new(config(vec![EndpointConfig::new(
            "a",
            ProtocolKind::LineJson,
            "http://a",
        )
        .with_model("endpoint-model")]))
        .unwrap();
        let endpoint = gateway.registry().get("a").unwrap();

        let request = GenerationRequest::new(Vec::new()).with_model("explicit");
        assert_eq!(gateway.resolve_model(&request, &endpoint), "explicit");

        let request = GenerationRequest::new(Vec::new());
        assert_eq!(gateway.resolve_model(&request, &endpoint), "endpoint-model");
    }

    #[test]
    fn test_default_temperature() {
        let request = GenerationRequest::new(Vec::new());
        assert!((request.temperature - 0.7).abs() < f32::EPSILON);
    }
}
