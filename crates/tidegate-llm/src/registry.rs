//! Endpoint registry with per-endpoint health statistics.
//!
//! Health state is guarded by one mutex per endpoint so concurrent
//! generations against different backends never serialize on each other.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use tidegate_core::{EndpointConfig, ProtocolKind};

/// Samples retained per endpoint.
const SAMPLE_WINDOW: usize = 100;

/// Samples used when computing the average latency.
const AVERAGE_WINDOW: usize = 10;

/// Consecutive failures after which an endpoint is demoted.
const ERROR_THRESHOLD: u32 = 3;

#[derive(Debug)]
struct HealthState {
    healthy: bool,
    response_times: VecDeque<f64>,
    consecutive_errors: u32,
}

impl HealthState {
    fn new() -> Self {
        Self {
            healthy: true,
            response_times: VecDeque::with_capacity(SAMPLE_WINDOW),
            consecutive_errors: 0,
        }
    }

    fn record_success(&mut self, elapsed_secs: f64) {
        self.response_times.push_back(elapsed_secs);
        if self.response_times.len() > SAMPLE_WINDOW {
            self.response_times.pop_front();
        }
        // One successful generation restores eligibility after transient
        // failures.
        self.consecutive_errors = 0;
        self.healthy = true;
    }

    fn record_failure(&mut self) {
        self.consecutive_errors += 1;
        if self.consecutive_errors >= ERROR_THRESHOLD {
            self.healthy = false;
        }
    }

    fn reset(&mut self) {
        self.healthy = true;
        self.consecutive_errors = 0;
    }

    fn average_latency(&self) -> f64 {
        let len = self.response_times.len();
        if len == 0 {
            // Unexercised endpoints sort first under least-latency
            // selection: cold-start bias toward trying idle backends.
            return 0.0;
        }
        let recent = self.response_times.iter().rev().take(AVERAGE_WINDOW);
        let count = len.min(AVERAGE_WINDOW);
        recent.sum::<f64>() / count as f64
    }
}

/// One configured backend with its live health state.
#[derive(Debug)]
pub struct Endpoint {
    config: EndpointConfig,
    health: Mutex<HealthState>,
}

/// Point-in-time view of an endpoint's health, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub name: String,
    pub url: String,
    pub is_healthy: bool,
    pub average_response_time: f64,
    pub error_count: u32,
}

impl Endpoint {
    fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            health: Mutex::new(HealthState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kind(&self) -> ProtocolKind {
        self.config.kind
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn default_model(&self) -> Option<&str> {
        self.config.model.as_deref()
    }

    pub fn api_key(&self) -> Option<&str> {
        self.config.api_key.as_deref()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.lock().map(|h| h.healthy).unwrap_or(false)
    }

    /// Average over the most recent samples, 0 when none were recorded.
    pub fn average_latency(&self) -> f64 {
        self.health
            .lock()
            .map(|h| h.average_latency())
            .unwrap_or(0.0)
    }

    /// Record a completed request and its elapsed time.
    pub fn record_success(&self, elapsed: Duration) {
        if let Ok(mut health) = self.health.lock() {
            health.record_success(elapsed.as_secs_f64());
        }
    }

    /// Record a failed request. Three in a row demote the endpoint.
    pub fn record_failure(&self) {
        if let Ok(mut health) = self.health.lock() {
            health.record_failure();
            if !health.healthy {
                tracing::warn!(endpoint = self.name(), "endpoint demoted after repeated failures");
            }
        }
    }

    /// Clear the error counter and mark the endpoint healthy again.
    pub fn reset_health(&self) {
        if let Ok(mut health) = self.health.lock() {
            health.reset();
        }
    }

    pub fn stats(&self) -> EndpointStats {
        let (is_healthy, average, errors) = self
            .health
            .lock()
            .map(|h| (h.healthy, h.average_latency(), h.consecutive_errors))
            .unwrap_or((false, 0.0, 0));
        EndpointStats {
            name: self.config.name.clone(),
            url: self.config.url.clone(),
            is_healthy,
            average_response_time: average,
            error_count: errors,
        }
    }
}

/// All configured endpoints, created once at gateway startup.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: Vec<Arc<Endpoint>>,
}

impl EndpointRegistry {
    pub fn from_config(configs: &[EndpointConfig]) -> Self {
        Self {
            endpoints: configs
                .iter()
                .cloned()
                .map(|c| Arc::new(Endpoint::new(c)))
                .collect(),
        }
    }

    pub fn list(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn get(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints
            .iter()
            .find(|ep| ep.name() == name)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }
}
