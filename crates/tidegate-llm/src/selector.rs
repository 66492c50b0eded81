//! Backend selection over the endpoint registry.

use std::sync::Arc;

use crate::registry::{Endpoint, EndpointRegistry};

/// Picks the endpoint for one request.
#[derive(Debug, Clone)]
pub struct BackendSelector {
    registry: Arc<EndpointRegistry>,
    default_endpoint: Option<String>,
}

impl BackendSelector {
    pub fn new(registry: Arc<EndpointRegistry>, default_endpoint: Option<String>) -> Self {
        Self {
            registry,
            default_endpoint,
        }
    }

    /// Select an endpoint: explicit preference, then the configured
    /// default, then the healthy endpoint with the lowest average latency
    /// (ties broken by registry order).
    ///
    /// When no endpoint is healthy, health is reset on all of them and
    /// selection retries over the recovered set. A total outage therefore
    /// never wedges the gateway permanently, at the cost of a retry storm
    /// against a fully down fleet. Returns `None` only when the registry
    /// is empty.
    pub fn select(&self, preferred: Option<&str>) -> Option<Arc<Endpoint>> {
        if let Some(name) = preferred {
            if let Some(ep) = self.registry.get(name) {
                if ep.is_healthy() {
                    return Some(ep);
                }
            }
        }

        if let Some(name) = &self.default_endpoint {
            if let Some(ep) = self.registry.get(name) {
                if ep.is_healthy() {
                    return Some(ep);
                }
            }
        }

        if let Some(ep) = self.least_latency_healthy() {
            return Some(ep);
        }

        if self.registry.is_empty() {
            return None;
        }

        // Full recovery sweep. Deliberately not rate limited; see the
        // status route for observing how often this fires.
        tracing::warn!("no healthy endpoints, resetting health on all");
        for ep in self.registry.list() {
            ep.reset_health();
        }
        self.least_latency_healthy()
    }

    fn least_latency_healthy(&self) -> Option<Arc<Endpoint>> {
        let mut best: Option<(&Arc<Endpoint>, f64)> = None;
        for ep in self.registry.list() {
            if !ep.is_healthy() {
                continue;
            }
            let latency = ep.average_latency();
            // Strict comparison keeps registry order on ties.
            if best.map(|(_, b)| latency < b).unwrap_or(true) {
                best = Some((ep, latency));
            }
        }
        best.map(|(ep, _)| ep.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tidegate_core::{EndpointConfig, ProtocolKind};

    fn registry(names: &[&str]) -> Arc<EndpointRegistry> {
        let configs: Vec<_> = names
            .iter()
            .map(|n| EndpointConfig::new(*n, ProtocolKind::LineJson, format!("http://{n}")))
            .collect();
        Arc::new(EndpointRegistry::from_config(&configs))
    }

    fn demote(ep: &Endpoint) {
        for _ in 0..3 {
            ep.record_failure();
        }
    }

    #[test]
    fn test_empty_registry_selects_none() {
        let selector = BackendSelector::new(registry(&[]), None);
        assert!(selector.select(None).is_none());
        assert!(selector.select(Some("ghost")).is_none());
    }

    #[test]
    fn test_preferred_endpoint_wins_when_healthy() {
        let reg = registry(&["a", "b"]);
        let selector = BackendSelector::new(reg, None);
        assert_eq!(selector.select(Some("b")).unwrap().name(), "b");
    }

    #[test]
    fn test_unhealthy_preference_falls_through() {
        let reg = registry(&["a", "b"]);
        demote(&reg.get("b").unwrap());
        let selector = BackendSelector::new(reg, None);
        assert_eq!(selector.select(Some("b")).unwrap().name(), "a");
    }

    #[test]
    fn test_default_endpoint_beats_latency_order() {
        let reg = registry(&["a", "b"]);
        // "a" is faster, but "b" is configured as the default.
        reg.get("a").unwrap().record_success(Duration::from_secs(1));
        reg.get("b").unwrap().record_success(Duration::from_secs(9));
        let selector = BackendSelector::new(reg, Some("b".to_string()));
        assert_eq!(selector.select(None).unwrap().name(), "b");
    }

    #[test]
    fn test_least_latency_selection() {
        let reg = registry(&["slow", "fast"]);
        reg.get("slow").unwrap().record_success(Duration::from_secs(5));
        reg.get("fast").unwrap().record_success(Duration::from_secs(1));
        let selector = BackendSelector::new(reg, None);
        assert_eq!(selector.select(None).unwrap().name(), "fast");
    }

    #[test]
    fn test_cold_endpoint_sorts_first() {
        let reg = registry(&["warm", "cold"]);
        reg.get("warm").unwrap().record_success(Duration::from_millis(100));
        let selector = BackendSelector::new(reg, None);
        // No samples means average 0, so the idle endpoint gets tried.
        assert_eq!(selector.select(None).unwrap().name(), "cold");
    }

    #[test]
    fn test_ties_keep_registry_order() {
        let reg = registry(&["a", "b", "c"]);
        let selector = BackendSelector::new(reg, None);
        assert_eq!(selector.select(None).unwrap().name(), "a");
    }

    #[test]
    fn test_total_outage_triggers_recovery_sweep() {
        let reg = registry(&["a", "b"]);
        demote(&reg.get("a").unwrap());
        demote(&reg.get("b").unwrap());
        let selector = BackendSelector::new(reg.clone(), None);

        let picked = selector.select(None).unwrap();
        assert_eq!(picked.name(), "a");
        // The sweep restored every endpoint, not just the winner.
        assert!(reg.get("a").unwrap().is_healthy());
        assert!(reg.get("b").unwrap().is_healthy());
    }
}
