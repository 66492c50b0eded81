//! Gateway error taxonomy.

/// Errors produced by the gateway and its protocol adapters.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Configuration is missing or malformed. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No healthy endpoint remained even after the recovery sweep.
    #[error("No LLM endpoints available")]
    NoEndpoints,

    /// The backend returned a non-success status or an unusable body.
    #[error("Generation error: {0}")]
    Generation(String),

    /// Transport-level failure talking to a backend.
    #[error("Network error: {0}")]
    Network(String),

    /// A backend call exceeded its deadline.
    #[error("Operation timed out after {0}s")]
    Timeout(u64),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    /// Whether this failure should be counted against an endpoint's health.
    ///
    /// Protocol-level recoveries (skipped lines) never reach here; every
    /// propagated generation failure is attributable to the endpoint.
    pub fn counts_against_endpoint(&self) -> bool {
        matches!(
            self,
            Self::Generation(_) | Self::Network(_) | Self::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = GatewayError::Timeout(600);
        assert_eq!(err.to_string(), "Operation timed out after 600s");
        assert_eq!(
            GatewayError::NoEndpoints.to_string(),
            "No LLM endpoints available"
        );
    }

    #[test]
    fn test_health_attribution() {
        assert!(GatewayError::Network("reset".into()).counts_against_endpoint());
        assert!(GatewayError::Timeout(30).counts_against_endpoint());
        assert!(!GatewayError::Config("bad".into()).counts_against_endpoint());
        assert!(!GatewayError::NoEndpoints.counts_against_endpoint());
    }
}
