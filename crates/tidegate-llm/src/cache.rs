//! Best-effort response cache for deterministic completions.
//!
//! Only fully deterministic requests (temperature 0) are ever cached, so
//! a cache hit is byte-identical to what the backend would return. The
//! cache is advisory: failures degrade to a backend call, never an error.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Storage for cached completion payloads.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Duration);
}

/// In-process cache with per-entry expiry.
///
/// Expired entries are dropped lazily on lookup; there is no sweeper
/// task. Good enough for a single gateway process.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), (value, Instant::now() + ttl));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v".to_string(), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        assert_eq!(cache.get("missing").await, None);
    }

    #[tokio::test]
    async fn test_expired_entry_evicted() {
        let cache = MemoryCache::new();
        cache.set("k", "v".to_string(), Duration::ZERO).await;
        assert_eq!(cache.get("k").await, None);
        // The expired entry was dropped, not just hidden.
        assert!(cache.entries.lock().unwrap().is_empty());
    }
}
