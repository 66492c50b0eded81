//! Per-session liveness tracking.
//!
//! Both the heartbeat timer and the message loop consult the same clock:
//! any inbound frame refreshes it, and a session whose client has been
//! silent past the threshold is considered dead.

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct Liveness {
    last_active: Mutex<Instant>,
    threshold: Duration,
}

impl Liveness {
    pub fn new(threshold: Duration) -> Self {
        Self {
            last_active: Mutex::new(Instant::now()),
            threshold,
        }
    }

    /// Record inbound activity.
    pub fn mark_active(&self) {
        if let Ok(mut last) = self.last_active.lock() {
            *last = Instant::now();
        }
    }

    /// True when the client has been silent past the threshold.
    pub fn is_stale(&self) -> bool {
        self.last_active
            .lock()
            .map(|last| last.elapsed() > self.threshold)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_session_is_live() {
        let liveness = Liveness::new(Duration::from_secs(90));
        assert!(!liveness.is_stale());
    }

    #[test]
    fn test_silence_past_threshold_is_stale() {
        let liveness = Liveness::new(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(liveness.is_stale());
    }

    #[test]
    fn test_activity_refreshes() {
        let liveness = Liveness::new(Duration::from_millis(50));
        std::thread::sleep(Duration::from_millis(60));
        assert!(liveness.is_stale());
        liveness.mark_active();
        assert!(!liveness.is_stale());
    }
}
