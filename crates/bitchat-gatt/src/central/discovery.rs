//! Per-device throttling of discovery log lines
//!
//! Scanning with duplicates allowed reports the same peripheral many times a
//! second. Only logging is throttled here; every discovery is still forwarded
//! to the application.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::peer::DeviceId;

/// Remembers when each device was last logged
#[derive(Debug)]
pub struct DiscoveryLogThrottle {
    interval: Duration,
    last_logged: HashMap<DeviceId, Instant>,
}

impl DiscoveryLogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_logged: HashMap::new(),
        }
    }

    /// Check whether a discovery of `device` at `now` should be logged, and
    /// record it if so
    pub fn should_log(&mut self, device: &DeviceId, now: Instant) -> bool {
        match self.last_logged.get(device) {
            Some(last) if now.saturating_duration_since(*last) < self.interval => false,
            _ => {
                self.last_logged.insert(device.clone(), now);
                true
            }
        }
    }

    /// Forget every device
    pub fn clear(&mut self) {
        self.last_logged.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttles_per_device() {
        let mut throttle = DiscoveryLogThrottle::new(Duration::from_secs(30));
        let start = Instant::now();
        let a = DeviceId::new("peer-A");
        let b = DeviceId::new("peer-B");

        assert!(throttle.should_log(&a, start));
        assert!(!throttle.should_log(&a, start + Duration::from_secs(10)));
        assert!(throttle.should_log(&b, start + Duration::from_secs(10)));
        assert!(throttle.should_log(&a, start + Duration::from_secs(30)));
        assert!(!throttle.should_log(&a, start + Duration::from_secs(59)));
    }

    #[test]
    fn test_clear_resets_window() {
        let mut throttle = DiscoveryLogThrottle::new(Duration::from_secs(30));
        let now = Instant::now();
        let a = DeviceId::new("peer-A");
        assert!(throttle.should_log(&a, now));
        throttle.clear();
        assert!(throttle.should_log(&a, now));
    }
}
