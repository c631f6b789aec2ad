//! Bridge configuration

use std::time::Duration;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration shared by the central and peripheral bridges
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BridgeConfig {
    /// Minimum time between two discovery log lines for the same device
    pub discovery_log_interval: Duration,
    /// Ask the transport to report every advertisement, not only the first
    pub allow_duplicate_discoveries: bool,
    /// Capacity of the callback channel handed to native transports
    pub callback_channel_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            discovery_log_interval: Duration::from_secs(30),
            allow_duplicate_discoveries: true,
            callback_channel_capacity: 256,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-device discovery log interval
    pub fn with_discovery_log_interval(mut self, interval: Duration) -> Self {
        self.discovery_log_interval = interval;
        self
    }

    /// Enable or disable duplicate discovery reports
    pub fn with_allow_duplicate_discoveries(mut self, enabled: bool) -> Self {
        self.allow_duplicate_discoveries = enabled;
        self
    }

    /// Set callback channel capacity
    pub fn with_callback_channel_capacity(mut self, capacity: usize) -> Self {
        self.callback_channel_capacity = capacity.max(1);
        self
    }
}
