//! Remote peer identities and per-peer state

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::attribute::AttributeRegistry;

// ----------------------------------------------------------------------------
// Identities
// ----------------------------------------------------------------------------

/// Stable identity of a remote peripheral seen by the central role
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Stable identity of a remote central connected to the local peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CentralId(String);

impl CentralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CentralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CentralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

// ----------------------------------------------------------------------------
// Peer State Management
// ----------------------------------------------------------------------------

/// Connection state of a remote peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// A remote peripheral tracked by the central role
///
/// Owns the attribute subtree discovered on it, which is discarded whenever the
/// link drops.
#[derive(Debug)]
pub struct Device {
    pub id: DeviceId,
    pub name: Option<String>,
    pub connection_state: ConnectionState,
    pub attributes: AttributeRegistry,
}

impl Device {
    pub fn new(id: DeviceId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            connection_state: ConnectionState::Disconnected,
            attributes: AttributeRegistry::new(),
        }
    }

    /// Check if the link is up
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    /// Record that a connect request was submitted
    pub fn start_connecting(&mut self) {
        if self.connection_state == ConnectionState::Disconnected {
            self.connection_state = ConnectionState::Connecting;
        }
    }

    /// Record that a disconnect request was submitted
    pub fn start_disconnecting(&mut self) {
        if self.connection_state != ConnectionState::Disconnected {
            self.connection_state = ConnectionState::Disconnecting;
        }
    }

    /// A disconnect request failed; the link is still up
    pub fn abort_disconnecting(&mut self) {
        if self.connection_state == ConnectionState::Disconnecting {
            self.connection_state = ConnectionState::Connected;
        }
    }

    /// Mark the link as up
    pub fn mark_connected(&mut self) {
        self.connection_state = ConnectionState::Connected;
    }

    /// Mark the link as down and drop everything discovered over it
    pub fn mark_disconnected(&mut self) -> usize {
        self.connection_state = ConnectionState::Disconnected;
        let discarded = self.attributes.len();
        self.attributes.clear();
        discarded
    }

    /// Display name for log lines
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unknown")
    }
}

/// A remote central observed by the peripheral role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Central {
    pub id: CentralId,
    /// Largest value the central accepts in one notification or indication
    pub maximum_update_length: usize,
}

impl Central {
    pub fn new(id: CentralId, maximum_update_length: usize) -> Self {
        Self {
            id,
            maximum_update_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_transitions() {
        let mut device = Device::new(DeviceId::new("peer-A"), None);
        assert_eq!(device.connection_state, ConnectionState::Disconnected);

        // disconnecting an idle device stays idle
        device.start_disconnecting();
        assert_eq!(device.connection_state, ConnectionState::Disconnected);

        device.start_connecting();
        assert_eq!(device.connection_state, ConnectionState::Connecting);
        device.mark_connected();
        assert!(device.is_connected());

        device.start_disconnecting();
        assert_eq!(device.connection_state, ConnectionState::Disconnecting);
        device.mark_disconnected();
        assert_eq!(device.connection_state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_display_name_fallback() {
        let device = Device::new(DeviceId::new("peer-A"), None);
        assert_eq!(device.display_name(), "unknown");
        let device = Device::new(DeviceId::new("peer-B"), Some("Sensor".into()));
        assert_eq!(device.display_name(), "Sensor");
    }
}
