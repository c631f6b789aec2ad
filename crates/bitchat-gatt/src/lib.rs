//! GATT operation bridges for BitChat
//!
//! Native BLE stacks report every result through unordered delegate callbacks
//! that only name opaque native objects. This crate turns those callbacks into
//! request/response calls with exactly one reply per request, for both BLE
//! roles at once.
//!
//! ## Architecture
//!
//! - [`attribute`] - Stable numeric identities for services, characteristics and descriptors
//! - [`pending`] - Ledger of in-flight operations awaiting a transport callback
//! - [`central`] - Central-role bridge: scanning, connections, GATT client operations
//! - [`peripheral`] - Peripheral-role bridge: local services, advertising, ATT requests
//! - [`config`] - Bridge configuration
//! - [`error`] - Error types shared by both roles
//! - [`protocol`] - ATT codes, property flags, standard UUIDs, advertisement payloads
//! - [`peer`] - Remote device and central records
//! - [`testing`] - Recording transports for driving the bridges without a radio
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bitchat_gatt::testing::RecordingCentralTransport;
//! use bitchat_gatt::{BridgeConfig, CentralBridge, CentralEvent};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(RecordingCentralTransport::new());
//! let (bridge, mut events) = CentralBridge::new(transport, BridgeConfig::new());
//!
//! bridge.start_discovery(&[])?;
//!
//! // The transport feeds callbacks into `handle_callback` or the channel
//! // drained by `run`; discovered devices show up as events.
//! while let Some(event) = events.recv().await {
//!     if let CentralEvent::Discovered { device, .. } = event {
//!         bridge.stop_discovery();
//!         bridge.connect(&device).await?;
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Native Transports
//!
//! The `btleplug` feature adds `BtleplugCentral`, a central transport over the
//! first system adapter. Peripheral-role transports are supplied by the host.

pub mod attribute;
#[cfg(feature = "btleplug")]
pub mod btleplug;
pub mod central;
pub mod config;
pub mod error;
pub mod peer;
pub mod pending;
pub mod peripheral;
pub mod protocol;
pub mod testing;

// Public API exports
pub use attribute::{
    AttributeId, AttributeKind, AttributeNode, AttributeRegistry, CharacteristicDefinition,
    DescriptorDefinition, LocalCharacteristic, LocalDescriptor, LocalService, NativeHandle,
    ServiceDefinition,
};
pub use central::{CentralBridge, CentralCallback, CentralEvent, CentralTransport};
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult, CancelReason, TransportError};
pub use peer::{Central, CentralId, ConnectionState, Device, DeviceId};
pub use pending::{OperationKind, PendingKey, PendingOperations};
pub use peripheral::{
    AttRequest, PeripheralBridge, PeripheralCallback, PeripheralEvent, PeripheralTransport, RequestId,
};
pub use protocol::{Advertisement, AttError, AttributePermissions, CharacteristicProperties, RadioState, WriteType};

#[cfg(feature = "btleplug")]
pub use crate::btleplug::BtleplugCentral;
