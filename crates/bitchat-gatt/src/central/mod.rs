//! Central-role bridge
//!
//! Drives scanning, the connection lifecycle and GATT client operations
//! against remote peripherals. Every multi-step operation registers a pending
//! completion, submits to the [`CentralTransport`] and then waits for the
//! matching [`CentralCallback`], which the bridge receives either through
//! [`CentralBridge::handle_callback`] or from the channel drained by
//! [`CentralBridge::run`].
//!
//! Device table, attribute identities and pending operations sit behind one
//! lock, so a disconnect clears a device and fails its operations atomically
//! with respect to new submissions.

pub mod discovery;
pub mod events;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::attribute::{AttributeId, AttributeKind, AttributeNode, AttributeRegistry, NativeHandle};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult, CancelReason, TransportError};
use crate::peer::{ConnectionState, Device, DeviceId};
use crate::pending::{OperationKind, OperationOutput, PeerRef, PendingKey, PendingOperations};
use crate::protocol::{AttributePermissions, RadioState, WriteType};

pub use discovery::DiscoveryLogThrottle;
pub use events::CentralEvent;
pub use transport::{
    CentralCallback, CentralTransport, NativeCharacteristic, NativeDescriptor, NativeService,
    PeripheralInfo,
};

// ----------------------------------------------------------------------------
// Role State
// ----------------------------------------------------------------------------

/// Everything the central role mutates, guarded as one unit
#[derive(Debug)]
struct CentralState {
    devices: HashMap<DeviceId, Device>,
    pending: PendingOperations,
    discovery_log: DiscoveryLogThrottle,
}

type Resolver = for<'a> fn(&'a AttributeRegistry, AttributeId) -> BridgeResult<&'a AttributeNode>;

impl CentralState {
    fn device(&self, id: &DeviceId) -> BridgeResult<&Device> {
        self.devices
            .get(id)
            .ok_or_else(|| BridgeError::UnknownDevice { device: id.clone() })
    }

    /// Native handle behind an attribute of a known device
    fn handle(&self, device: &DeviceId, id: AttributeId, resolve: Resolver) -> BridgeResult<NativeHandle> {
        let device = self.device(device)?;
        resolve(&device.attributes, id)?
            .handle
            .ok_or(BridgeError::UnknownAttribute { id })
    }

    fn lookup(&self, device: &DeviceId, handle: NativeHandle) -> Option<AttributeId> {
        self.devices
            .get(device)
            .and_then(|device| device.attributes.lookup_handle(handle))
    }
}

// ----------------------------------------------------------------------------
// Bridge
// ----------------------------------------------------------------------------

/// Request/response front end over a native central stack
pub struct CentralBridge<T: CentralTransport> {
    transport: Arc<T>,
    config: BridgeConfig,
    state: Mutex<CentralState>,
    events: mpsc::UnboundedSender<CentralEvent>,
}

impl<T: CentralTransport> CentralBridge<T> {
    /// Create a bridge over `transport`, returning it with its event stream
    pub fn new(transport: Arc<T>, config: BridgeConfig) -> (Self, mpsc::UnboundedReceiver<CentralEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let state = CentralState {
            devices: HashMap::new(),
            pending: PendingOperations::new(),
            discovery_log: DiscoveryLogThrottle::new(config.discovery_log_interval),
        };
        let bridge = Self {
            transport,
            config,
            state: Mutex::new(state),
            events,
        };
        (bridge, event_rx)
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Bounded channel a native transport can push its callbacks into
    pub fn callback_channel(&self) -> (mpsc::Sender<CentralCallback>, mpsc::Receiver<CentralCallback>) {
        mpsc::channel(self.config.callback_channel_capacity)
    }

    /// Process callbacks in arrival order until every sender is gone
    pub async fn run(&self, mut callbacks: mpsc::Receiver<CentralCallback>) {
        while let Some(callback) = callbacks.recv().await {
            self.handle_callback(callback).await;
        }
        debug!("Central callback channel closed");
    }

    fn emit(&self, event: CentralEvent) {
        if self.events.send(event).is_err() {
            trace!("Central event dropped, no receiver");
        }
    }

    // ------------------------------------------------------------------------
    // Role Lifecycle
    // ------------------------------------------------------------------------

    /// Reset the role: stop scanning, drop every link, cancel every pending
    /// operation and forget every device
    pub async fn initialize(&self) {
        let mut state = self.state.lock().await;
        self.transport.stop_scan();

        for device in state.devices.values() {
            if device.connection_state == ConnectionState::Disconnected {
                continue;
            }
            if let Err(e) = self.transport.cancel_connection(&device.id) {
                warn!("Failed to cancel connection to {}: {}", device.id, e);
            }
        }

        let cancelled = state.pending.cancel_all(CancelReason::Reset);
        let evicted = state.devices.len();
        state.devices.clear();
        state.discovery_log.clear();
        info!(
            "Central role reset: {} devices evicted, {} operations cancelled",
            evicted, cancelled
        );
    }

    pub fn state(&self) -> RadioState {
        self.transport.state()
    }

    /// Open the host's settings page for this app
    pub fn show_app_settings(&self) -> BridgeResult<()> {
        if !self.transport.supports_app_settings() {
            return Err(BridgeError::Unsupported {
                operation: "showAppSettings",
            });
        }
        Ok(self.transport.show_app_settings()?)
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    /// Start scanning for peripherals advertising any of `services`, or for
    /// every peripheral when `services` is empty
    pub fn start_discovery(&self, services: &[Uuid]) -> BridgeResult<()> {
        self.transport
            .start_scan(services, self.config.allow_duplicate_discoveries)?;
        info!("Started discovery ({} service filters)", services.len());
        Ok(())
    }

    pub fn stop_discovery(&self) {
        self.transport.stop_scan();
        info!("Stopped discovery");
    }

    /// Peripherals already connected at the system level
    ///
    /// Each one is recorded so it can be passed to [`connect`](Self::connect)
    /// without being discovered first.
    pub async fn connected_peripherals(&self, services: &[Uuid]) -> Vec<PeripheralInfo> {
        let peripherals = self.transport.connected_peripherals(services);
        let mut state = self.state.lock().await;
        for peripheral in &peripherals {
            let device = state
                .devices
                .entry(peripheral.device.clone())
                .or_insert_with(|| Device::new(peripheral.device.clone(), None));
            if peripheral.name.is_some() {
                device.name = peripheral.name.clone();
            }
        }
        debug!("Found {} connected peripherals", peripherals.len());
        peripherals
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    pub async fn connect(&self, device: &DeviceId) -> BridgeResult<()> {
        let completion = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let target = state
                .devices
                .get_mut(device)
                .ok_or_else(|| BridgeError::UnknownDevice { device: device.clone() })?;
            let key = PendingKey::peer_wide(device.clone(), OperationKind::Connect);
            let completion = state.pending.submit(key, || self.transport.connect(device))?;
            target.start_connecting();
            info!("Connecting to {} ({})", device, target.display_name());
            completion
        };
        completion.wait().await.map(|_| ())
    }

    pub async fn disconnect(&self, device: &DeviceId) -> BridgeResult<()> {
        let completion = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let target = state
                .devices
                .get_mut(device)
                .ok_or_else(|| BridgeError::UnknownDevice { device: device.clone() })?;
            let key = PendingKey::peer_wide(device.clone(), OperationKind::Disconnect);
            let completion = state
                .pending
                .submit(key, || self.transport.cancel_connection(device))?;
            target.start_disconnecting();
            info!("Disconnecting from {}", device);
            completion
        };
        completion.wait().await.map(|_| ())
    }

    /// Current connection state of a known device
    pub async fn connection_state(&self, device: &DeviceId) -> Option<ConnectionState> {
        let state = self.state.lock().await;
        state.devices.get(device).map(|device| device.connection_state)
    }

    // ------------------------------------------------------------------------
    // GATT Discovery
    // ------------------------------------------------------------------------

    pub async fn discover_services(&self, device: &DeviceId) -> BridgeResult<Vec<AttributeNode>> {
        let completion = {
            let mut state = self.state.lock().await;
            state.device(device)?;
            let key = PendingKey::peer_wide(device.clone(), OperationKind::DiscoverServices);
            state.pending.submit(key, || self.transport.discover_services(device))?
        };
        Ok(completion.wait().await?.into_attributes().unwrap_or_default())
    }

    pub async fn discover_included_services(
        &self,
        device: &DeviceId,
        service: AttributeId,
    ) -> BridgeResult<Vec<AttributeNode>> {
        let completion = {
            let mut state = self.state.lock().await;
            let handle = state.handle(device, service, AttributeRegistry::resolve_service)?;
            let key = PendingKey::new(device.clone(), Some(service), OperationKind::DiscoverIncludedServices);
            state
                .pending
                .submit(key, || self.transport.discover_included_services(device, handle))?
        };
        Ok(completion.wait().await?.into_attributes().unwrap_or_default())
    }

    pub async fn discover_characteristics(
        &self,
        device: &DeviceId,
        service: AttributeId,
    ) -> BridgeResult<Vec<AttributeNode>> {
        let completion = {
            let mut state = self.state.lock().await;
            let handle = state.handle(device, service, AttributeRegistry::resolve_service)?;
            let key = PendingKey::new(device.clone(), Some(service), OperationKind::DiscoverCharacteristics);
            state
                .pending
                .submit(key, || self.transport.discover_characteristics(device, handle))?
        };
        Ok(completion.wait().await?.into_attributes().unwrap_or_default())
    }

    pub async fn discover_descriptors(
        &self,
        device: &DeviceId,
        characteristic: AttributeId,
    ) -> BridgeResult<Vec<AttributeNode>> {
        let completion = {
            let mut state = self.state.lock().await;
            let handle = state.handle(device, characteristic, AttributeRegistry::resolve_characteristic)?;
            let key = PendingKey::new(device.clone(), Some(characteristic), OperationKind::DiscoverDescriptors);
            state
                .pending
                .submit(key, || self.transport.discover_descriptors(device, handle))?
        };
        Ok(completion.wait().await?.into_attributes().unwrap_or_default())
    }

    /// Number of attribute identities currently held for a device
    pub async fn attribute_count(&self, device: &DeviceId) -> Option<usize> {
        let state = self.state.lock().await;
        state.devices.get(device).map(|device| device.attributes.len())
    }

    /// Look up a discovered attribute
    pub async fn attribute(&self, device: &DeviceId, id: AttributeId) -> BridgeResult<AttributeNode> {
        let state = self.state.lock().await;
        Ok(state.device(device)?.attributes.resolve(id)?.clone())
    }

    // ------------------------------------------------------------------------
    // Reads, Writes and Subscriptions
    // ------------------------------------------------------------------------

    pub async fn read_characteristic(
        &self,
        device: &DeviceId,
        characteristic: AttributeId,
    ) -> BridgeResult<Vec<u8>> {
        let completion = {
            let mut state = self.state.lock().await;
            let handle = state.handle(device, characteristic, AttributeRegistry::resolve_characteristic)?;
            let key = PendingKey::new(device.clone(), Some(characteristic), OperationKind::ReadCharacteristic);
            state
                .pending
                .submit(key, || self.transport.read_characteristic(device, handle))?
        };
        Ok(completion.wait().await?.into_value().unwrap_or_default())
    }

    /// Write a characteristic value
    ///
    /// Writes without response complete as soon as the transport accepts them.
    pub async fn write_characteristic(
        &self,
        device: &DeviceId,
        characteristic: AttributeId,
        value: &[u8],
        write_type: WriteType,
    ) -> BridgeResult<()> {
        let completion = {
            let mut state = self.state.lock().await;
            let handle = state.handle(device, characteristic, AttributeRegistry::resolve_characteristic)?;
            trace!("Writing {} to {} on {}", hex::encode(value), characteristic, device);

            if write_type == WriteType::WithoutResponse {
                self.transport
                    .write_characteristic(device, handle, value, write_type)?;
                return Ok(());
            }

            let key = PendingKey::new(device.clone(), Some(characteristic), OperationKind::WriteCharacteristic);
            state.pending.submit(key, || {
                self.transport
                    .write_characteristic(device, handle, value, write_type)
            })?
        };
        completion.wait().await.map(|_| ())
    }

    /// Enable or disable notifications for a characteristic
    pub async fn set_notify_state(
        &self,
        device: &DeviceId,
        characteristic: AttributeId,
        enabled: bool,
    ) -> BridgeResult<()> {
        let completion = {
            let mut state = self.state.lock().await;
            let handle = state.handle(device, characteristic, AttributeRegistry::resolve_characteristic)?;
            let key = PendingKey::new(device.clone(), Some(characteristic), OperationKind::SetNotifyState);
            state
                .pending
                .submit(key, || self.transport.set_notify(device, handle, enabled))?
        };
        completion.wait().await.map(|_| ())
    }

    pub async fn read_descriptor(&self, device: &DeviceId, descriptor: AttributeId) -> BridgeResult<Vec<u8>> {
        let completion = {
            let mut state = self.state.lock().await;
            let handle = state.handle(device, descriptor, AttributeRegistry::resolve_descriptor)?;
            let key = PendingKey::new(device.clone(), Some(descriptor), OperationKind::ReadDescriptor);
            state
                .pending
                .submit(key, || self.transport.read_descriptor(device, handle))?
        };
        Ok(completion.wait().await?.into_value().unwrap_or_default())
    }

    pub async fn write_descriptor(
        &self,
        device: &DeviceId,
        descriptor: AttributeId,
        value: &[u8],
    ) -> BridgeResult<()> {
        let completion = {
            let mut state = self.state.lock().await;
            let handle = state.handle(device, descriptor, AttributeRegistry::resolve_descriptor)?;
            trace!("Writing {} to {} on {}", hex::encode(value), descriptor, device);
            let key = PendingKey::new(device.clone(), Some(descriptor), OperationKind::WriteDescriptor);
            state
                .pending
                .submit(key, || self.transport.write_descriptor(device, handle, value))?
        };
        completion.wait().await.map(|_| ())
    }

    pub async fn read_rssi(&self, device: &DeviceId) -> BridgeResult<i16> {
        let completion = {
            let mut state = self.state.lock().await;
            state.device(device)?;
            let key = PendingKey::peer_wide(device.clone(), OperationKind::ReadRssi);
            state.pending.submit(key, || self.transport.read_rssi(device))?
        };
        Ok(completion.wait().await?.into_rssi().unwrap_or_default())
    }

    /// Largest value accepted in one write of the given type
    pub async fn maximum_write_length(&self, device: &DeviceId, write_type: WriteType) -> BridgeResult<usize> {
        let state = self.state.lock().await;
        state.device(device)?;
        Ok(self.transport.maximum_write_length(device, write_type))
    }

    /// Number of operations waiting for a callback
    pub async fn pending_operations(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    // ------------------------------------------------------------------------
    // Callback Handling
    // ------------------------------------------------------------------------

    /// Apply one transport callback
    pub async fn handle_callback(&self, callback: CentralCallback) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        match callback {
            CentralCallback::StateUpdated(radio) => {
                info!("Central radio state: {}", radio);
                self.emit(CentralEvent::StateChanged(radio));
            }

            CentralCallback::Discovered {
                device,
                name,
                rssi,
                advertisement,
            } => {
                let name = name.or_else(|| advertisement.name.clone());
                let known = state
                    .devices
                    .entry(device.clone())
                    .or_insert_with(|| Device::new(device.clone(), None));
                if name.is_some() {
                    known.name = name.clone();
                }
                if state.discovery_log.should_log(&device, Instant::now()) {
                    debug!(
                        "Discovered {} ({}) rssi {}",
                        device,
                        known.display_name(),
                        rssi
                    );
                }
                self.emit(CentralEvent::Discovered {
                    device,
                    name,
                    rssi,
                    advertisement,
                });
            }

            CentralCallback::Connected { device } => {
                match state.devices.get_mut(&device) {
                    Some(known) => known.mark_connected(),
                    None => {
                        debug!("Connection callback for unknown device {}", device);
                        return;
                    }
                }
                info!("Connected to {}", device);
                self.emit(CentralEvent::ConnectionStateChanged {
                    device: device.clone(),
                    state: ConnectionState::Connected,
                    error: None,
                });
                let key = PendingKey::peer_wide(device, OperationKind::Connect);
                state.pending.resolve(&key, Ok(OperationOutput::Done));
            }

            CentralCallback::ConnectFailed { device, error } => {
                match state.devices.get_mut(&device) {
                    Some(known) => {
                        known.mark_disconnected();
                    }
                    None => {
                        debug!("Connect failure for unknown device {}", device);
                        return;
                    }
                }
                warn!("Failed to connect to {}: {}", device, error);
                let peer = PeerRef::Device(device.clone());
                state.pending.resolve_all(&peer, error.clone().into());
                self.emit(CentralEvent::ConnectionStateChanged {
                    device,
                    state: ConnectionState::Disconnected,
                    error: Some(error),
                });
            }

            CentralCallback::Disconnected { device, error } => {
                self.complete_disconnect(state, device, error);
            }

            CentralCallback::DisconnectFailed { device, error } => {
                match state.devices.get_mut(&device) {
                    Some(known) => known.abort_disconnecting(),
                    None => {
                        debug!("Disconnect failure for unknown device {}", device);
                        return;
                    }
                }
                warn!("Failed to disconnect from {}: {}", device, error);
                let key = PendingKey::peer_wide(device, OperationKind::Disconnect);
                state.pending.resolve(&key, Err(error.into()));
            }

            CentralCallback::ServicesDiscovered { device, result } => {
                complete_discovery(state, &device, None, OperationKind::DiscoverServices, result, |s| {
                    (s.handle, s.uuid, AttributeKind::Service { primary: s.primary })
                });
            }

            CentralCallback::IncludedServicesDiscovered { device, service, result } => {
                complete_discovery(
                    state,
                    &device,
                    Some(service),
                    OperationKind::DiscoverIncludedServices,
                    result,
                    |s| (s.handle, s.uuid, AttributeKind::Service { primary: s.primary }),
                );
            }

            CentralCallback::CharacteristicsDiscovered { device, service, result } => {
                complete_discovery(
                    state,
                    &device,
                    Some(service),
                    OperationKind::DiscoverCharacteristics,
                    result,
                    |c| {
                        let kind = AttributeKind::Characteristic {
                            properties: c.properties,
                            permissions: AttributePermissions::empty(),
                        };
                        (c.handle, c.uuid, kind)
                    },
                );
            }

            CentralCallback::DescriptorsDiscovered {
                device,
                characteristic,
                result,
            } => {
                complete_discovery(
                    state,
                    &device,
                    Some(characteristic),
                    OperationKind::DiscoverDescriptors,
                    result,
                    |d| (d.handle, d.uuid, AttributeKind::Descriptor),
                );
            }

            CentralCallback::CharacteristicValueUpdated {
                device,
                characteristic,
                result,
            } => {
                let Some(id) = state.lookup(&device, characteristic) else {
                    debug!("Value update for unknown {} on {}", characteristic, device);
                    return;
                };
                let key = PendingKey::new(device.clone(), Some(id), OperationKind::ReadCharacteristic);
                if state.pending.contains(&key) {
                    state
                        .pending
                        .resolve(&key, result.map(OperationOutput::Value).map_err(BridgeError::from));
                    return;
                }
                match result {
                    Ok(value) => {
                        trace!("Notification from {} on {}: {}", device, id, hex::encode(&value));
                        self.emit(CentralEvent::CharacteristicNotified {
                            device,
                            characteristic: id,
                            value,
                        });
                    }
                    Err(e) => warn!("Unsolicited value error from {} on {}: {}", device, id, e),
                }
            }

            CentralCallback::CharacteristicWritten {
                device,
                characteristic,
                result,
            } => {
                resolve_attribute_op(state, &device, characteristic, OperationKind::WriteCharacteristic, || {
                    result.map(|_| OperationOutput::Done)
                });
            }

            CentralCallback::NotificationStateUpdated {
                device,
                characteristic,
                result,
            } => {
                if let Ok(enabled) = &result {
                    debug!("Notifications on {} for {}: {}", characteristic, device, enabled);
                }
                resolve_attribute_op(state, &device, characteristic, OperationKind::SetNotifyState, || {
                    result.map(|_| OperationOutput::Done)
                });
            }

            CentralCallback::DescriptorValueUpdated {
                device,
                descriptor,
                result,
            } => {
                resolve_attribute_op(state, &device, descriptor, OperationKind::ReadDescriptor, || {
                    result.map(OperationOutput::Value)
                });
            }

            CentralCallback::DescriptorWritten {
                device,
                descriptor,
                result,
            } => {
                resolve_attribute_op(state, &device, descriptor, OperationKind::WriteDescriptor, || {
                    result.map(|_| OperationOutput::Done)
                });
            }

            CentralCallback::RssiRead { device, result } => {
                let key = PendingKey::peer_wide(device, OperationKind::ReadRssi);
                state
                    .pending
                    .resolve(&key, result.map(OperationOutput::Rssi).map_err(BridgeError::from));
            }
        }
    }

    /// Tear down everything tied to a dropped link
    ///
    /// Order matters: the subtree goes first, then every other pending
    /// operation fails, then the state event, then the disconnect completion.
    fn complete_disconnect(&self, state: &mut CentralState, device: DeviceId, error: Option<TransportError>) {
        let Some(known) = state.devices.get_mut(&device) else {
            debug!("Disconnect callback for unknown device {}", device);
            return;
        };

        let disconnect = state
            .pending
            .take(&PendingKey::peer_wide(device.clone(), OperationKind::Disconnect));
        let discarded = known.mark_disconnected();

        let failure = match &error {
            Some(e) => BridgeError::Transport(e.clone()),
            None => BridgeError::Cancelled(CancelReason::Disconnected),
        };
        let failed = state.pending.resolve_all(&PeerRef::Device(device.clone()), failure);

        match &error {
            Some(e) => warn!(
                "Lost {}: {} ({} attributes discarded, {} operations failed)",
                device, e, discarded, failed
            ),
            None => info!(
                "Disconnected from {} ({} attributes discarded, {} operations failed)",
                device, discarded, failed
            ),
        }

        self.emit(CentralEvent::ConnectionStateChanged {
            device,
            state: ConnectionState::Disconnected,
            error: error.clone(),
        });

        if let Some(tx) = disconnect {
            let result = match error {
                Some(e) => Err(e.into()),
                None => Ok(OperationOutput::Done),
            };
            let _ = tx.send(result);
        }
    }
}

/// Record discovered children and resolve the discovery that asked for them
fn complete_discovery<N>(
    state: &mut CentralState,
    device: &DeviceId,
    parent: Option<NativeHandle>,
    kind: OperationKind,
    result: Result<Vec<N>, TransportError>,
    describe: impl Fn(&N) -> (NativeHandle, Uuid, AttributeKind),
) {
    let Some(known) = state.devices.get_mut(device) else {
        debug!("{} result for unknown device {}", kind, device);
        return;
    };
    let parent = match parent {
        Some(handle) => match known.attributes.lookup_handle(handle) {
            Some(id) => Some(id),
            None => {
                debug!("{} result for unknown {} on {}", kind, handle, device);
                return;
            }
        },
        None => None,
    };

    let outcome = result.map(|items| {
        let nodes: Vec<AttributeNode> = items
            .iter()
            .map(|item| {
                let (handle, uuid, node_kind) = describe(item);
                known
                    .attributes
                    .insert_discovered(handle, uuid, node_kind, parent)
                    .clone()
            })
            .collect();
        debug!("{} on {} found {} attributes", kind, device, nodes.len());
        OperationOutput::Attributes(nodes)
    });

    let key = PendingKey::new(device.clone(), parent, kind);
    state.pending.resolve(&key, outcome.map_err(BridgeError::from));
}

/// Resolve an operation keyed by a native attribute handle
fn resolve_attribute_op(
    state: &mut CentralState,
    device: &DeviceId,
    handle: NativeHandle,
    kind: OperationKind,
    outcome: impl FnOnce() -> Result<OperationOutput, TransportError>,
) {
    let Some(id) = state.lookup(device, handle) else {
        debug!("{} callback for unknown {} on {}", kind, handle, device);
        return;
    };
    let key = PendingKey::new(device.clone(), Some(id), kind);
    state.pending.resolve(&key, outcome().map_err(BridgeError::from));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CentralCommand, RecordingCentralTransport};

    fn bridge() -> (
        CentralBridge<RecordingCentralTransport>,
        mpsc::UnboundedReceiver<CentralEvent>,
    ) {
        CentralBridge::new(Arc::new(RecordingCentralTransport::new()), BridgeConfig::default())
    }

    #[tokio::test]
    async fn test_unknown_device_is_rejected_locally() {
        let (bridge, _events) = bridge();
        let device = DeviceId::new("peer-A");

        assert_eq!(
            bridge.read_rssi(&device).await,
            Err(BridgeError::UnknownDevice { device: device.clone() })
        );
        assert_eq!(
            bridge.maximum_write_length(&device, WriteType::WithResponse).await,
            Err(BridgeError::UnknownDevice { device })
        );
        assert!(bridge.transport().commands().is_empty());
        assert_eq!(bridge.pending_operations().await, 0);
    }

    #[tokio::test]
    async fn test_connected_peripherals_become_known() {
        let (bridge, _events) = bridge();
        let device = DeviceId::new("peer-C");
        bridge.transport().set_connected_peripherals(vec![PeripheralInfo {
            device: device.clone(),
            name: Some("Thermometer".into()),
        }]);

        let found = bridge.connected_peripherals(&[]).await;
        assert_eq!(found.len(), 1);
        assert_eq!(bridge.connection_state(&device).await, Some(ConnectionState::Disconnected));
        assert_eq!(
            bridge.maximum_write_length(&device, WriteType::WithoutResponse).await,
            Ok(20)
        );
    }

    #[tokio::test]
    async fn test_app_settings_unsupported_by_default() {
        let (bridge, _events) = bridge();
        assert_eq!(
            bridge.show_app_settings(),
            Err(BridgeError::Unsupported {
                operation: "showAppSettings"
            })
        );

        bridge.transport().set_app_settings_supported(true);
        assert_eq!(bridge.show_app_settings(), Ok(()));
        assert_eq!(bridge.transport().commands(), vec![CentralCommand::ShowAppSettings]);
    }

    #[tokio::test]
    async fn test_discovery_is_forwarded_every_time() {
        let (bridge, mut events) = bridge();
        bridge.start_discovery(&[]).unwrap();
        assert_eq!(
            bridge.transport().commands(),
            vec![CentralCommand::StartScan {
                services: vec![],
                allow_duplicates: true
            }]
        );

        for rssi in [-70, -65, -60] {
            bridge
                .handle_callback(CentralCallback::Discovered {
                    device: DeviceId::new("peer-A"),
                    name: Some("Sensor".into()),
                    rssi,
                    advertisement: Default::default(),
                })
                .await;
        }
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 3);
    }
}
