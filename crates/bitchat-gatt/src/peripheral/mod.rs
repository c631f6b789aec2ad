//! Peripheral-role bridge
//!
//! Owns the local attribute tree, drives advertising and serves ATT requests
//! and subscriptions from remote centrals. Service registration and
//! advertising resolve through the pending-operation registry; ATT requests
//! are parked in a request table until the application responds.

pub mod events;
pub mod request;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

use crate::attribute::{AttributeId, AttributeNode, AttributeRegistry, LocalService, ServiceDefinition};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult, CancelReason};
use crate::peer::{Central, CentralId};
use crate::pending::{OperationKind, OperationOutput, PeerRef, PendingKey, PendingOperations};
use crate::protocol::{Advertisement, AttError, RadioState};

use request::RequestTable;

pub use events::PeripheralEvent;
pub use request::{AttRequest, RequestId};
pub use transport::{NativeAttRequest, PeripheralCallback, PeripheralTransport};

// ----------------------------------------------------------------------------
// Role State
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct PeripheralState {
    attributes: AttributeRegistry,
    centrals: HashMap<CentralId, Central>,
    requests: RequestTable,
    pending: PendingOperations,
}

impl PeripheralState {
    fn record_central(&mut self, id: &CentralId, maximum_update_length: usize) {
        match self.centrals.get_mut(id) {
            Some(central) => central.maximum_update_length = maximum_update_length,
            None => {
                debug!("Tracking central {}", id);
                self.centrals
                    .insert(id.clone(), Central::new(id.clone(), maximum_update_length));
            }
        }
    }

    /// Whether an ATT request may target `id`
    fn is_servable(&self, id: AttributeId) -> bool {
        self.attributes
            .get(id)
            .map(|node| node.is_characteristic() || node.is_descriptor())
            .unwrap_or(false)
    }
}

fn add_service_key(service: AttributeId) -> PendingKey {
    PendingKey::new(PeerRef::LocalPeripheral, Some(service), OperationKind::AddService)
}

fn advertising_key() -> PendingKey {
    PendingKey::peer_wide(PeerRef::LocalPeripheral, OperationKind::StartAdvertising)
}

// ----------------------------------------------------------------------------
// Bridge
// ----------------------------------------------------------------------------

/// Request/response front end over a native peripheral stack
pub struct PeripheralBridge<T: PeripheralTransport> {
    transport: Arc<T>,
    config: BridgeConfig,
    state: Mutex<PeripheralState>,
    events: mpsc::UnboundedSender<PeripheralEvent>,
}

impl<T: PeripheralTransport> PeripheralBridge<T> {
    /// Create a bridge over `transport`, returning it with its event stream
    pub fn new(transport: Arc<T>, config: BridgeConfig) -> (Self, mpsc::UnboundedReceiver<PeripheralEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let state = PeripheralState {
            attributes: AttributeRegistry::new(),
            centrals: HashMap::new(),
            requests: RequestTable::new(),
            pending: PendingOperations::new(),
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
    pub fn callback_channel(&self) -> (mpsc::Sender<PeripheralCallback>, mpsc::Receiver<PeripheralCallback>) {
        mpsc::channel(self.config.callback_channel_capacity)
    }

    /// Process callbacks in arrival order until every sender is gone
    pub async fn run(&self, mut callbacks: mpsc::Receiver<PeripheralCallback>) {
        while let Some(callback) = callbacks.recv().await {
            self.handle_callback(callback).await;
        }
        debug!("Peripheral callback channel closed");
    }

    fn emit(&self, event: PeripheralEvent) {
        if self.events.send(event).is_err() {
            trace!("Peripheral event dropped, no receiver");
        }
    }

    // ------------------------------------------------------------------------
    // Role Lifecycle
    // ------------------------------------------------------------------------

    /// Reset the role: stop advertising, drop every service, forget every
    /// central and request, cancel pending registrations
    pub async fn initialize(&self) {
        let mut state = self.state.lock().await;
        if self.transport.is_advertising() {
            self.transport.stop_advertising();
        }
        self.transport.remove_all_services();

        let cancelled = state.pending.cancel_all(CancelReason::Reset);
        let attributes = state.attributes.len();
        state.attributes.clear();
        state.centrals.clear();
        state.requests.clear();
        info!(
            "Peripheral role reset: {} attributes dropped, {} operations cancelled",
            attributes, cancelled
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
    // Services
    // ------------------------------------------------------------------------

    /// Register a service tree and publish it
    ///
    /// Returns the tree with every node's identity once the transport has
    /// confirmed it. A rejected tree leaves no identities behind.
    pub async fn add_service(&self, definition: &ServiceDefinition) -> BridgeResult<LocalService> {
        let (service, completion) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let service = state.attributes.register_service(definition)?;
            let submitted = state
                .pending
                .submit(add_service_key(service.id), || self.transport.add_service(&service));
            match submitted {
                Ok(completion) => (service, completion),
                Err(e) => {
                    let _ = state.attributes.unregister_service(service.id);
                    return Err(e);
                }
            }
        };
        debug!("Adding service {} ({})", service.id, service.uuid);
        completion.wait().await?;
        info!("Service {} ({}) published", service.id, service.uuid);
        Ok(service)
    }

    /// Withdraw a registered service and every identity it added
    pub async fn remove_service(&self, service: AttributeId) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        let removed = state.attributes.unregister_service(service)?;
        if state.pending.resolve(
            &add_service_key(service),
            Err(BridgeError::Cancelled(CancelReason::ServiceRemoved)),
        ) {
            debug!("Cancelled pending registration of {}", service);
        }
        self.transport.remove_service(service);
        info!("Removed service {} ({})", service, removed.uuid);
        Ok(())
    }

    pub async fn remove_all_services(&self) {
        let mut state = self.state.lock().await;
        let services = state.attributes.root_services().len();
        state.attributes.clear();
        let cancelled = state.pending.resolve_kind(
            OperationKind::AddService,
            BridgeError::Cancelled(CancelReason::ServiceRemoved),
        );
        self.transport.remove_all_services();
        info!(
            "Removed all {} services ({} pending registrations cancelled)",
            services, cancelled
        );
    }

    /// Root identities of every registered service
    pub async fn services(&self) -> Vec<AttributeId> {
        self.state.lock().await.attributes.root_services()
    }

    /// Look up a registered attribute
    pub async fn attribute(&self, id: AttributeId) -> BridgeResult<AttributeNode> {
        let state = self.state.lock().await;
        Ok(state.attributes.resolve(id)?.clone())
    }

    // ------------------------------------------------------------------------
    // Advertising
    // ------------------------------------------------------------------------

    /// Start advertising; only one start may be in flight
    pub async fn start_advertising(&self, advertisement: &Advertisement) -> BridgeResult<()> {
        let completion = {
            let mut state = self.state.lock().await;
            state
                .pending
                .submit(advertising_key(), || self.transport.start_advertising(advertisement))?
        };
        completion.wait().await?;
        info!(
            "Advertising as {} with {} services",
            advertisement.name.as_deref().unwrap_or("<unnamed>"),
            advertisement.service_uuids.len()
        );
        Ok(())
    }

    pub fn stop_advertising(&self) {
        self.transport.stop_advertising();
        info!("Stopped advertising");
    }

    pub fn is_advertising(&self) -> bool {
        self.transport.is_advertising()
    }

    // ------------------------------------------------------------------------
    // Centrals, Requests and Updates
    // ------------------------------------------------------------------------

    /// Largest value `central` accepts in one notification or indication
    pub async fn maximum_notify_length(&self, central: &CentralId) -> BridgeResult<usize> {
        let state = self.state.lock().await;
        state
            .centrals
            .get(central)
            .map(|central| central.maximum_update_length)
            .ok_or_else(|| BridgeError::UnknownCentral {
                central: central.clone(),
            })
    }

    /// Answer an outstanding ATT request; each request is answered once
    pub async fn respond(&self, request: RequestId, value: Option<&[u8]>, result: AttError) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        let native = state
            .requests
            .take(request)
            .ok_or(BridgeError::UnknownRequest { id: request })?;
        if let Some(value) = value {
            trace!("Responding to request {}: {}", request, hex::encode(value));
        }
        self.transport.respond(native, value, result);
        debug!("Responded to request {} ({:?})", request, result);
        Ok(())
    }

    /// Number of ATT requests still waiting for a response
    pub async fn outstanding_requests(&self) -> usize {
        self.state.lock().await.requests.len()
    }

    /// Push a new characteristic value to subscribed centrals
    ///
    /// Returns `false` when the transport queue is full; retry after
    /// [`PeripheralEvent::ReadyToUpdateSubscribers`].
    pub async fn update_value(
        &self,
        characteristic: AttributeId,
        value: &[u8],
        centrals: Option<&[CentralId]>,
    ) -> BridgeResult<bool> {
        let state = self.state.lock().await;
        if let Some(unknown) = centrals
            .unwrap_or_default()
            .iter()
            .find(|central| !state.centrals.contains_key(*central))
        {
            return Err(BridgeError::UnknownCentral {
                central: unknown.clone(),
            });
        }
        state.attributes.resolve_characteristic(characteristic)?;

        let accepted = self.transport.update_value(characteristic, value, centrals);
        trace!(
            "Update of {} ({}): {}",
            characteristic,
            hex::encode(value),
            if accepted { "sent" } else { "queue full" }
        );
        Ok(accepted)
    }

    // ------------------------------------------------------------------------
    // Callback Handling
    // ------------------------------------------------------------------------

    /// Apply one transport callback
    pub async fn handle_callback(&self, callback: PeripheralCallback) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        match callback {
            PeripheralCallback::StateUpdated(radio) => {
                info!("Peripheral radio state: {}", radio);
                self.emit(PeripheralEvent::StateChanged(radio));
            }

            PeripheralCallback::ServiceAdded { service, result } => {
                if let Err(e) = &result {
                    warn!("Transport rejected service {}: {}", service, e);
                    if let Err(unregister) = state.attributes.unregister_service(service) {
                        debug!("Could not unregister rejected service {}: {}", service, unregister);
                    }
                }
                let outcome = result.map(|_| OperationOutput::Done).map_err(BridgeError::from);
                state.pending.resolve(&add_service_key(service), outcome);
            }

            PeripheralCallback::AdvertisingStarted { result } => {
                if let Err(e) = &result {
                    warn!("Failed to start advertising: {}", e);
                }
                let outcome = result.map(|_| OperationOutput::Done).map_err(BridgeError::from);
                state.pending.resolve(&advertising_key(), outcome);
            }

            PeripheralCallback::ReadRequest(native) => {
                state.record_central(&native.central, native.maximum_update_length);
                if !state.is_servable(native.attribute) {
                    debug!(
                        "Read from {} for unknown {}, answering attributeNotFound",
                        native.central, native.attribute
                    );
                    self.transport
                        .respond(native.handle, None, AttError::AttributeNotFound);
                    return;
                }
                let request = state.requests.insert(
                    native.handle,
                    native.central,
                    native.attribute,
                    native.offset,
                    None,
                );
                debug!("Read request {} for {}", request.id, request.attribute);
                self.emit(PeripheralEvent::ReadRequested(request));
            }

            PeripheralCallback::WriteRequests(batch) => {
                for native in &batch {
                    state.record_central(&native.central, native.maximum_update_length);
                }
                if let Some(unknown) = batch.iter().find(|native| !state.is_servable(native.attribute)) {
                    debug!(
                        "Write from {} for unknown {}, answering attributeNotFound",
                        unknown.central, unknown.attribute
                    );
                    self.transport
                        .respond(unknown.handle, None, AttError::AttributeNotFound);
                    return;
                }

                let requests: Vec<AttRequest> = batch
                    .into_iter()
                    .map(|native| {
                        if let Some(value) = &native.value {
                            trace!("Write to {}: {}", native.attribute, hex::encode(value));
                        }
                        state.requests.insert(
                            native.handle,
                            native.central,
                            native.attribute,
                            native.offset,
                            native.value,
                        )
                    })
                    .collect();
                debug!("Write batch of {} requests", requests.len());
                self.emit(PeripheralEvent::WriteRequested(requests));
            }

            PeripheralCallback::Subscribed {
                central,
                maximum_update_length,
                characteristic,
            } => {
                self.subscription_changed(state, central, maximum_update_length, characteristic, true);
            }

            PeripheralCallback::Unsubscribed {
                central,
                maximum_update_length,
                characteristic,
            } => {
                self.subscription_changed(state, central, maximum_update_length, characteristic, false);
            }

            PeripheralCallback::ReadyToUpdateSubscribers => {
                trace!("Ready to update subscribers");
                self.emit(PeripheralEvent::ReadyToUpdateSubscribers);
            }
        }
    }

    fn subscription_changed(
        &self,
        state: &mut PeripheralState,
        central: CentralId,
        maximum_update_length: usize,
        characteristic: AttributeId,
        enabled: bool,
    ) {
        state.record_central(&central, maximum_update_length);
        if state.attributes.resolve_characteristic(characteristic).is_err() {
            debug!("Subscription change for unknown {} from {}", characteristic, central);
            return;
        }
        info!(
            "Central {} {} {}",
            central,
            if enabled { "subscribed to" } else { "unsubscribed from" },
            characteristic
        );
        self.emit(PeripheralEvent::NotifyStateChanged {
            central,
            characteristic,
            enabled,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::CharacteristicDefinition;
    use crate::error::TransportError;
    use crate::protocol::{uuid_from_u16, AttributePermissions, CharacteristicProperties};
    use crate::testing::{PeripheralCommand, RecordingPeripheralTransport};

    fn bridge() -> (
        PeripheralBridge<RecordingPeripheralTransport>,
        mpsc::UnboundedReceiver<PeripheralEvent>,
    ) {
        PeripheralBridge::new(Arc::new(RecordingPeripheralTransport::new()), BridgeConfig::default())
    }

    fn battery_service() -> ServiceDefinition {
        ServiceDefinition::new(uuid_from_u16(0x180f)).with_characteristic(CharacteristicDefinition::new(
            uuid_from_u16(0x2a19),
            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            AttributePermissions::READABLE,
        ))
    }

    #[tokio::test]
    async fn test_rejected_submission_drops_tree() {
        let (bridge, _events) = bridge();
        bridge
            .transport()
            .fail_next_submission(TransportError::new(2, "busy"));

        let err = bridge.add_service(&battery_service()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert!(bridge.services().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_service() {
        let (bridge, _events) = bridge();
        let id = AttributeId::from_raw(u64::MAX);
        assert_eq!(
            bridge.remove_service(id).await,
            Err(BridgeError::UnknownAttribute { id })
        );
        assert!(!bridge
            .transport()
            .commands()
            .iter()
            .any(|c| matches!(c, PeripheralCommand::RemoveService(_))));
    }

    #[tokio::test]
    async fn test_unknown_central_is_rejected() {
        let (bridge, _events) = bridge();
        let central = CentralId::new("central-9");
        assert_eq!(
            bridge.maximum_notify_length(&central).await,
            Err(BridgeError::UnknownCentral {
                central: central.clone()
            })
        );
        assert_eq!(
            bridge
                .update_value(AttributeId::from_raw(1), &[1], Some(std::slice::from_ref(&central)))
                .await,
            Err(BridgeError::UnknownCentral { central })
        );
    }

    #[tokio::test]
    async fn test_respond_to_unknown_request() {
        let (bridge, _events) = bridge();
        let id = RequestId::from_raw(77);
        assert_eq!(
            bridge.respond(id, None, AttError::Success).await,
            Err(BridgeError::UnknownRequest { id })
        );
    }
}
