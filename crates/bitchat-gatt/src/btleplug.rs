//! Native central transport backed by btleplug
//!
//! btleplug exposes an async API, while [`CentralTransport`] submissions are
//! synchronous. Each submission is therefore spawned onto the runtime captured
//! at construction, and its outcome is reported as a [`CentralCallback`] on the
//! channel the bridge drains. Adapter events (discovery, disconnects) are
//! pumped into the same channel.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ::btleplug::api::{
    Central, CentralEvent as AdapterEvent, Characteristic, Descriptor, Manager as _, Peripheral as _,
    ScanFilter, Service, WriteType as BtleWriteType,
};
use ::btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::attribute::NativeHandle;
use crate::central::{
    CentralCallback, CentralTransport, NativeCharacteristic, NativeDescriptor, NativeService, PeripheralInfo,
};
use crate::error::TransportError;
use crate::peer::DeviceId;
use crate::protocol::{Advertisement, CharacteristicProperties, ManufacturerData, RadioState, WriteType};

/// Conservative payload size for writes without response
const WRITE_WITHOUT_RESPONSE_LENGTH: usize = 244;

/// Largest attribute value a write with response may carry
const WRITE_WITH_RESPONSE_LENGTH: usize = 512;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn transport_error(error: ::btleplug::Error) -> TransportError {
    let code = match &error {
        ::btleplug::Error::PermissionDenied => 1,
        ::btleplug::Error::DeviceNotFound => 2,
        ::btleplug::Error::NotConnected => 3,
        ::btleplug::Error::NotSupported(_) => 4,
        ::btleplug::Error::TimedOut(_) => 5,
        _ => -1,
    };
    TransportError::new(code, error.to_string())
}

fn device_id(id: &PeripheralId) -> DeviceId {
    DeviceId::new(format!("{:?}", id))
}

// ----------------------------------------------------------------------------
// Native Handle Table
// ----------------------------------------------------------------------------

/// GATT object as btleplug knows it
#[derive(Debug, Clone)]
enum NativeObject {
    Service(Service),
    Characteristic(Characteristic),
    Descriptor(Descriptor),
}

/// Stable key of a btleplug object on one device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ObjectKey {
    Service(Uuid),
    Characteristic { service: Uuid, uuid: Uuid },
    Descriptor { service: Uuid, characteristic: Uuid, uuid: Uuid },
}

impl NativeObject {
    fn key(&self) -> ObjectKey {
        match self {
            NativeObject::Service(s) => ObjectKey::Service(s.uuid),
            NativeObject::Characteristic(c) => ObjectKey::Characteristic {
                service: c.service_uuid,
                uuid: c.uuid,
            },
            NativeObject::Descriptor(d) => ObjectKey::Descriptor {
                service: d.service_uuid,
                characteristic: d.characteristic_uuid,
                uuid: d.uuid,
            },
        }
    }
}

/// Mints one handle per object per device and keeps it across rediscovery
#[derive(Debug, Default)]
struct HandleTable {
    next: u64,
    by_key: HashMap<(DeviceId, ObjectKey), NativeHandle>,
    objects: HashMap<NativeHandle, (DeviceId, NativeObject)>,
}

impl HandleTable {
    fn mint(&mut self, device: &DeviceId, object: NativeObject) -> NativeHandle {
        let key = (device.clone(), object.key());
        let handle = match self.by_key.get(&key) {
            Some(handle) => *handle,
            None => {
                self.next += 1;
                let handle = NativeHandle::new(self.next);
                self.by_key.insert(key, handle);
                handle
            }
        };
        // refresh, btleplug hands out new snapshots on every discovery
        self.objects.insert(handle, (device.clone(), object));
        handle
    }

    fn object(&self, device: &DeviceId, handle: NativeHandle) -> Option<&NativeObject> {
        self.objects
            .get(&handle)
            .filter(|(owner, _)| owner == device)
            .map(|(_, object)| object)
    }

    fn characteristic_by_uuid(&self, device: &DeviceId, uuid: Uuid) -> Option<NativeHandle> {
        self.by_key.iter().find_map(|((owner, key), handle)| match key {
            ObjectKey::Characteristic { uuid: c, .. } if owner == device && *c == uuid => Some(*handle),
            _ => None,
        })
    }
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Known {
    peripherals: HashMap<DeviceId, Peripheral>,
    names: HashMap<DeviceId, String>,
    advertised_services: HashMap<DeviceId, Vec<Uuid>>,
    connected: HashSet<DeviceId>,
    handles: HandleTable,
    forwarders: HashMap<DeviceId, JoinHandle<()>>,
}

impl Known {
    /// Whether notifications from `device` are already being forwarded
    fn forwarding(&self, device: &DeviceId) -> bool {
        self.forwarders
            .get(device)
            .is_some_and(|task| !task.is_finished())
    }
}

/// [`CentralTransport`] over the first btleplug adapter
///
/// The adapter event stream carries no power or authorization changes, so
/// the radio is reported as [`RadioState::PoweredOn`] once the adapter has
/// been opened. A radio that is switched off later shows up as failing
/// submissions and dropped links rather than as a state change.
pub struct BtleplugCentral {
    adapter: Adapter,
    runtime: Handle,
    callbacks: mpsc::Sender<CentralCallback>,
    known: Arc<Mutex<Known>>,
}

impl BtleplugCentral {
    /// Open the first adapter and start pumping its events into `callbacks`
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(callbacks: mpsc::Sender<CentralCallback>) -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(transport_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(transport_error)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::new(2, "No BLE adapters available"))?;
        info!("BLE adapter initialized");

        let transport = Self {
            adapter,
            runtime: Handle::current(),
            callbacks,
            known: Arc::new(Mutex::new(Known::default())),
        };
        transport.spawn_event_pump().await?;
        Ok(transport)
    }

    async fn spawn_event_pump(&self) -> Result<(), TransportError> {
        let mut events = self.adapter.events().await.map_err(transport_error)?;
        let adapter = self.adapter.clone();
        let known = self.known.clone();
        let callbacks = self.callbacks.clone();

        self.runtime.spawn(async move {
            if callbacks
                .send(CentralCallback::StateUpdated(RadioState::PoweredOn))
                .await
                .is_err()
            {
                return;
            }
            while let Some(event) = events.next().await {
                let callback = match event {
                    AdapterEvent::DeviceDiscovered(id) | AdapterEvent::DeviceUpdated(id) => {
                        discovered(&adapter, &known, &id).await
                    }
                    AdapterEvent::DeviceConnected(id) => {
                        lock(&known).connected.insert(device_id(&id));
                        None
                    }
                    AdapterEvent::DeviceDisconnected(id) => {
                        let device = device_id(&id);
                        lock(&known).connected.remove(&device);
                        Some(CentralCallback::Disconnected { device, error: None })
                    }
                    _ => None,
                };
                if let Some(callback) = callback {
                    if callbacks.send(callback).await.is_err() {
                        debug!("Central callback receiver dropped, stopping adapter event pump");
                        break;
                    }
                }
            }
            debug!("Adapter event stream ended");
        });
        Ok(())
    }

    fn peripheral(&self, device: &DeviceId) -> Result<Peripheral, TransportError> {
        lock(&self.known)
            .peripherals
            .get(device)
            .cloned()
            .ok_or_else(|| TransportError::new(2, format!("Peripheral {} not found", device)))
    }

    fn object(&self, device: &DeviceId, handle: NativeHandle) -> Result<NativeObject, TransportError> {
        lock(&self.known)
            .handles
            .object(device, handle)
            .cloned()
            .ok_or_else(|| TransportError::new(2, format!("{} not found on {}", handle, device)))
    }

    fn characteristic(&self, device: &DeviceId, handle: NativeHandle) -> Result<Characteristic, TransportError> {
        match self.object(device, handle)? {
            NativeObject::Characteristic(c) => Ok(c),
            _ => Err(TransportError::new(2, format!("{} is not a characteristic", handle))),
        }
    }

    fn descriptor(&self, device: &DeviceId, handle: NativeHandle) -> Result<Descriptor, TransportError> {
        match self.object(device, handle)? {
            NativeObject::Descriptor(d) => Ok(d),
            _ => Err(TransportError::new(2, format!("{} is not a descriptor", handle))),
        }
    }

    /// Run `operation` on the runtime and report its callback
    fn report<F>(&self, operation: F)
    where
        F: Future<Output = CentralCallback> + Send + 'static,
    {
        let callbacks = self.callbacks.clone();
        self.runtime.spawn(async move {
            let callback = operation.await;
            if callbacks.send(callback).await.is_err() {
                debug!("Central callback receiver dropped");
            }
        });
    }
}

async fn discovered(adapter: &Adapter, known: &Mutex<Known>, id: &PeripheralId) -> Option<CentralCallback> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let device = device_id(id);

    let mut advertisement = Advertisement::new();
    advertisement.name = properties.local_name.clone();
    for uuid in &properties.services {
        advertisement = advertisement.with_service_uuid(*uuid);
    }
    advertisement.service_data = properties.service_data.clone();
    advertisement.manufacturer_data = properties
        .manufacturer_data
        .iter()
        .next()
        .map(|(company_id, data)| ManufacturerData {
            company_id: *company_id,
            data: data.clone(),
        });

    {
        let mut known = lock(known);
        known.peripherals.insert(device.clone(), peripheral);
        known
            .advertised_services
            .insert(device.clone(), properties.services.clone());
        if let Some(name) = &properties.local_name {
            known.names.insert(device.clone(), name.clone());
        }
    }

    Some(CentralCallback::Discovered {
        device,
        name: properties.local_name,
        rssi: properties.rssi.unwrap_or_default(),
        advertisement,
    })
}

impl CentralTransport for BtleplugCentral {
    /// Always `PoweredOn`, see [`BtleplugCentral`]
    fn state(&self) -> RadioState {
        RadioState::PoweredOn
    }

    fn start_scan(&self, services: &[Uuid], _allow_duplicates: bool) -> Result<(), TransportError> {
        // btleplug reports every advertisement as a device update
        let adapter = self.adapter.clone();
        let filter = ScanFilter {
            services: services.to_vec(),
        };
        self.runtime.spawn(async move {
            if let Err(e) = adapter.start_scan(filter).await {
                error!("Failed to start BLE scan: {}", e);
            }
        });
        Ok(())
    }

    fn stop_scan(&self) {
        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop BLE scan: {}", e);
            }
        });
    }

    fn connected_peripherals(&self, services: &[Uuid]) -> Vec<PeripheralInfo> {
        let known = lock(&self.known);
        known
            .connected
            .iter()
            .filter(|device| {
                services.is_empty()
                    || known
                        .advertised_services
                        .get(*device)
                        .map(|advertised| advertised.iter().any(|uuid| services.contains(uuid)))
                        .unwrap_or(false)
            })
            .map(|device| PeripheralInfo {
                device: device.clone(),
                name: known.names.get(device).cloned(),
            })
            .collect()
    }

    fn connect(&self, device: &DeviceId) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device)?;
        let device = device.clone();
        let callbacks = self.callbacks.clone();
        let forward = BtleplugNotifications {
            known: self.known.clone(),
            callbacks: self.callbacks.clone(),
            runtime: self.runtime.clone(),
        };
        self.runtime.spawn(async move {
            let callback = match peripheral.connect().await {
                Ok(()) => {
                    forward.start(device.clone(), peripheral.clone());
                    CentralCallback::Connected { device }
                }
                Err(e) => CentralCallback::ConnectFailed {
                    device,
                    error: transport_error(e),
                },
            };
            if callbacks.send(callback).await.is_err() {
                debug!("Central callback receiver dropped");
            }
        });
        Ok(())
    }

    fn cancel_connection(&self, device: &DeviceId) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device)?;
        let device = device.clone();
        let callbacks = self.callbacks.clone();
        self.runtime.spawn(async move {
            // link teardown is reported by the adapter event stream
            if let Err(e) = peripheral.disconnect().await {
                error!("Failed to disconnect from {}: {}", device, e);
                let callback = CentralCallback::DisconnectFailed {
                    device,
                    error: transport_error(e),
                };
                let _ = callbacks.send(callback).await;
            }
        });
        Ok(())
    }

    fn discover_services(&self, device: &DeviceId) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device)?;
        let known = self.known.clone();
        let device = device.clone();
        self.report(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => {
                    let mut known = lock(&known);
                    Ok(peripheral
                        .services()
                        .into_iter()
                        .map(|service| NativeService {
                            uuid: service.uuid,
                            primary: service.primary,
                            handle: known.handles.mint(&device, NativeObject::Service(service)),
                        })
                        .collect())
                }
                Err(e) => Err(transport_error(e)),
            };
            CentralCallback::ServicesDiscovered { device, result }
        });
        Ok(())
    }

    fn discover_included_services(&self, device: &DeviceId, service: NativeHandle) -> Result<(), TransportError> {
        self.object(device, service)?;
        // not exposed by btleplug
        let device = device.clone();
        self.report(async move {
            CentralCallback::IncludedServicesDiscovered {
                device,
                service,
                result: Ok(Vec::new()),
            }
        });
        Ok(())
    }

    fn discover_characteristics(&self, device: &DeviceId, service: NativeHandle) -> Result<(), TransportError> {
        let NativeObject::Service(native) = self.object(device, service)? else {
            return Err(TransportError::new(2, format!("{} is not a service", service)));
        };
        let characteristics = {
            let mut known = lock(&self.known);
            native
                .characteristics
                .into_iter()
                .map(|characteristic| NativeCharacteristic {
                    uuid: characteristic.uuid,
                    properties: CharacteristicProperties::from_bits_truncate(u16::from(characteristic.properties.bits())),
                    handle: known
                        .handles
                        .mint(device, NativeObject::Characteristic(characteristic)),
                })
                .collect()
        };
        let device = device.clone();
        self.report(async move {
            CentralCallback::CharacteristicsDiscovered {
                device,
                service,
                result: Ok(characteristics),
            }
        });
        Ok(())
    }

    fn discover_descriptors(&self, device: &DeviceId, characteristic: NativeHandle) -> Result<(), TransportError> {
        let native = self.characteristic(device, characteristic)?;
        let descriptors = {
            let mut known = lock(&self.known);
            native
                .descriptors
                .into_iter()
                .map(|descriptor| NativeDescriptor {
                    uuid: descriptor.uuid,
                    handle: known.handles.mint(device, NativeObject::Descriptor(descriptor)),
                })
                .collect()
        };
        let device = device.clone();
        self.report(async move {
            CentralCallback::DescriptorsDiscovered {
                device,
                characteristic,
                result: Ok(descriptors),
            }
        });
        Ok(())
    }

    fn read_characteristic(&self, device: &DeviceId, characteristic: NativeHandle) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device)?;
        let native = self.characteristic(device, characteristic)?;
        let device = device.clone();
        self.report(async move {
            let result = peripheral.read(&native).await.map_err(transport_error);
            CentralCallback::CharacteristicValueUpdated {
                device,
                characteristic,
                result,
            }
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        device: &DeviceId,
        characteristic: NativeHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device)?;
        let native = self.characteristic(device, characteristic)?;
        let value = value.to_vec();
        let device = device.clone();

        match write_type {
            WriteType::WithoutResponse => {
                self.runtime.spawn(async move {
                    if let Err(e) = peripheral.write(&native, &value, BtleWriteType::WithoutResponse).await {
                        warn!("Write without response to {} failed: {}", device, e);
                    }
                });
            }
            WriteType::WithResponse => self.report(async move {
                let result = peripheral
                    .write(&native, &value, BtleWriteType::WithResponse)
                    .await
                    .map_err(transport_error);
                CentralCallback::CharacteristicWritten {
                    device,
                    characteristic,
                    result,
                }
            }),
        }
        Ok(())
    }

    fn set_notify(&self, device: &DeviceId, characteristic: NativeHandle, enabled: bool) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device)?;
        let native = self.characteristic(device, characteristic)?;
        let device = device.clone();
        self.report(async move {
            let result = if enabled {
                peripheral.subscribe(&native).await
            } else {
                peripheral.unsubscribe(&native).await
            };
            CentralCallback::NotificationStateUpdated {
                device,
                characteristic,
                result: result.map(|_| enabled).map_err(transport_error),
            }
        });
        Ok(())
    }

    fn read_descriptor(&self, device: &DeviceId, descriptor: NativeHandle) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device)?;
        let native = self.descriptor(device, descriptor)?;
        let device = device.clone();
        self.report(async move {
            let result = peripheral.read_descriptor(&native).await.map_err(transport_error);
            CentralCallback::DescriptorValueUpdated {
                device,
                descriptor,
                result,
            }
        });
        Ok(())
    }

    fn write_descriptor(&self, device: &DeviceId, descriptor: NativeHandle, value: &[u8]) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device)?;
        let native = self.descriptor(device, descriptor)?;
        let value = value.to_vec();
        let device = device.clone();
        self.report(async move {
            let result = peripheral
                .write_descriptor(&native, &value)
                .await
                .map_err(transport_error);
            CentralCallback::DescriptorWritten {
                device,
                descriptor,
                result,
            }
        });
        Ok(())
    }

    fn read_rssi(&self, device: &DeviceId) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device)?;
        let device = device.clone();
        self.report(async move {
            let result = match peripheral.properties().await {
                Ok(Some(properties)) => properties
                    .rssi
                    .ok_or_else(|| TransportError::new(4, "RSSI not reported")),
                Ok(None) => Err(TransportError::new(2, "No peripheral properties")),
                Err(e) => Err(transport_error(e)),
            };
            CentralCallback::RssiRead { device, result }
        });
        Ok(())
    }

    fn maximum_write_length(&self, _device: &DeviceId, write_type: WriteType) -> usize {
        match write_type {
            WriteType::WithResponse => WRITE_WITH_RESPONSE_LENGTH,
            WriteType::WithoutResponse => WRITE_WITHOUT_RESPONSE_LENGTH,
        }
    }
}

/// Everything a connect task needs to start forwarding notifications
struct BtleplugNotifications {
    known: Arc<Mutex<Known>>,
    callbacks: mpsc::Sender<CentralCallback>,
    runtime: Handle,
}

impl BtleplugNotifications {
    /// Spawn the forwarder for `device` unless one is still running
    ///
    /// Some backends keep the notification stream alive across a reconnect.
    fn start(self, device: DeviceId, peripheral: Peripheral) {
        let known = self.known.clone();
        let mut guard = lock(&known);
        if guard.forwarding(&device) {
            debug!("Notifications from {} are already forwarded", device);
            return;
        }
        let task = self.runtime.spawn(forward_notifications(
            self.known,
            self.callbacks,
            device.clone(),
            peripheral,
        ));
        guard.forwarders.insert(device, task);
    }
}

async fn forward_notifications(
    known: Arc<Mutex<Known>>,
    callbacks: mpsc::Sender<CentralCallback>,
    device: DeviceId,
    peripheral: Peripheral,
) {
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to get notifications stream for {}: {}", device, e);
            return;
        }
    };
    while let Some(notification) = notifications.next().await {
        let handle = lock(&known)
            .handles
            .characteristic_by_uuid(&device, notification.uuid);
        let Some(characteristic) = handle else {
            debug!("Notification from {} for undiscovered {}", device, notification.uuid);
            continue;
        };
        let callback = CentralCallback::CharacteristicValueUpdated {
            device: device.clone(),
            characteristic,
            result: Ok(notification.value),
        };
        if callbacks.send(callback).await.is_err() {
            break;
        }
    }
    debug!("Notification handler for {} ended", device);
}
