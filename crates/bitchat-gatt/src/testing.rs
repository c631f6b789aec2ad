//! Recording transports for testing
//!
//! Both transports accept every submission (unless told to reject the next
//! one), remember what was submitted, and never produce callbacks on their
//! own. Tests feed callbacks to the bridge directly to play the native stack.

use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::attribute::{AttributeId, LocalService, NativeHandle};
use crate::central::{CentralTransport, PeripheralInfo};
use crate::error::TransportError;
use crate::peer::{CentralId, DeviceId};
use crate::peripheral::PeripheralTransport;
use crate::protocol::{Advertisement, AttError, RadioState, WriteType};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Central Transport
// ----------------------------------------------------------------------------

/// Submission recorded by [`RecordingCentralTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralCommand {
    StartScan {
        services: Vec<Uuid>,
        allow_duplicates: bool,
    },
    StopScan,
    Connect(DeviceId),
    CancelConnection(DeviceId),
    DiscoverServices(DeviceId),
    DiscoverIncludedServices(DeviceId, NativeHandle),
    DiscoverCharacteristics(DeviceId, NativeHandle),
    DiscoverDescriptors(DeviceId, NativeHandle),
    ReadCharacteristic(DeviceId, NativeHandle),
    WriteCharacteristic {
        device: DeviceId,
        characteristic: NativeHandle,
        value: Vec<u8>,
        write_type: WriteType,
    },
    SetNotify {
        device: DeviceId,
        characteristic: NativeHandle,
        enabled: bool,
    },
    ReadDescriptor(DeviceId, NativeHandle),
    WriteDescriptor {
        device: DeviceId,
        descriptor: NativeHandle,
        value: Vec<u8>,
    },
    ReadRssi(DeviceId),
    ShowAppSettings,
}

#[derive(Debug)]
struct CentralInner {
    state: RadioState,
    commands: Vec<CentralCommand>,
    reject_next: Option<TransportError>,
    connected: Vec<PeripheralInfo>,
    app_settings: bool,
}

/// In-memory central stack that records submissions
#[derive(Debug)]
pub struct RecordingCentralTransport {
    inner: Mutex<CentralInner>,
}

impl Default for RecordingCentralTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingCentralTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CentralInner {
                state: RadioState::PoweredOn,
                commands: Vec::new(),
                reject_next: None,
                connected: Vec::new(),
                app_settings: false,
            }),
        }
    }

    pub fn set_state(&self, state: RadioState) {
        lock(&self.inner).state = state;
    }

    /// Reject the next fallible submission with `error`
    pub fn fail_next_submission(&self, error: TransportError) {
        lock(&self.inner).reject_next = Some(error);
    }

    pub fn set_connected_peripherals(&self, peripherals: Vec<PeripheralInfo>) {
        lock(&self.inner).connected = peripherals;
    }

    pub fn set_app_settings_supported(&self, supported: bool) {
        lock(&self.inner).app_settings = supported;
    }

    /// Every submission so far, oldest first
    pub fn commands(&self) -> Vec<CentralCommand> {
        lock(&self.inner).commands.clone()
    }

    pub fn clear_commands(&self) {
        lock(&self.inner).commands.clear();
    }

    fn record(&self, command: CentralCommand) {
        lock(&self.inner).commands.push(command);
    }

    fn submit(&self, command: CentralCommand) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        if let Some(error) = inner.reject_next.take() {
            return Err(error);
        }
        inner.commands.push(command);
        Ok(())
    }
}

impl CentralTransport for RecordingCentralTransport {
    fn state(&self) -> RadioState {
        lock(&self.inner).state
    }

    fn start_scan(&self, services: &[Uuid], allow_duplicates: bool) -> Result<(), TransportError> {
        self.submit(CentralCommand::StartScan {
            services: services.to_vec(),
            allow_duplicates,
        })
    }

    fn stop_scan(&self) {
        self.record(CentralCommand::StopScan);
    }

    fn connected_peripherals(&self, _services: &[Uuid]) -> Vec<PeripheralInfo> {
        lock(&self.inner).connected.clone()
    }

    fn connect(&self, device: &DeviceId) -> Result<(), TransportError> {
        self.submit(CentralCommand::Connect(device.clone()))
    }

    fn cancel_connection(&self, device: &DeviceId) -> Result<(), TransportError> {
        self.submit(CentralCommand::CancelConnection(device.clone()))
    }

    fn discover_services(&self, device: &DeviceId) -> Result<(), TransportError> {
        self.submit(CentralCommand::DiscoverServices(device.clone()))
    }

    fn discover_included_services(&self, device: &DeviceId, service: NativeHandle) -> Result<(), TransportError> {
        self.submit(CentralCommand::DiscoverIncludedServices(device.clone(), service))
    }

    fn discover_characteristics(&self, device: &DeviceId, service: NativeHandle) -> Result<(), TransportError> {
        self.submit(CentralCommand::DiscoverCharacteristics(device.clone(), service))
    }

    fn discover_descriptors(&self, device: &DeviceId, characteristic: NativeHandle) -> Result<(), TransportError> {
        self.submit(CentralCommand::DiscoverDescriptors(device.clone(), characteristic))
    }

    fn read_characteristic(&self, device: &DeviceId, characteristic: NativeHandle) -> Result<(), TransportError> {
        self.submit(CentralCommand::ReadCharacteristic(device.clone(), characteristic))
    }

    fn write_characteristic(
        &self,
        device: &DeviceId,
        characteristic: NativeHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        self.submit(CentralCommand::WriteCharacteristic {
            device: device.clone(),
            characteristic,
            value: value.to_vec(),
            write_type,
        })
    }

    fn set_notify(&self, device: &DeviceId, characteristic: NativeHandle, enabled: bool) -> Result<(), TransportError> {
        self.submit(CentralCommand::SetNotify {
            device: device.clone(),
            characteristic,
            enabled,
        })
    }

    fn read_descriptor(&self, device: &DeviceId, descriptor: NativeHandle) -> Result<(), TransportError> {
        self.submit(CentralCommand::ReadDescriptor(device.clone(), descriptor))
    }

    fn write_descriptor(&self, device: &DeviceId, descriptor: NativeHandle, value: &[u8]) -> Result<(), TransportError> {
        self.submit(CentralCommand::WriteDescriptor {
            device: device.clone(),
            descriptor,
            value: value.to_vec(),
        })
    }

    fn read_rssi(&self, device: &DeviceId) -> Result<(), TransportError> {
        self.submit(CentralCommand::ReadRssi(device.clone()))
    }

    fn maximum_write_length(&self, _device: &DeviceId, write_type: WriteType) -> usize {
        match write_type {
            WriteType::WithResponse => 512,
            WriteType::WithoutResponse => 20,
        }
    }

    fn supports_app_settings(&self) -> bool {
        lock(&self.inner).app_settings
    }

    fn show_app_settings(&self) -> Result<(), TransportError> {
        self.submit(CentralCommand::ShowAppSettings)
    }
}

// ----------------------------------------------------------------------------
// Peripheral Transport
// ----------------------------------------------------------------------------

/// Submission recorded by [`RecordingPeripheralTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralCommand {
    AddService(LocalService),
    RemoveService(AttributeId),
    RemoveAllServices,
    StartAdvertising(Advertisement),
    StopAdvertising,
    Respond {
        request: NativeHandle,
        value: Option<Vec<u8>>,
        result: AttError,
    },
    UpdateValue {
        characteristic: AttributeId,
        value: Vec<u8>,
        centrals: Option<Vec<CentralId>>,
    },
    ShowAppSettings,
}

#[derive(Debug)]
struct PeripheralInner {
    state: RadioState,
    advertising: bool,
    accept_updates: bool,
    commands: Vec<PeripheralCommand>,
    reject_next: Option<TransportError>,
    app_settings: bool,
}

/// In-memory peripheral stack that records submissions
#[derive(Debug)]
pub struct RecordingPeripheralTransport {
    inner: Mutex<PeripheralInner>,
}

impl Default for RecordingPeripheralTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingPeripheralTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PeripheralInner {
                state: RadioState::PoweredOn,
                advertising: false,
                accept_updates: true,
                commands: Vec::new(),
                reject_next: None,
                app_settings: false,
            }),
        }
    }

    pub fn set_state(&self, state: RadioState) {
        lock(&self.inner).state = state;
    }

    /// Make `update_value` report a full transmit queue
    pub fn set_accept_updates(&self, accept: bool) {
        lock(&self.inner).accept_updates = accept;
    }

    /// Reject the next fallible submission with `error`
    pub fn fail_next_submission(&self, error: TransportError) {
        lock(&self.inner).reject_next = Some(error);
    }

    pub fn set_app_settings_supported(&self, supported: bool) {
        lock(&self.inner).app_settings = supported;
    }

    pub fn commands(&self) -> Vec<PeripheralCommand> {
        lock(&self.inner).commands.clone()
    }

    pub fn clear_commands(&self) {
        lock(&self.inner).commands.clear();
    }

    /// Responses sent so far, in order
    pub fn responses(&self) -> Vec<(NativeHandle, Option<Vec<u8>>, AttError)> {
        lock(&self.inner)
            .commands
            .iter()
            .filter_map(|command| match command {
                PeripheralCommand::Respond { request, value, result } => Some((*request, value.clone(), *result)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, command: PeripheralCommand) {
        lock(&self.inner).commands.push(command);
    }

    fn submit(&self, command: PeripheralCommand) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        if let Some(error) = inner.reject_next.take() {
            return Err(error);
        }
        inner.commands.push(command);
        Ok(())
    }
}

impl PeripheralTransport for RecordingPeripheralTransport {
    fn state(&self) -> RadioState {
        lock(&self.inner).state
    }

    fn is_advertising(&self) -> bool {
        lock(&self.inner).advertising
    }

    fn add_service(&self, service: &LocalService) -> Result<(), TransportError> {
        self.submit(PeripheralCommand::AddService(service.clone()))
    }

    fn remove_service(&self, service: AttributeId) {
        self.record(PeripheralCommand::RemoveService(service));
    }

    fn remove_all_services(&self) {
        self.record(PeripheralCommand::RemoveAllServices);
    }

    fn start_advertising(&self, advertisement: &Advertisement) -> Result<(), TransportError> {
        self.submit(PeripheralCommand::StartAdvertising(advertisement.clone()))?;
        lock(&self.inner).advertising = true;
        Ok(())
    }

    fn stop_advertising(&self) {
        let mut inner = lock(&self.inner);
        inner.advertising = false;
        inner.commands.push(PeripheralCommand::StopAdvertising);
    }

    fn respond(&self, request: NativeHandle, value: Option<&[u8]>, result: AttError) {
        self.record(PeripheralCommand::Respond {
            request,
            value: value.map(<[u8]>::to_vec),
            result,
        });
    }

    fn update_value(&self, characteristic: AttributeId, value: &[u8], centrals: Option<&[CentralId]>) -> bool {
        let mut inner = lock(&self.inner);
        if !inner.accept_updates {
            return false;
        }
        inner.commands.push(PeripheralCommand::UpdateValue {
            characteristic,
            value: value.to_vec(),
            centrals: centrals.map(<[CentralId]>::to_vec),
        });
        true
    }

    fn supports_app_settings(&self) -> bool {
        lock(&self.inner).app_settings
    }

    fn show_app_settings(&self) -> Result<(), TransportError> {
        self.submit(PeripheralCommand::ShowAppSettings)
    }
}
