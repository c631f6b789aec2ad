//! Seam between the central bridge and a native central stack

use uuid::Uuid;

use crate::attribute::NativeHandle;
use crate::error::TransportError;
use crate::peer::DeviceId;
use crate::protocol::{Advertisement, CharacteristicProperties, RadioState, WriteType};

// ----------------------------------------------------------------------------
// Native Objects
// ----------------------------------------------------------------------------

/// Service reported by the native stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeService {
    pub handle: NativeHandle,
    pub uuid: Uuid,
    pub primary: bool,
}

/// Characteristic reported by the native stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCharacteristic {
    pub handle: NativeHandle,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// Descriptor reported by the native stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeDescriptor {
    pub handle: NativeHandle,
    pub uuid: Uuid,
}

/// A peripheral already connected at the system level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralInfo {
    pub device: DeviceId,
    pub name: Option<String>,
}

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// Submission side of a native central stack
///
/// Every method returns immediately. Terminal results arrive later as
/// [`CentralCallback`]s, except for write-without-response, which has none.
pub trait CentralTransport: Send + Sync {
    fn state(&self) -> RadioState;

    fn start_scan(&self, services: &[Uuid], allow_duplicates: bool) -> Result<(), TransportError>;

    fn stop_scan(&self);

    /// Peripherals connected at the system level that expose any of `services`
    fn connected_peripherals(&self, services: &[Uuid]) -> Vec<PeripheralInfo>;

    fn connect(&self, device: &DeviceId) -> Result<(), TransportError>;

    fn cancel_connection(&self, device: &DeviceId) -> Result<(), TransportError>;

    fn discover_services(&self, device: &DeviceId) -> Result<(), TransportError>;

    fn discover_included_services(
        &self,
        device: &DeviceId,
        service: NativeHandle,
    ) -> Result<(), TransportError>;

    fn discover_characteristics(
        &self,
        device: &DeviceId,
        service: NativeHandle,
    ) -> Result<(), TransportError>;

    fn discover_descriptors(
        &self,
        device: &DeviceId,
        characteristic: NativeHandle,
    ) -> Result<(), TransportError>;

    fn read_characteristic(
        &self,
        device: &DeviceId,
        characteristic: NativeHandle,
    ) -> Result<(), TransportError>;

    fn write_characteristic(
        &self,
        device: &DeviceId,
        characteristic: NativeHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError>;

    fn set_notify(
        &self,
        device: &DeviceId,
        characteristic: NativeHandle,
        enabled: bool,
    ) -> Result<(), TransportError>;

    fn read_descriptor(&self, device: &DeviceId, descriptor: NativeHandle) -> Result<(), TransportError>;

    fn write_descriptor(
        &self,
        device: &DeviceId,
        descriptor: NativeHandle,
        value: &[u8],
    ) -> Result<(), TransportError>;

    fn read_rssi(&self, device: &DeviceId) -> Result<(), TransportError>;

    fn maximum_write_length(&self, device: &DeviceId, write_type: WriteType) -> usize;

    /// Whether the host can open the app's system settings page
    fn supports_app_settings(&self) -> bool {
        false
    }

    fn show_app_settings(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Callbacks
// ----------------------------------------------------------------------------

/// Delegate callbacks of a native central stack
#[derive(Debug, Clone, PartialEq)]
pub enum CentralCallback {
    StateUpdated(RadioState),
    Discovered {
        device: DeviceId,
        name: Option<String>,
        rssi: i16,
        advertisement: Advertisement,
    },
    Connected {
        device: DeviceId,
    },
    ConnectFailed {
        device: DeviceId,
        error: TransportError,
    },
    /// Link dropped; `error` is `None` for a requested, clean disconnect
    Disconnected {
        device: DeviceId,
        error: Option<TransportError>,
    },
    /// A disconnect request failed and the link was left as it was
    DisconnectFailed {
        device: DeviceId,
        error: TransportError,
    },
    ServicesDiscovered {
        device: DeviceId,
        result: Result<Vec<NativeService>, TransportError>,
    },
    IncludedServicesDiscovered {
        device: DeviceId,
        service: NativeHandle,
        result: Result<Vec<NativeService>, TransportError>,
    },
    CharacteristicsDiscovered {
        device: DeviceId,
        service: NativeHandle,
        result: Result<Vec<NativeCharacteristic>, TransportError>,
    },
    DescriptorsDiscovered {
        device: DeviceId,
        characteristic: NativeHandle,
        result: Result<Vec<NativeDescriptor>, TransportError>,
    },
    /// Read completion or unsolicited notification
    CharacteristicValueUpdated {
        device: DeviceId,
        characteristic: NativeHandle,
        result: Result<Vec<u8>, TransportError>,
    },
    CharacteristicWritten {
        device: DeviceId,
        characteristic: NativeHandle,
        result: Result<(), TransportError>,
    },
    NotificationStateUpdated {
        device: DeviceId,
        characteristic: NativeHandle,
        result: Result<bool, TransportError>,
    },
    DescriptorValueUpdated {
        device: DeviceId,
        descriptor: NativeHandle,
        result: Result<Vec<u8>, TransportError>,
    },
    DescriptorWritten {
        device: DeviceId,
        descriptor: NativeHandle,
        result: Result<(), TransportError>,
    },
    RssiRead {
        device: DeviceId,
        result: Result<i16, TransportError>,
    },
}
