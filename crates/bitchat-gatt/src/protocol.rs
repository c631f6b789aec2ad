//! BLE protocol constants and value types shared by both roles

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Standard UUIDs
// ----------------------------------------------------------------------------

/// Bluetooth base UUID, used to expand 16-bit assigned numbers
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(BASE_UUID_BITS);

const BASE_UUID_BITS: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// Client Characteristic Configuration descriptor
pub const CLIENT_CHARACTERISTIC_CONFIGURATION_UUID: Uuid = uuid_from_u16(0x2902);

/// Characteristic User Description descriptor
pub const CHARACTERISTIC_USER_DESCRIPTION_UUID: Uuid = uuid_from_u16(0x2901);

/// Expand a 16-bit assigned number into a full 128-bit UUID
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID_BITS | ((short as u128) << 96))
}

// ----------------------------------------------------------------------------
// Radio State
// ----------------------------------------------------------------------------

/// State of a role's native manager
///
/// Tracked independently for the central and peripheral roles since they may
/// use distinct native managers with independent authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RadioState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    pub fn is_powered_on(&self) -> bool {
        *self == RadioState::PoweredOn
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RadioState::Unknown => "unknown",
            RadioState::Resetting => "resetting",
            RadioState::Unsupported => "unsupported",
            RadioState::Unauthorized => "unauthorized",
            RadioState::PoweredOff => "poweredOff",
            RadioState::PoweredOn => "poweredOn",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Write Types
// ----------------------------------------------------------------------------

/// How a characteristic write is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteType {
    /// The remote acknowledges the write; completion waits for it
    WithResponse,
    /// Fire and forget; completion resolves on submission
    WithoutResponse,
}

// ----------------------------------------------------------------------------
// ATT Error Codes
// ----------------------------------------------------------------------------

/// Result code sent back for an ATT request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttError {
    Success,
    InvalidHandle,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidPdu,
    InsufficientAuthentication,
    RequestNotSupported,
    InvalidOffset,
    InsufficientAuthorization,
    PrepareQueueFull,
    AttributeNotFound,
    AttributeNotLong,
    InsufficientEncryptionKeySize,
    InvalidAttributeValueLength,
    UnlikelyError,
    InsufficientEncryption,
    UnsupportedGroupType,
    InsufficientResources,
}

impl AttError {
    /// Wire value of the error code
    pub fn code(&self) -> u8 {
        match self {
            AttError::Success => 0x00,
            AttError::InvalidHandle => 0x01,
            AttError::ReadNotPermitted => 0x02,
            AttError::WriteNotPermitted => 0x03,
            AttError::InvalidPdu => 0x04,
            AttError::InsufficientAuthentication => 0x05,
            AttError::RequestNotSupported => 0x06,
            AttError::InvalidOffset => 0x07,
            AttError::InsufficientAuthorization => 0x08,
            AttError::PrepareQueueFull => 0x09,
            AttError::AttributeNotFound => 0x0a,
            AttError::AttributeNotLong => 0x0b,
            AttError::InsufficientEncryptionKeySize => 0x0c,
            AttError::InvalidAttributeValueLength => 0x0d,
            AttError::UnlikelyError => 0x0e,
            AttError::InsufficientEncryption => 0x0f,
            AttError::UnsupportedGroupType => 0x10,
            AttError::InsufficientResources => 0x11,
        }
    }

    /// Decode a wire value, mapping unknown codes to `UnlikelyError`
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => AttError::Success,
            0x01 => AttError::InvalidHandle,
            0x02 => AttError::ReadNotPermitted,
            0x03 => AttError::WriteNotPermitted,
            0x04 => AttError::InvalidPdu,
            0x05 => AttError::InsufficientAuthentication,
            0x06 => AttError::RequestNotSupported,
            0x07 => AttError::InvalidOffset,
            0x08 => AttError::InsufficientAuthorization,
            0x09 => AttError::PrepareQueueFull,
            0x0a => AttError::AttributeNotFound,
            0x0b => AttError::AttributeNotLong,
            0x0c => AttError::InsufficientEncryptionKeySize,
            0x0d => AttError::InvalidAttributeValueLength,
            0x0f => AttError::InsufficientEncryption,
            0x10 => AttError::UnsupportedGroupType,
            0x11 => AttError::InsufficientResources,
            _ => AttError::UnlikelyError,
        }
    }
}

// ----------------------------------------------------------------------------
// Characteristic Properties and Permissions
// ----------------------------------------------------------------------------

bitflags::bitflags! {
    /// Characteristic properties, using the declaration bit values
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CharacteristicProperties: u16 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
        const NOTIFY_ENCRYPTION_REQUIRED = 0x100;
        const INDICATE_ENCRYPTION_REQUIRED = 0x200;
    }
}

impl CharacteristicProperties {
    /// Whether remote centrals may subscribe to value updates
    pub fn can_notify(&self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }
}

impl Default for CharacteristicProperties {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags::bitflags! {
    /// Local attribute permissions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct AttributePermissions: u8 {
        const READABLE = 1 << 0;
        const WRITEABLE = 1 << 1;
        const READ_ENCRYPTION_REQUIRED = 1 << 2;
        const WRITE_ENCRYPTION_REQUIRED = 1 << 3;
    }
}

impl Default for AttributePermissions {
    fn default() -> Self {
        Self::empty()
    }
}

// ----------------------------------------------------------------------------
// Advertisement
// ----------------------------------------------------------------------------

/// Manufacturer specific advertisement data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerData {
    pub company_id: u16,
    pub data: Vec<u8>,
}

/// Advertisement payload, both as seen by the scanner and as sent by the
/// local peripheral
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Advertisement {
    pub name: Option<String>,
    pub service_uuids: SmallVec<[Uuid; 4]>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub manufacturer_data: Option<ManufacturerData>,
}

impl Advertisement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_service_uuid(mut self, uuid: Uuid) -> Self {
        if !self.service_uuids.contains(&uuid) {
            self.service_uuids.push(uuid);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            CLIENT_CHARACTERISTIC_CONFIGURATION_UUID.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_att_error_codes() {
        assert_eq!(AttError::AttributeNotFound.code(), 0x0a);
        assert_eq!(AttError::from_code(0x03), AttError::WriteNotPermitted);
        assert_eq!(AttError::from_code(0xee), AttError::UnlikelyError);
    }

    #[test]
    fn test_properties() {
        let props = CharacteristicProperties::READ | CharacteristicProperties::NOTIFY;
        assert!(props.contains(CharacteristicProperties::READ));
        assert!(!props.contains(CharacteristicProperties::WRITE));
        assert!(props.can_notify());
        assert!(!CharacteristicProperties::WRITE.can_notify());
        assert!(CharacteristicProperties::INDICATE.can_notify());
    }

    #[test]
    fn test_native_property_bits_are_truncated() {
        let props = CharacteristicProperties::from_bits_truncate(0x8012);
        assert_eq!(props, CharacteristicProperties::READ | CharacteristicProperties::NOTIFY);
        assert_eq!(props.bits(), 0x12);
        assert_eq!(AttributePermissions::default(), AttributePermissions::empty());
    }

    #[test]
    fn test_advertisement_dedups_service_uuids() {
        let uuid = uuid_from_u16(0x180d);
        let adv = Advertisement::new()
            .with_name("heart")
            .with_service_uuid(uuid)
            .with_service_uuid(uuid);
        assert_eq!(adv.service_uuids.len(), 1);
        assert_eq!(adv.name.as_deref(), Some("heart"));
    }
}
