//! Seam between the peripheral bridge and a native peripheral stack

use crate::attribute::{AttributeId, LocalService, NativeHandle};
use crate::error::TransportError;
use crate::peer::CentralId;
use crate::protocol::{Advertisement, AttError, RadioState};

/// Submission side of a native peripheral stack
///
/// The stack is handed fully identified service trees, so it reports requests
/// and subscriptions by [`AttributeId`].
pub trait PeripheralTransport: Send + Sync {
    fn state(&self) -> RadioState;

    fn is_advertising(&self) -> bool;

    fn add_service(&self, service: &LocalService) -> Result<(), TransportError>;

    fn remove_service(&self, service: AttributeId);

    fn remove_all_services(&self);

    fn start_advertising(&self, advertisement: &Advertisement) -> Result<(), TransportError>;

    fn stop_advertising(&self);

    /// Answer a native ATT request
    fn respond(&self, request: NativeHandle, value: Option<&[u8]>, result: AttError);

    /// Send a notification or indication; `false` means the transmit queue is
    /// full and the update was not sent
    fn update_value(&self, characteristic: AttributeId, value: &[u8], centrals: Option<&[CentralId]>) -> bool;

    fn supports_app_settings(&self) -> bool {
        false
    }

    fn show_app_settings(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// An ATT read or write as delivered by the native stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeAttRequest {
    pub handle: NativeHandle,
    pub central: CentralId,
    pub maximum_update_length: usize,
    pub attribute: AttributeId,
    pub offset: usize,
    pub value: Option<Vec<u8>>,
}

/// Delegate callbacks of a native peripheral stack
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralCallback {
    StateUpdated(RadioState),
    ServiceAdded {
        service: AttributeId,
        result: Result<(), TransportError>,
    },
    AdvertisingStarted {
        result: Result<(), TransportError>,
    },
    ReadRequest(NativeAttRequest),
    /// One native callback carrying several writes
    WriteRequests(Vec<NativeAttRequest>),
    Subscribed {
        central: CentralId,
        maximum_update_length: usize,
        characteristic: AttributeId,
    },
    Unsubscribed {
        central: CentralId,
        maximum_update_length: usize,
        characteristic: AttributeId,
    },
    ReadyToUpdateSubscribers,
}
