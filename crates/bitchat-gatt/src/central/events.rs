//! Events forwarded from the central role to the application

use serde::{Deserialize, Serialize};

use crate::attribute::AttributeId;
use crate::error::TransportError;
use crate::peer::{ConnectionState, DeviceId};
use crate::protocol::{Advertisement, RadioState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CentralEvent {
    StateChanged(RadioState),
    Discovered {
        device: DeviceId,
        name: Option<String>,
        rssi: i16,
        advertisement: Advertisement,
    },
    ConnectionStateChanged {
        device: DeviceId,
        state: ConnectionState,
        error: Option<TransportError>,
    },
    /// Value update that answered no pending read
    CharacteristicNotified {
        device: DeviceId,
        characteristic: AttributeId,
        value: Vec<u8>,
    },
}
