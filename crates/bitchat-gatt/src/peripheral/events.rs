//! Events forwarded from the peripheral role to the application

use serde::{Deserialize, Serialize};

use crate::attribute::AttributeId;
use crate::peer::CentralId;
use crate::peripheral::request::AttRequest;
use crate::protocol::RadioState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeripheralEvent {
    StateChanged(RadioState),
    ReadRequested(AttRequest),
    /// Every request of one native write batch
    WriteRequested(Vec<AttRequest>),
    NotifyStateChanged {
        central: CentralId,
        characteristic: AttributeId,
        enabled: bool,
    },
    /// The transport has room again after `update_value` returned `false`
    ReadyToUpdateSubscribers,
}
