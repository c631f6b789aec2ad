//! Error types for the GATT bridges

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attribute::AttributeId;
use crate::peer::{CentralId, DeviceId};
use crate::peripheral::RequestId;

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Failure reported by the native radio stack
///
/// Always asynchronous from the application's point of view: it travels in the
/// failure payload of an already registered pending operation.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("transport error {code}: {message}")]
pub struct TransportError {
    pub code: i64,
    pub message: String,
}

impl TransportError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Error for a native failure that carried no description
    pub fn unknown() -> Self {
        Self::new(-1, "unknown error")
    }
}

// ----------------------------------------------------------------------------
// Bridge Errors
// ----------------------------------------------------------------------------

/// Why a pending operation was cancelled instead of completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// The role was re-initialized while the operation was in flight
    Reset,
    /// The peer disconnected cleanly while the operation was in flight
    Disconnected,
    /// The bridge was dropped before the transport answered
    BridgeDropped,
    /// The service was removed before the transport confirmed it
    ServiceRemoved,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Reset => write!(f, "role reset"),
            CancelReason::Disconnected => write!(f, "peer disconnected"),
            CancelReason::BridgeDropped => write!(f, "bridge dropped"),
            CancelReason::ServiceRemoved => write!(f, "service removed"),
        }
    }
}

/// Errors surfaced to the application layer by both role bridges
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Unknown device: {device}")]
    UnknownDevice { device: DeviceId },

    #[error("Unknown central: {central}")]
    UnknownCentral { central: CentralId },

    #[error("Unknown attribute: {id}")]
    UnknownAttribute { id: AttributeId },

    #[error("Unknown ATT request: {id}")]
    UnknownRequest { id: RequestId },

    #[error("Attribute {id} is not a {expected}")]
    AttributeKindMismatch { id: AttributeId, expected: &'static str },

    #[error("Operation already in flight: {operation}")]
    OperationInProgress { operation: String },

    #[error("Malformed attribute tree: {reason}")]
    MalformedAttributeTree { reason: String },

    #[error("Attribute tree corrupted: {id} is missing")]
    CorruptAttributeTree { id: AttributeId },

    #[error("Operation not supported: {operation}")]
    Unsupported { operation: &'static str },

    #[error("Operation cancelled: {0}")]
    Cancelled(CancelReason),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BridgeError {
    /// Whether the error was detected locally, without involving the radio
    pub fn is_local(&self) -> bool {
        !matches!(self, BridgeError::Transport(_) | BridgeError::Cancelled(_))
    }
}

/// Result type used throughout the bridges
pub type BridgeResult<T> = Result<T, BridgeError>;
