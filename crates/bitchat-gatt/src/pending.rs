//! Pending-operation registry
//!
//! Native stacks report results through unordered delegate callbacks that only
//! name the peer and the native object involved. Every operation the bridges
//! submit therefore parks a one-shot completion here, keyed by the peer, the
//! attribute it targets (if any) and the kind of operation. The terminal
//! callback looks the key up again and resolves exactly that completion.
//!
//! Guarantees:
//! - at most one entry per key; a colliding registration fails fast and the
//!   earlier caller keeps its entry
//! - every entry is resolved at most once, resolving an absent key is a no-op
//! - entries are never dropped silently, bulk removal always resolves them

use std::collections::HashMap;
use std::fmt;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::attribute::{AttributeId, AttributeNode};
use crate::error::{BridgeError, BridgeResult, CancelReason, TransportError};
use crate::peer::{CentralId, DeviceId};

// ----------------------------------------------------------------------------
// Keys
// ----------------------------------------------------------------------------

/// Kind of operation a completion is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    Disconnect,
    ReadRssi,
    DiscoverServices,
    DiscoverIncludedServices,
    DiscoverCharacteristics,
    DiscoverDescriptors,
    ReadCharacteristic,
    WriteCharacteristic,
    SetNotifyState,
    ReadDescriptor,
    WriteDescriptor,
    AddService,
    StartAdvertising,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Connect => "connect",
            OperationKind::Disconnect => "disconnect",
            OperationKind::ReadRssi => "readRSSI",
            OperationKind::DiscoverServices => "discoverServices",
            OperationKind::DiscoverIncludedServices => "discoverIncludedServices",
            OperationKind::DiscoverCharacteristics => "discoverCharacteristics",
            OperationKind::DiscoverDescriptors => "discoverDescriptors",
            OperationKind::ReadCharacteristic => "readCharacteristic",
            OperationKind::WriteCharacteristic => "writeCharacteristic",
            OperationKind::SetNotifyState => "setNotifyState",
            OperationKind::ReadDescriptor => "readDescriptor",
            OperationKind::WriteDescriptor => "writeDescriptor",
            OperationKind::AddService => "addService",
            OperationKind::StartAdvertising => "startAdvertising",
        };
        f.write_str(name)
    }
}

/// Owner of a pending operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerRef {
    /// A remote peripheral driven by the central role
    Device(DeviceId),
    /// A remote central talking to the local peripheral
    Central(CentralId),
    /// The local peripheral itself, for service registration and advertising
    LocalPeripheral,
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRef::Device(id) => write!(f, "device {}", id),
            PeerRef::Central(id) => write!(f, "central {}", id),
            PeerRef::LocalPeripheral => write!(f, "local peripheral"),
        }
    }
}

impl From<DeviceId> for PeerRef {
    fn from(id: DeviceId) -> Self {
        PeerRef::Device(id)
    }
}

impl From<CentralId> for PeerRef {
    fn from(id: CentralId) -> Self {
        PeerRef::Central(id)
    }
}

/// Identity of one in-flight operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub peer: PeerRef,
    pub attribute: Option<AttributeId>,
    pub kind: OperationKind,
}

impl PendingKey {
    pub fn new(peer: impl Into<PeerRef>, attribute: Option<AttributeId>, kind: OperationKind) -> Self {
        Self {
            peer: peer.into(),
            attribute,
            kind,
        }
    }

    /// Key of an operation that targets the peer as a whole
    pub fn peer_wide(peer: impl Into<PeerRef>, kind: OperationKind) -> Self {
        Self::new(peer, None, kind)
    }
}

impl fmt::Display for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.attribute {
            Some(attribute) => write!(f, "{} on {} for {}", self.kind, attribute, self.peer),
            None => write!(f, "{} for {}", self.kind, self.peer),
        }
    }
}

// ----------------------------------------------------------------------------
// Completions
// ----------------------------------------------------------------------------

/// Success payload of a completed operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    Done,
    Value(Vec<u8>),
    Rssi(i16),
    Attributes(Vec<AttributeNode>),
}

impl OperationOutput {
    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            OperationOutput::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_rssi(self) -> Option<i16> {
        match self {
            OperationOutput::Rssi(rssi) => Some(rssi),
            _ => None,
        }
    }

    pub fn into_attributes(self) -> Option<Vec<AttributeNode>> {
        match self {
            OperationOutput::Attributes(nodes) => Some(nodes),
            _ => None,
        }
    }
}

pub type OperationResult = BridgeResult<OperationOutput>;

/// Receiving half of a registered operation
#[derive(Debug)]
pub struct Completion {
    key: PendingKey,
    rx: oneshot::Receiver<OperationResult>,
}

impl Completion {
    pub fn key(&self) -> &PendingKey {
        &self.key
    }

    /// Wait for the terminal callback
    ///
    /// If the registry went away without resolving the entry, the operation
    /// fails with `Cancelled(BridgeDropped)`.
    pub async fn wait(self) -> OperationResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Cancelled(CancelReason::BridgeDropped)),
        }
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Ledger of in-flight operations for one role
#[derive(Debug, Default)]
pub struct PendingOperations {
    entries: HashMap<PendingKey, oneshot::Sender<OperationResult>>,
}

impl PendingOperations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &PendingKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Park a completion for `key`
    ///
    /// Fails with `OperationInProgress` if an entry already exists for the
    /// key; the existing entry is left untouched.
    pub fn register(&mut self, key: PendingKey) -> BridgeResult<Completion> {
        if self.entries.contains_key(&key) {
            debug!("Rejected colliding operation: {}", key);
            return Err(BridgeError::OperationInProgress {
                operation: key.to_string(),
            });
        }

        let (tx, rx) = oneshot::channel();
        trace!("Registered pending {}", key);
        self.entries.insert(key.clone(), tx);
        Ok(Completion { key, rx })
    }

    /// Register `key`, then hand the operation to the transport
    ///
    /// A submission rejected synchronously removes the entry again and fails
    /// with the transport error.
    pub fn submit<F>(&mut self, key: PendingKey, submit: F) -> BridgeResult<Completion>
    where
        F: FnOnce() -> Result<(), TransportError>,
    {
        let completion = self.register(key)?;
        if let Err(error) = submit() {
            debug!("Submission of {} rejected: {}", completion.key, error);
            self.entries.remove(&completion.key);
            return Err(error.into());
        }
        Ok(completion)
    }

    /// Remove the entry for `key` without resolving it
    pub fn take(&mut self, key: &PendingKey) -> Option<oneshot::Sender<OperationResult>> {
        self.entries.remove(key)
    }

    /// Resolve and remove the entry for `key`
    ///
    /// Returns `false` if there was no entry, which is never an error.
    pub fn resolve(&mut self, key: &PendingKey, result: OperationResult) -> bool {
        match self.entries.remove(key) {
            Some(tx) => {
                trace!("Resolved pending {} (ok: {})", key, result.is_ok());
                // the caller may have stopped waiting
                let _ = tx.send(result);
                true
            }
            None => {
                trace!("No pending {} to resolve", key);
                false
            }
        }
    }

    /// Fail every entry that belongs to `peer`, whatever its attribute or kind
    pub fn resolve_all(&mut self, peer: &PeerRef, error: BridgeError) -> usize {
        let keys: Vec<PendingKey> = self
            .entries
            .keys()
            .filter(|key| &key.peer == peer)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(tx) = self.entries.remove(key) {
                let _ = tx.send(Err(error.clone()));
            }
        }
        if !keys.is_empty() {
            debug!("Failed {} pending operations for {}: {}", keys.len(), peer, error);
        }
        keys.len()
    }

    /// Fail every entry of the given kind, whatever peer it belongs to
    pub fn resolve_kind(&mut self, kind: OperationKind, error: BridgeError) -> usize {
        let keys: Vec<PendingKey> = self
            .entries
            .keys()
            .filter(|key| key.kind == kind)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(tx) = self.entries.remove(key) {
                let _ = tx.send(Err(error.clone()));
            }
        }
        keys.len()
    }

    /// Cancel everything, used on role reset
    pub fn cancel_all(&mut self, reason: CancelReason) -> usize {
        let cancelled = self.entries.len();
        for (_, tx) in self.entries.drain() {
            let _ = tx.send(Err(BridgeError::Cancelled(reason)));
        }
        if cancelled > 0 {
            debug!("Cancelled {} pending operations ({})", cancelled, reason);
        }
        cancelled
    }
}

impl Drop for PendingOperations {
    fn drop(&mut self) {
        self.cancel_all(CancelReason::BridgeDropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    fn device(id: &str) -> PeerRef {
        PeerRef::Device(DeviceId::new(id))
    }

    #[tokio::test]
    async fn test_register_then_resolve() {
        let mut pending = PendingOperations::new();
        let key = PendingKey::peer_wide(DeviceId::new("peer-A"), OperationKind::ReadRssi);
        let completion = pending.register(key.clone()).unwrap();

        let mut waiter = task::spawn(completion.wait());
        assert_pending!(waiter.poll());

        assert!(pending.resolve(&key, Ok(OperationOutput::Rssi(-60))));
        assert!(waiter.is_woken());
        let result = assert_ready!(waiter.poll());
        assert_eq!(result.unwrap().into_rssi(), Some(-60));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_second_resolution_is_noop() {
        let mut pending = PendingOperations::new();
        let key = PendingKey::peer_wide(DeviceId::new("peer-A"), OperationKind::Connect);
        let completion = pending.register(key.clone()).unwrap();

        assert!(pending.resolve(&key, Ok(OperationOutput::Done)));
        assert!(!pending.resolve(&key, Err(TransportError::unknown().into())));
        assert_eq!(completion.wait().await, Ok(OperationOutput::Done));
    }

    #[tokio::test]
    async fn test_colliding_key_keeps_first_entry() {
        let mut pending = PendingOperations::new();
        let key = PendingKey::new(
            DeviceId::new("peer-A"),
            Some(AttributeId::from_raw(9)),
            OperationKind::ReadCharacteristic,
        );
        let first = pending.register(key.clone()).unwrap();

        let err = pending.register(key.clone()).unwrap_err();
        assert!(matches!(err, BridgeError::OperationInProgress { .. }));
        assert_eq!(pending.len(), 1);

        pending.resolve(&key, Ok(OperationOutput::Value(vec![1, 2])));
        assert_eq!(first.wait().await.unwrap().into_value(), Some(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_resolve_all_is_scoped_to_peer() {
        let mut pending = PendingOperations::new();
        let a_read = pending
            .register(PendingKey::new(
                DeviceId::new("peer-A"),
                Some(AttributeId::from_raw(1)),
                OperationKind::ReadCharacteristic,
            ))
            .unwrap();
        let a_rssi = pending
            .register(PendingKey::peer_wide(DeviceId::new("peer-A"), OperationKind::ReadRssi))
            .unwrap();
        let b_key = PendingKey::peer_wide(DeviceId::new("peer-B"), OperationKind::ReadRssi);
        let _b_rssi = pending.register(b_key.clone()).unwrap();

        let error: BridgeError = TransportError::new(6, "link lost").into();
        assert_eq!(pending.resolve_all(&device("peer-A"), error.clone()), 2);
        assert_eq!(a_read.wait().await, Err(error.clone()));
        assert_eq!(a_rssi.wait().await, Err(error));
        assert!(pending.contains(&b_key));
        assert_eq!(pending.resolve_all(&device("peer-A"), TransportError::unknown().into()), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_and_drop() {
        let mut pending = PendingOperations::new();
        let connect = pending
            .register(PendingKey::peer_wide(DeviceId::new("peer-A"), OperationKind::Connect))
            .unwrap();
        assert_eq!(pending.cancel_all(CancelReason::Reset), 1);
        assert_eq!(connect.wait().await, Err(BridgeError::Cancelled(CancelReason::Reset)));

        let advertising = pending
            .register(PendingKey::peer_wide(PeerRef::LocalPeripheral, OperationKind::StartAdvertising))
            .unwrap();
        drop(pending);
        assert_eq!(
            advertising.wait().await,
            Err(BridgeError::Cancelled(CancelReason::BridgeDropped))
        );
    }

    #[test]
    fn test_rejected_submission_leaves_no_entry() {
        let mut pending = PendingOperations::new();
        let key = PendingKey::peer_wide(DeviceId::new("peer-A"), OperationKind::Connect);
        let err = pending
            .submit(key.clone(), || Err(TransportError::new(3, "radio off")))
            .unwrap_err();
        assert_eq!(err, BridgeError::Transport(TransportError::new(3, "radio off")));
        assert!(!pending.contains(&key));
        assert!(pending.submit(key, || Ok(())).is_ok());
    }
}
