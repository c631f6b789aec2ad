//! ATT requests awaiting a response from the application

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::attribute::{AttributeId, NativeHandle};
use crate::peer::CentralId;

/// Identity of one outstanding ATT request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A read or write from a remote central, as seen by the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttRequest {
    pub id: RequestId,
    pub central: CentralId,
    pub attribute: AttributeId,
    pub offset: usize,
    /// Bytes to write, `None` for reads
    pub value: Option<Vec<u8>>,
}

/// Outstanding requests, each consumed by exactly one response
#[derive(Debug, Default)]
pub(crate) struct RequestTable {
    next_id: u64,
    requests: HashMap<RequestId, NativeHandle>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request and mint its identity
    pub fn insert(
        &mut self,
        native: NativeHandle,
        central: CentralId,
        attribute: AttributeId,
        offset: usize,
        value: Option<Vec<u8>>,
    ) -> AttRequest {
        self.next_id += 1;
        let id = RequestId(self.next_id);
        self.requests.insert(id, native);
        AttRequest {
            id,
            central,
            attribute,
            offset,
            value,
        }
    }

    /// Consume a request, returning the native handle to respond to
    pub fn take(&mut self, id: RequestId) -> Option<NativeHandle> {
        self.requests.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn clear(&mut self) {
        self.requests.clear();
    }
}
