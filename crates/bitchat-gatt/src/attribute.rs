//! Attribute identity registry
//!
//! Native BLE stacks only expose per-process object identities for services,
//! characteristics and descriptors. Those are unsafe to hand across the
//! application boundary, so every node is given an [`AttributeId`] drawn from a
//! monotonically increasing counter and recorded here together with its parent
//! linkage.
//!
//! The central role keeps one registry per remote device, filled incrementally
//! as discovery callbacks arrive. The peripheral role keeps a single registry
//! filled by whole-tree registration, which is atomic: either every node of a
//! service tree gets an identity or none does.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{AttributePermissions, CharacteristicProperties};

static NEXT_ATTRIBUTE_ID: AtomicU64 = AtomicU64::new(1);

// ----------------------------------------------------------------------------
// Identities
// ----------------------------------------------------------------------------

/// Numeric identity of a GATT node, unique within a process run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeId(u64);

impl AttributeId {
    fn next() -> Self {
        Self(NEXT_ATTRIBUTE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuild an identity received back from the application layer
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque identity of a native object, only meaningful to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(u64);

impl NativeHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native:{:#x}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Nodes
// ----------------------------------------------------------------------------

/// Node type with its type-specific data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeKind {
    Service {
        primary: bool,
    },
    Characteristic {
        properties: CharacteristicProperties,
        permissions: AttributePermissions,
    },
    Descriptor,
}

impl AttributeKind {
    pub fn name(&self) -> &'static str {
        match self {
            AttributeKind::Service { .. } => "service",
            AttributeKind::Characteristic { .. } => "characteristic",
            AttributeKind::Descriptor => "descriptor",
        }
    }
}

/// One registered GATT node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeNode {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub kind: AttributeKind,
    /// Service for a characteristic, characteristic for a descriptor, including
    /// service for an included service
    pub parent: Option<AttributeId>,
    /// Static value of a local node
    pub value: Option<Vec<u8>>,
    #[serde(skip)]
    pub(crate) handle: Option<NativeHandle>,
}

impl PartialEq for AttributeNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.uuid == other.uuid
            && self.kind == other.kind
            && self.parent == other.parent
            && self.value == other.value
    }
}

impl Eq for AttributeNode {}

impl AttributeNode {
    pub fn is_service(&self) -> bool {
        matches!(self.kind, AttributeKind::Service { .. })
    }

    pub fn is_characteristic(&self) -> bool {
        matches!(self.kind, AttributeKind::Characteristic { .. })
    }

    pub fn is_descriptor(&self) -> bool {
        matches!(self.kind, AttributeKind::Descriptor)
    }

    /// Properties of a characteristic node, empty for other kinds
    pub fn properties(&self) -> CharacteristicProperties {
        match self.kind {
            AttributeKind::Characteristic { properties, .. } => properties,
            _ => CharacteristicProperties::empty(),
        }
    }
}

// ----------------------------------------------------------------------------
// Service Trees
// ----------------------------------------------------------------------------

/// Service tree supplied by the application for the local peripheral
///
/// Child slots are optional because the application codec admits null list
/// entries. A `None` slot anywhere makes the whole tree malformed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub uuid: Uuid,
    pub primary: bool,
    pub included_services: Vec<Option<ServiceDefinition>>,
    pub characteristics: Vec<Option<CharacteristicDefinition>>,
}

impl ServiceDefinition {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            primary: true,
            included_services: Vec::new(),
            characteristics: Vec::new(),
        }
    }

    pub fn secondary(mut self) -> Self {
        self.primary = false;
        self
    }

    pub fn with_included_service(mut self, service: ServiceDefinition) -> Self {
        self.included_services.push(Some(service));
        self
    }

    pub fn with_characteristic(mut self, characteristic: CharacteristicDefinition) -> Self {
        self.characteristics.push(Some(characteristic));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDefinition {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub permissions: AttributePermissions,
    pub value: Option<Vec<u8>>,
    pub descriptors: Vec<Option<DescriptorDefinition>>,
}

impl CharacteristicDefinition {
    pub fn new(
        uuid: Uuid,
        properties: CharacteristicProperties,
        permissions: AttributePermissions,
    ) -> Self {
        Self {
            uuid,
            properties,
            permissions,
            value: None,
            descriptors: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_descriptor(mut self, descriptor: DescriptorDefinition) -> Self {
        self.descriptors.push(Some(descriptor));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorDefinition {
    pub uuid: Uuid,
    pub value: Option<Vec<u8>>,
}

impl DescriptorDefinition {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid, value: None }
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = Some(value);
        self
    }
}

/// A registered service tree, every node carrying its assigned identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalService {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub primary: bool,
    pub included_services: Vec<LocalService>,
    pub characteristics: Vec<LocalCharacteristic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCharacteristic {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub permissions: AttributePermissions,
    pub value: Option<Vec<u8>>,
    pub descriptors: Vec<LocalDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDescriptor {
    pub id: AttributeId,
    pub uuid: Uuid,
    pub value: Option<Vec<u8>>,
}

impl LocalService {
    /// Every identity in the tree, depth first: included services, then
    /// characteristics with their descriptors, then the service itself
    pub fn identities(&self) -> Vec<AttributeId> {
        let mut ids = Vec::new();
        self.collect_identities(&mut ids);
        ids
    }

    fn collect_identities(&self, ids: &mut Vec<AttributeId>) {
        for included in &self.included_services {
            included.collect_identities(ids);
        }
        for characteristic in &self.characteristics {
            ids.extend(characteristic.descriptors.iter().map(|d| d.id));
            ids.push(characteristic.id);
        }
        ids.push(self.id);
    }

    /// Find a characteristic anywhere in the tree by UUID
    pub fn characteristic(&self, uuid: Uuid) -> Option<&LocalCharacteristic> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .or_else(|| {
                self.included_services
                    .iter()
                    .find_map(|s| s.characteristic(uuid))
            })
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Identity tables for one owner: a remote device or the local peripheral
#[derive(Debug, Default)]
pub struct AttributeRegistry {
    nodes: HashMap<AttributeId, AttributeNode>,
    handles: HashMap<NativeHandle, AttributeId>,
    trees: HashMap<AttributeId, LocalService>,
}

impl AttributeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop every identity
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.handles.clear();
        self.trees.clear();
    }

    pub fn contains(&self, id: AttributeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: AttributeId) -> Option<&AttributeNode> {
        self.nodes.get(&id)
    }

    pub fn resolve(&self, id: AttributeId) -> BridgeResult<&AttributeNode> {
        self.nodes
            .get(&id)
            .ok_or(BridgeError::UnknownAttribute { id })
    }

    pub fn resolve_service(&self, id: AttributeId) -> BridgeResult<&AttributeNode> {
        self.resolve_matching(id, "service", AttributeNode::is_service)
    }

    pub fn resolve_characteristic(&self, id: AttributeId) -> BridgeResult<&AttributeNode> {
        self.resolve_matching(id, "characteristic", AttributeNode::is_characteristic)
    }

    pub fn resolve_descriptor(&self, id: AttributeId) -> BridgeResult<&AttributeNode> {
        self.resolve_matching(id, "descriptor", AttributeNode::is_descriptor)
    }

    fn resolve_matching(
        &self,
        id: AttributeId,
        expected: &'static str,
        matches: fn(&AttributeNode) -> bool,
    ) -> BridgeResult<&AttributeNode> {
        let node = self.resolve(id)?;
        if matches(node) {
            Ok(node)
        } else {
            Err(BridgeError::AttributeKindMismatch { id, expected })
        }
    }

    /// Native handle recorded for a node
    pub fn handle_of(&self, id: AttributeId) -> Option<NativeHandle> {
        self.nodes.get(&id).and_then(|node| node.handle)
    }

    /// Identity previously assigned to a native object
    pub fn lookup_handle(&self, handle: NativeHandle) -> Option<AttributeId> {
        self.handles.get(&handle).copied()
    }

    /// Record a node reported by the transport
    ///
    /// A native object that was already recorded keeps its identity and its
    /// original parent linkage, so rediscovery is stable.
    pub fn insert_discovered(
        &mut self,
        handle: NativeHandle,
        uuid: Uuid,
        kind: AttributeKind,
        parent: Option<AttributeId>,
    ) -> &AttributeNode {
        let id = match self.handles.get(&handle) {
            Some(id) => *id,
            None => {
                let id = AttributeId::next();
                trace!("Assigned {} to {} ({})", id, handle, uuid);
                self.handles.insert(handle, id);
                self.nodes.insert(
                    id,
                    AttributeNode {
                        id,
                        uuid,
                        kind,
                        parent,
                        value: None,
                        handle: Some(handle),
                    },
                );
                id
            }
        };
        &self.nodes[&id]
    }

    /// Register a complete local service tree
    ///
    /// Walks included services, then characteristics, then descriptors. The
    /// tree is validated before any identity is assigned, so a malformed tree
    /// leaves the registry untouched.
    pub fn register_service(&mut self, definition: &ServiceDefinition) -> BridgeResult<LocalService> {
        validate_service(definition, "service")?;
        let service = self.assign_service(definition, None);
        debug!(
            "Registered service {} ({}) with {} attributes",
            service.id,
            service.uuid,
            service.identities().len()
        );
        self.trees.insert(service.id, service.clone());
        Ok(service)
    }

    fn assign_service(&mut self, definition: &ServiceDefinition, parent: Option<AttributeId>) -> LocalService {
        let id = AttributeId::next();
        self.nodes.insert(
            id,
            AttributeNode {
                id,
                uuid: definition.uuid,
                kind: AttributeKind::Service {
                    primary: definition.primary,
                },
                parent,
                value: None,
                handle: None,
            },
        );

        let included_services = definition
            .included_services
            .iter()
            .flatten()
            .map(|included| self.assign_service(included, Some(id)))
            .collect();

        let characteristics = definition
            .characteristics
            .iter()
            .flatten()
            .map(|characteristic| self.assign_characteristic(characteristic, id))
            .collect();

        LocalService {
            id,
            uuid: definition.uuid,
            primary: definition.primary,
            included_services,
            characteristics,
        }
    }

    fn assign_characteristic(
        &mut self,
        definition: &CharacteristicDefinition,
        service: AttributeId,
    ) -> LocalCharacteristic {
        let id = AttributeId::next();
        self.nodes.insert(
            id,
            AttributeNode {
                id,
                uuid: definition.uuid,
                kind: AttributeKind::Characteristic {
                    properties: definition.properties,
                    permissions: definition.permissions,
                },
                parent: Some(service),
                value: definition.value.clone(),
                handle: None,
            },
        );

        let descriptors = definition
            .descriptors
            .iter()
            .flatten()
            .map(|descriptor| {
                let descriptor_id = AttributeId::next();
                self.nodes.insert(
                    descriptor_id,
                    AttributeNode {
                        id: descriptor_id,
                        uuid: descriptor.uuid,
                        kind: AttributeKind::Descriptor,
                        parent: Some(id),
                        value: descriptor.value.clone(),
                        handle: None,
                    },
                );
                LocalDescriptor {
                    id: descriptor_id,
                    uuid: descriptor.uuid,
                    value: descriptor.value.clone(),
                }
            })
            .collect();

        LocalCharacteristic {
            id,
            uuid: definition.uuid,
            properties: definition.properties,
            permissions: definition.permissions,
            value: definition.value.clone(),
            descriptors,
        }
    }

    /// The registered tree rooted at `id`
    pub fn service_tree(&self, id: AttributeId) -> Option<&LocalService> {
        self.trees.get(&id)
    }

    /// Remove a registered service tree and every identity it added
    ///
    /// Every expected node is checked before anything is removed; a missing
    /// node means the tables were corrupted and nothing is touched.
    pub fn unregister_service(&mut self, id: AttributeId) -> BridgeResult<LocalService> {
        let tree = self
            .trees
            .get(&id)
            .ok_or(BridgeError::UnknownAttribute { id })?;
        let identities = tree.identities();
        if let Some(missing) = identities.iter().find(|id| !self.nodes.contains_key(id)) {
            return Err(BridgeError::CorruptAttributeTree { id: *missing });
        }

        for identity in &identities {
            if let Some(node) = self.nodes.remove(identity) {
                if let Some(handle) = node.handle {
                    self.handles.remove(&handle);
                }
            }
        }
        debug!("Unregistered service {} ({} attributes)", id, identities.len());
        self.trees
            .remove(&id)
            .ok_or(BridgeError::UnknownAttribute { id })
    }

    /// Identities of every registered root service
    pub fn root_services(&self) -> Vec<AttributeId> {
        let mut roots: Vec<_> = self.trees.keys().copied().collect();
        roots.sort();
        roots
    }

    #[cfg(test)]
    pub(crate) fn remove_node(&mut self, id: AttributeId) -> Option<AttributeNode> {
        self.nodes.remove(&id)
    }
}

fn validate_service(definition: &ServiceDefinition, path: &str) -> BridgeResult<()> {
    for (index, slot) in definition.included_services.iter().enumerate() {
        let path = format!("{path}.included_services[{index}]");
        match slot {
            Some(included) => validate_service(included, &path)?,
            None => return Err(missing_node(path)),
        }
    }
    for (index, slot) in definition.characteristics.iter().enumerate() {
        let path = format!("{path}.characteristics[{index}]");
        let characteristic = slot.as_ref().ok_or_else(|| missing_node(path.clone()))?;
        if let Some(position) = characteristic.descriptors.iter().position(Option::is_none) {
            return Err(missing_node(format!("{path}.descriptors[{position}]")));
        }
    }
    Ok(())
}

fn missing_node(path: String) -> BridgeError {
    BridgeError::MalformedAttributeTree {
        reason: format!("{path} is absent"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{uuid_from_u16, CLIENT_CHARACTERISTIC_CONFIGURATION_UUID};

    fn heart_rate_service() -> ServiceDefinition {
        ServiceDefinition::new(uuid_from_u16(0x180d))
            .with_included_service(ServiceDefinition::new(uuid_from_u16(0x180f)).secondary().with_characteristic(
                CharacteristicDefinition::new(
                    uuid_from_u16(0x2a19),
                    CharacteristicProperties::READ,
                    AttributePermissions::READABLE,
                )
                .with_value(vec![100]),
            ))
            .with_characteristic(
                CharacteristicDefinition::new(
                    uuid_from_u16(0x2a37),
                    CharacteristicProperties::NOTIFY,
                    AttributePermissions::READABLE,
                )
                .with_descriptor(DescriptorDefinition::new(CLIENT_CHARACTERISTIC_CONFIGURATION_UUID)),
            )
    }

    #[test]
    fn test_identity_round_trip() {
        let mut registry = AttributeRegistry::new();
        let service = registry.register_service(&heart_rate_service()).unwrap();
        assert_eq!(registry.len(), 6);

        let root = registry.resolve_service(service.id).unwrap();
        assert_eq!(root.uuid, uuid_from_u16(0x180d));
        assert_eq!(root.parent, None);

        let included = &service.included_services[0];
        let node = registry.resolve_service(included.id).unwrap();
        assert_eq!(node.kind, AttributeKind::Service { primary: false });
        assert_eq!(node.parent, Some(service.id));

        let battery = &included.characteristics[0];
        let node = registry.resolve_characteristic(battery.id).unwrap();
        assert_eq!(node.parent, Some(included.id));
        assert_eq!(node.value.as_deref(), Some(&[100u8][..]));

        let measurement = &service.characteristics[0];
        let cccd = &measurement.descriptors[0];
        let node = registry.resolve_descriptor(cccd.id).unwrap();
        assert_eq!(node.uuid, CLIENT_CHARACTERISTIC_CONFIGURATION_UUID);
        assert_eq!(node.parent, Some(measurement.id));
    }

    #[test]
    fn test_malformed_tree_is_atomic() {
        let mut registry = AttributeRegistry::new();
        let mut definition = heart_rate_service();
        definition.characteristics.push(None);

        let err = registry.register_service(&definition).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedAttributeTree { .. }));
        assert!(registry.is_empty());
        assert!(registry.root_services().is_empty());
    }

    #[test]
    fn test_malformed_descriptor_slot_rejected() {
        let mut registry = AttributeRegistry::new();
        let mut characteristic = CharacteristicDefinition::new(
            uuid_from_u16(0x2a00),
            CharacteristicProperties::READ,
            AttributePermissions::READABLE,
        );
        characteristic.descriptors.push(None);
        let definition = ServiceDefinition::new(uuid_from_u16(0x1800)).with_characteristic(characteristic);

        let err = registry.register_service(&definition).unwrap_err();
        assert_eq!(
            err,
            BridgeError::MalformedAttributeTree {
                reason: "service.characteristics[0].descriptors[0] is absent".into()
            }
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_removes_exactly_its_identities() {
        let mut registry = AttributeRegistry::new();
        let first = registry.register_service(&heart_rate_service()).unwrap();
        let second = registry
            .register_service(&ServiceDefinition::new(uuid_from_u16(0x1801)))
            .unwrap();

        let removed = registry.unregister_service(first.id).unwrap();
        assert_eq!(removed, first);
        for id in first.identities() {
            assert!(!registry.contains(id));
        }
        assert!(registry.contains(second.id));
        assert_eq!(registry.len(), 1);

        let err = registry.unregister_service(first.id).unwrap_err();
        assert_eq!(err, BridgeError::UnknownAttribute { id: first.id });
    }

    #[test]
    fn test_unregister_detects_corruption() {
        let mut registry = AttributeRegistry::new();
        let service = registry.register_service(&heart_rate_service()).unwrap();
        let descriptor = service.characteristics[0].descriptors[0].id;
        registry.remove_node(descriptor);

        let err = registry.unregister_service(service.id).unwrap_err();
        assert_eq!(err, BridgeError::CorruptAttributeTree { id: descriptor });
        // nothing else was removed
        assert!(registry.contains(service.id));
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_rediscovery_keeps_identity() {
        let mut registry = AttributeRegistry::new();
        let handle = NativeHandle::new(0xbeef);
        let first = registry
            .insert_discovered(handle, uuid_from_u16(0x180d), AttributeKind::Service { primary: true }, None)
            .id;
        let again = registry
            .insert_discovered(handle, uuid_from_u16(0x180d), AttributeKind::Service { primary: true }, None)
            .id;
        assert_eq!(first, again);
        assert_eq!(registry.lookup_handle(handle), Some(first));
        assert_eq!(registry.handle_of(first), Some(handle));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_kind_mismatch() {
        let mut registry = AttributeRegistry::new();
        let id = registry
            .insert_discovered(NativeHandle::new(1), uuid_from_u16(0x180d), AttributeKind::Service { primary: true }, None)
            .id;
        let err = registry.resolve_characteristic(id).unwrap_err();
        assert_eq!(
            err,
            BridgeError::AttributeKindMismatch {
                id,
                expected: "characteristic"
            }
        );
    }

    #[test]
    fn test_identities_are_unique_across_registries() {
        let mut a = AttributeRegistry::new();
        let mut b = AttributeRegistry::new();
        let x = a.register_service(&ServiceDefinition::new(uuid_from_u16(0x1800))).unwrap();
        let y = b.register_service(&ServiceDefinition::new(uuid_from_u16(0x1800))).unwrap();
        assert_ne!(x.id, y.id);
    }
}
