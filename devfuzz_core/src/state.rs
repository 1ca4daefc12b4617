use crate::snapshot::{
    AttributeEntry, ClusterSnapshot, EndpointSnapshot, NodeSnapshot, Snapshot, SnapshotError,
};
use crate::tlv::{DecodedElement, ElementType};
use crate::types::{
    AttributeId, AttributePath, CLUSTER_REVISION_ATTRIBUTE_ID, ClusterId, DeviceTypeId,
    EndpointId, FabricId, NodeId, VendorId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// The path segment a lookup failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Node(NodeId),
    Endpoint(NodeId, EndpointId),
    Cluster(NodeId, EndpointId, ClusterId),
    Attribute(AttributePath),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Node(node) => write!(f, "node {node}"),
            Segment::Endpoint(node, endpoint) => write!(f, "endpoint {node}/{endpoint}"),
            Segment::Cluster(node, endpoint, cluster) => {
                write!(f, "cluster {node}/{endpoint}/{cluster:#06x}")
            }
            Segment::Attribute(path) => write!(f, "attribute {path}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// A node, endpoint, cluster or attribute on the requested path does not exist.
    #[error("{0} not found")]
    NotFound(Segment),

    /// The read gate is off, or the requested generation was never written.
    #[error("Attribute {0} is unreadable")]
    Unreadable(AttributePath),

    /// A non-null write whose kind differs from the one fixed by the first write.
    #[error("Attribute {path} holds {expected}, refusing a write of {found}")]
    TypeMismatch {
        path: AttributePath,
        expected: String,
        found: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Current,
    Previous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
    #[default]
    Mandatory,
    Nullable,
}

/// Kind fixed by the first non-null write of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeMeta {
    pub element_type: ElementType,
    pub width: u8,
}

impl AttributeMeta {
    fn of(element: &DecodedElement) -> Self {
        Self {
            element_type: element.element_type(),
            width: element.width(),
        }
    }

    /// String length prefixes are an encoding choice of the sender, so only the
    /// kind is compared for strings and containers.
    fn accepts(&self, element: &DecodedElement) -> bool {
        if self.element_type != element.element_type() {
            return false;
        }
        match self.element_type {
            ElementType::SignedInteger | ElementType::UnsignedInteger | ElementType::Float => {
                self.width == element.width()
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeState {
    current: Option<DecodedElement>,
    previous: Option<DecodedElement>,
    readable: bool,
    meta: Option<AttributeMeta>,
    quality: Quality,
}

impl Default for AttributeState {
    fn default() -> Self {
        Self {
            current: None,
            previous: None,
            readable: true,
            meta: None,
            quality: Quality::Mandatory,
        }
    }
}

impl AttributeState {
    pub fn current(&self) -> Option<&DecodedElement> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&DecodedElement> {
        self.previous.as_ref()
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn meta(&self) -> Option<AttributeMeta> {
        self.meta
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceType {
    pub id: DeviceTypeId,
    pub revision: u16,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterState {
    pub revision: u16,
    attributes: BTreeMap<AttributeId, AttributeState>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointState {
    device_types: Vec<DeviceType>,
    clusters: BTreeMap<ClusterId, ClusterState>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeState {
    endpoints: BTreeMap<EndpointId, EndpointState>,
}

/// Mirror of everything the fuzzer has learned about the devices under test.
///
/// Nodes, endpoints and clusters only come into existence through the `add_*`
/// calls. Attributes are the one exception: a write to an existing cluster creates
/// the attribute leaf on demand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceStateStore {
    fabric: Option<FabricId>,
    vendor: Option<VendorId>,
    nodes: BTreeMap<NodeId, NodeState>,
}

impl DeviceStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_identity(&mut self, fabric: FabricId, vendor: VendorId) {
        self.fabric = Some(fabric);
        self.vendor = Some(vendor);
    }

    pub fn fabric(&self) -> Option<FabricId> {
        self.fabric
    }

    pub fn vendor(&self) -> Option<VendorId> {
        self.vendor
    }

    pub fn add_node(&mut self, node: NodeId) {
        self.nodes.entry(node).or_default();
    }

    pub fn add_endpoint(&mut self, node: NodeId, endpoint: EndpointId) -> Result<(), StateError> {
        self.node_mut(node)?.endpoints.entry(endpoint).or_default();
        Ok(())
    }

    /// Adds a cluster. An already known cluster keeps its current revision.
    pub fn add_cluster(
        &mut self,
        node: NodeId,
        endpoint: EndpointId,
        cluster: ClusterId,
        revision: u16,
    ) -> Result<(), StateError> {
        self.endpoint_mut(node, endpoint)?
            .clusters
            .entry(cluster)
            .or_insert_with(|| ClusterState {
                revision,
                attributes: BTreeMap::new(),
            });
        Ok(())
    }

    pub fn add_attribute(&mut self, path: AttributePath) -> Result<(), StateError> {
        self.cluster_mut(path.node, path.endpoint, path.cluster)?
            .attributes
            .entry(path.attribute)
            .or_default();
        Ok(())
    }

    /// Records a device type on an endpoint. A device type reported again only has
    /// its revision refreshed.
    pub fn add_device_type(
        &mut self,
        node: NodeId,
        endpoint: EndpointId,
        device_type: DeviceType,
    ) -> Result<(), StateError> {
        let device_types = &mut self.endpoint_mut(node, endpoint)?.device_types;
        match device_types.iter_mut().find(|d| d.id == device_type.id) {
            Some(existing) => existing.revision = device_type.revision,
            None => device_types.push(device_type),
        }
        Ok(())
    }

    pub fn read(
        &self,
        path: AttributePath,
        generation: Generation,
    ) -> Result<&DecodedElement, StateError> {
        let attribute = self.attribute(path)?;
        if !attribute.readable {
            return Err(StateError::Unreadable(path));
        }
        let value = match generation {
            Generation::Current => attribute.current.as_ref(),
            Generation::Previous => attribute.previous.as_ref(),
        };
        value.ok_or(StateError::Unreadable(path))
    }

    pub fn read_current(&self, path: AttributePath) -> Result<&DecodedElement, StateError> {
        self.read(path, Generation::Current)
    }

    pub fn read_last(&self, path: AttributePath) -> Result<&DecodedElement, StateError> {
        self.read(path, Generation::Previous)
    }

    pub fn write(
        &mut self,
        path: AttributePath,
        element: DecodedElement,
    ) -> Result<(), StateError> {
        let cluster = self.cluster_mut(path.node, path.endpoint, path.cluster)?;
        let attribute = cluster.attributes.entry(path.attribute).or_default();

        if element.element_type() == ElementType::Null {
            attribute.quality = Quality::Nullable;
        } else {
            match attribute.meta {
                Some(meta) if !meta.accepts(&element) => {
                    return Err(StateError::TypeMismatch {
                        path,
                        expected: crate::tlv::type_name(meta.element_type, meta.width),
                        found: element.type_name(),
                    });
                }
                Some(_) => {}
                None => attribute.meta = Some(AttributeMeta::of(&element)),
            }
        }

        let revision = (path.attribute == CLUSTER_REVISION_ATTRIBUTE_ID)
            .then(|| element.as_u64().and_then(|v| u16::try_from(v).ok()))
            .flatten();

        attribute.previous = attribute.current.replace(element);
        if let Some(revision) = revision {
            cluster.revision = revision;
        }
        Ok(())
    }

    /// Flips the read gate of an attribute and returns the new state of the gate.
    pub fn toggle_read_block(&mut self, path: AttributePath) -> Result<bool, StateError> {
        let attribute = self.attribute_mut(path)?;
        attribute.readable = !attribute.readable;
        Ok(attribute.readable)
    }

    pub fn is_readable(&self, path: AttributePath) -> Result<bool, StateError> {
        Ok(self.attribute(path)?.readable)
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn endpoints(&self, node: NodeId) -> Result<Vec<EndpointId>, StateError> {
        Ok(self.node(node)?.endpoints.keys().copied().collect())
    }

    pub fn clusters(
        &self,
        node: NodeId,
        endpoint: EndpointId,
    ) -> Result<Vec<ClusterId>, StateError> {
        Ok(self.endpoint(node, endpoint)?.clusters.keys().copied().collect())
    }

    pub fn attributes(
        &self,
        node: NodeId,
        endpoint: EndpointId,
        cluster: ClusterId,
    ) -> Result<Vec<AttributeId>, StateError> {
        Ok(self
            .cluster(node, endpoint, cluster)?
            .attributes
            .keys()
            .copied()
            .collect())
    }

    pub fn device_types(
        &self,
        node: NodeId,
        endpoint: EndpointId,
    ) -> Result<&[DeviceType], StateError> {
        Ok(&self.endpoint(node, endpoint)?.device_types)
    }

    pub fn cluster_revision(
        &self,
        node: NodeId,
        endpoint: EndpointId,
        cluster: ClusterId,
    ) -> Result<u16, StateError> {
        Ok(self.cluster(node, endpoint, cluster)?.revision)
    }

    pub fn attribute(&self, path: AttributePath) -> Result<&AttributeState, StateError> {
        self.cluster(path.node, path.endpoint, path.cluster)?
            .attributes
            .get(&path.attribute)
            .ok_or(StateError::NotFound(Segment::Attribute(path)))
    }

    /// Captures the whole tree. Attributes that are gated or were never written are
    /// recorded as unreadable.
    pub fn dump(&self, history: &[String]) -> Snapshot {
        let nodes = self
            .nodes
            .iter()
            .map(|(&node, node_state)| {
                let endpoints = node_state
                    .endpoints
                    .iter()
                    .map(|(&endpoint, endpoint_state)| {
                        let clusters = endpoint_state
                            .clusters
                            .iter()
                            .map(|(&cluster, cluster_state)| {
                                let attributes = cluster_state
                                    .attributes
                                    .iter()
                                    .map(|(&attribute, state)| {
                                        let entry = match (&state.current, state.readable) {
                                            (Some(value), true) => {
                                                AttributeEntry::value(value.clone())
                                            }
                                            _ => AttributeEntry::unreadable(),
                                        };
                                        (attribute, entry)
                                    })
                                    .collect();
                                (
                                    cluster,
                                    ClusterSnapshot {
                                        revision: cluster_state.revision,
                                        attributes,
                                    },
                                )
                            })
                            .collect();
                        (
                            endpoint,
                            EndpointSnapshot {
                                device_types: endpoint_state.device_types.clone(),
                                clusters,
                            },
                        )
                    })
                    .collect();
                (node, NodeSnapshot { endpoints })
            })
            .collect();

        Snapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            fabric_id: self.fabric,
            vendor_id: self.vendor,
            nodes,
            history: history.to_vec(),
        }
    }

    /// Replaces the whole tree with the contents of `snapshot`.
    ///
    /// Unreadable entries come back as attributes with no value. On error the store
    /// is left untouched.
    pub fn load(&mut self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let mut restored = DeviceStateStore {
            fabric: snapshot.fabric_id,
            vendor: snapshot.vendor_id,
            nodes: BTreeMap::new(),
        };
        for (&node, node_snapshot) in &snapshot.nodes {
            restored.add_node(node);
            for (&endpoint, endpoint_snapshot) in &node_snapshot.endpoints {
                restored.add_endpoint(node, endpoint)?;
                for &device_type in &endpoint_snapshot.device_types {
                    restored.add_device_type(node, endpoint, device_type)?;
                }
                for (&cluster, cluster_snapshot) in &endpoint_snapshot.clusters {
                    restored.add_cluster(node, endpoint, cluster, cluster_snapshot.revision)?;
                    for (&attribute, entry) in &cluster_snapshot.attributes {
                        let path = AttributePath::new(node, endpoint, cluster, attribute);
                        restored.add_attribute(path)?;
                        if let Some(value) = entry.element() {
                            restored.write(path, value.clone())?;
                        }
                    }
                    // A stored revision attribute must not override the recorded revision.
                    restored.cluster_mut(node, endpoint, cluster)?.revision =
                        cluster_snapshot.revision;
                }
            }
        }
        *self = restored;
        Ok(())
    }

    fn node(&self, node: NodeId) -> Result<&NodeState, StateError> {
        self.nodes
            .get(&node)
            .ok_or(StateError::NotFound(Segment::Node(node)))
    }

    fn node_mut(&mut self, node: NodeId) -> Result<&mut NodeState, StateError> {
        self.nodes
            .get_mut(&node)
            .ok_or(StateError::NotFound(Segment::Node(node)))
    }

    fn endpoint(&self, node: NodeId, endpoint: EndpointId) -> Result<&EndpointState, StateError> {
        self.node(node)?
            .endpoints
            .get(&endpoint)
            .ok_or(StateError::NotFound(Segment::Endpoint(node, endpoint)))
    }

    fn endpoint_mut(
        &mut self,
        node: NodeId,
        endpoint: EndpointId,
    ) -> Result<&mut EndpointState, StateError> {
        self.node_mut(node)?
            .endpoints
            .get_mut(&endpoint)
            .ok_or(StateError::NotFound(Segment::Endpoint(node, endpoint)))
    }

    fn cluster(
        &self,
        node: NodeId,
        endpoint: EndpointId,
        cluster: ClusterId,
    ) -> Result<&ClusterState, StateError> {
        self.endpoint(node, endpoint)?
            .clusters
            .get(&cluster)
            .ok_or(StateError::NotFound(Segment::Cluster(node, endpoint, cluster)))
    }

    fn cluster_mut(
        &mut self,
        node: NodeId,
        endpoint: EndpointId,
        cluster: ClusterId,
    ) -> Result<&mut ClusterState, StateError> {
        self.endpoint_mut(node, endpoint)?
            .clusters
            .get_mut(&cluster)
            .ok_or(StateError::NotFound(Segment::Cluster(node, endpoint, cluster)))
    }

    fn attribute_mut(&mut self, path: AttributePath) -> Result<&mut AttributeState, StateError> {
        self.cluster_mut(path.node, path.endpoint, path.cluster)?
            .attributes
            .get_mut(&path.attribute)
            .ok_or(StateError::NotFound(Segment::Attribute(path)))
    }
}
