use crate::state::{DeviceType, StateError};
use crate::tlv::DecodedElement;
use crate::types::{AttributeId, AttributePath, ClusterId, EndpointId, FabricId, NodeId, VendorId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Errors raised while writing or reading device-state snapshot files.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// An I/O error while creating the snapshot directory or touching a snapshot file.
    #[error("Snapshot I/O error: {0}")]
    Io(String),

    #[error("Snapshot serialization error: {0}")]
    Serialization(String),

    #[error("Snapshot deserialization error: {0}")]
    Deserialization(String),

    /// The file parsed, but its contents cannot be turned back into a device tree.
    #[error("Malformed snapshot: {0}")]
    Malformed(String),
}

impl From<std::io::Error> for SnapshotError {
    fn from(err: std::io::Error) -> Self {
        SnapshotError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for SnapshotError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            SnapshotError::Io(err.to_string())
        } else {
            SnapshotError::Deserialization(format!("JSON operation error: {}", err))
        }
    }
}
impl From<StateError> for SnapshotError {
    fn from(err: StateError) -> Self {
        SnapshotError::Malformed(err.to_string())
    }
}

/// Marker stored in place of an attribute value that could not be read.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreadableMarker {
    #[serde(rename = "unreadable")]
    Unreadable,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum AttributeEntry {
    Unreadable(UnreadableMarker),
    Value {
        #[serde(rename = "type")]
        type_name: String,
        value: DecodedElement,
    },
}

impl AttributeEntry {
    pub fn value(element: DecodedElement) -> Self {
        AttributeEntry::Value {
            type_name: element.type_name(),
            value: element,
        }
    }

    pub fn unreadable() -> Self {
        AttributeEntry::Unreadable(UnreadableMarker::Unreadable)
    }

    pub fn element(&self) -> Option<&DecodedElement> {
        match self {
            AttributeEntry::Value { value, .. } => Some(value),
            AttributeEntry::Unreadable(_) => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClusterSnapshot {
    pub revision: u16,
    pub attributes: BTreeMap<AttributeId, AttributeEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSnapshot {
    pub device_types: Vec<DeviceType>,
    pub clusters: BTreeMap<ClusterId, ClusterSnapshot>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub endpoints: BTreeMap<EndpointId, EndpointSnapshot>,
}

/// Serializable image of a [`DeviceStateStore`](crate::state::DeviceStateStore) plus the
/// command history that produced it.
///
/// Every map is a `BTreeMap`, so two dumps of the same tree are byte-identical apart
/// from the timestamp.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// RFC 3339 time of capture.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fabric_id: Option<FabricId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<VendorId>,
    pub nodes: BTreeMap<NodeId, NodeSnapshot>,
    #[serde(default)]
    pub history: Vec<String>,
}

impl Snapshot {
    pub fn attribute(&self, path: AttributePath) -> Option<&AttributeEntry> {
        self.nodes
            .get(&path.node)?
            .endpoints
            .get(&path.endpoint)?
            .clusters
            .get(&path.cluster)?
            .attributes
            .get(&path.attribute)
    }

    /// Number of attribute entries across all nodes, readable or not.
    pub fn attribute_count(&self) -> usize {
        self.nodes
            .values()
            .flat_map(|n| n.endpoints.values())
            .flat_map(|e| e.clusters.values())
            .map(|c| c.attributes.len())
            .sum()
    }
}

/// Writes `snapshot` as pretty JSON into `dir`, creating the directory if needed.
///
/// Files are named after the capture time; an existing file is never overwritten.
pub fn save_snapshot(dir: &Path, snapshot: &Snapshot) -> Result<PathBuf, SnapshotError> {
    fs::create_dir_all(dir)?;

    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let mut path = dir.join(format!("statedump_{stamp}.json"));
    let mut suffix = 1u32;
    while path.exists() {
        path = dir.join(format!("statedump_{stamp}_{suffix}.json"));
        suffix += 1;
    }

    let file = File::create(&path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, snapshot)
        .map_err(|e| SnapshotError::Serialization(format!("JSON operation error: {}", e)))?;
    writer.flush()?;

    info!(path = %path.display(), nodes = snapshot.nodes.len(), "snapshot written");
    Ok(path)
}

pub fn load_snapshot(path: &Path) -> Result<Snapshot, SnapshotError> {
    let file = File::open(path)?;
    let snapshot: Snapshot = serde_json::from_reader(BufReader::new(file))?;
    chrono::DateTime::parse_from_rfc3339(&snapshot.timestamp).map_err(|e| {
        SnapshotError::Malformed(format!("timestamp {:?}: {}", snapshot.timestamp, e))
    })?;
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DeviceStateStore;
    use tempfile::tempdir;

    fn sample_store() -> DeviceStateStore {
        let mut store = DeviceStateStore::new();
        store.add_node(1);
        store.add_endpoint(1, 1).unwrap();
        store
            .add_device_type(1, 1, DeviceType { id: 0x100, revision: 3 })
            .unwrap();
        store.add_cluster(1, 1, 6, 4).unwrap();
        store
            .write(AttributePath::new(1, 1, 6, 0), DecodedElement::bool(true))
            .unwrap();
        store.add_attribute(AttributePath::new(1, 1, 6, 0x4001)).unwrap();
        store
    }

    #[test]
    fn save_and_load_snapshot_round_trip() {
        let dir = tempdir().unwrap();
        let snapshot = sample_store().dump(&["history line".to_string()]);

        let path = save_snapshot(dir.path(), &snapshot).unwrap();
        assert!(path.starts_with(dir.path()));

        let loaded = load_snapshot(&path).unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.attribute_count(), 2);
    }

    #[test]
    fn json_uses_the_documented_shape() {
        let snapshot = sample_store().dump(&[]);
        let json = serde_json::to_value(&snapshot).unwrap();

        let endpoint = &json["nodes"]["1"]["endpoints"]["1"];
        assert_eq!(endpoint["deviceTypes"][0]["id"], 0x100);
        let attributes = &endpoint["clusters"]["6"]["attributes"];
        assert_eq!(attributes["0"]["type"], "boolean");
        assert_eq!(attributes["0"]["value"]["value"], true);
        assert_eq!(attributes["16385"], "unreadable");
        assert!(json.get("fabricId").is_none(), "absent identity is omitted");
    }

    #[test]
    fn saves_never_overwrite_each_other() {
        let dir = tempdir().unwrap();
        let snapshot = sample_store().dump(&[]);
        let first = save_snapshot(dir.path(), &snapshot).unwrap();
        let second = save_snapshot(dir.path(), &snapshot).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn load_rejects_bad_json_and_bad_timestamps() {
        let dir = tempdir().unwrap();

        let garbage = dir.path().join("garbage.json");
        fs::write(&garbage, "{ not json").unwrap();
        assert!(matches!(
            load_snapshot(&garbage),
            Err(SnapshotError::Deserialization(_))
        ));

        let stale = dir.path().join("stale.json");
        fs::write(&stale, r#"{"timestamp":"yesterday","nodes":{}}"#).unwrap();
        assert!(matches!(
            load_snapshot(&stale),
            Err(SnapshotError::Malformed(_))
        ));

        assert!(matches!(
            load_snapshot(&dir.path().join("missing.json")),
            Err(SnapshotError::Io(_))
        ));
    }

    #[test]
    fn entry_values_are_validated_on_load() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00Z","nodes":{"1":{"endpoints":{"0":{
            "deviceTypes":[],"clusters":{"6":{"revision":1,"attributes":{
            "0":{"type":"boolean","value":{"type":"boolean","width":4,"value":true}}}}}}}}}}"#;
        assert!(serde_json::from_str::<Snapshot>(json).is_err());
    }
}
