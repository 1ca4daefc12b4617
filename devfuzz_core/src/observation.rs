use crate::types::{AttributePath, CommandKind, CommandPath, ImStatus};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// What one finished round did to the device: the command it issued, the status the
/// device answered with, and the attributes reported as changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub round: u64,
    pub path: CommandPath,
    pub status: Option<ImStatus>,
    pub changed: BTreeSet<AttributePath>,
}

impl Observation {
    /// Canonical encoding used for deduplication. The round id is left out, so the
    /// same behaviour seen in two rounds has one digest.
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(16 + self.changed.len() * 18);
        bytes.extend_from_slice(&self.path.endpoint.to_le_bytes());
        bytes.extend_from_slice(&self.path.cluster.to_le_bytes());
        bytes.extend_from_slice(&self.path.id.to_le_bytes());
        bytes.push(match self.path.kind {
            CommandKind::Invoke => 0,
            CommandKind::WriteAttribute => 1,
        });
        match self.status {
            Some(status) => bytes.extend_from_slice(&[1, status.code()]),
            None => bytes.extend_from_slice(&[0, 0]),
        }
        for changed in &self.changed {
            bytes.extend_from_slice(&changed.node.to_le_bytes());
            bytes.extend_from_slice(&changed.endpoint.to_le_bytes());
            bytes.extend_from_slice(&changed.cluster.to_le_bytes());
            bytes.extend_from_slice(&changed.attribute.to_le_bytes());
        }
        bytes
    }

    pub fn digest(&self) -> [u8; 16] {
        md5::compute(self.canonical_bytes()).0
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "round {} {} -> ", self.round, self.path)?;
        match self.status {
            Some(status) => write!(f, "{status}")?,
            None => write!(f, "no response")?,
        }
        if !self.changed.is_empty() {
            write!(f, " changed [")?;
            for (i, path) in self.changed.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{path}")?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// Keeps the first occurrence of every distinct observation.
#[derive(Debug, Default)]
pub struct ObservationLog {
    known_hashes: HashSet<[u8; 16]>,
    records: Vec<Observation>,
}

impl ObservationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `observation` unless an identical one was already recorded. Returns
    /// whether it was new.
    pub fn record(&mut self, observation: Observation) -> bool {
        if !self.known_hashes.insert(observation.digest()) {
            return false;
        }
        self.records.push(observation);
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.records.iter()
    }

    /// Takes the stored records. Digests are kept, so drained observations stay
    /// deduplicated.
    pub fn drain(&mut self) -> Vec<Observation> {
        std::mem::take(&mut self.records)
    }
}
