use std::fmt;

pub type NodeId = u64;
pub type FabricId = u64;
pub type VendorId = u16;
pub type EndpointId = u16;
pub type ClusterId = u32;
pub type AttributeId = u32;
pub type CommandId = u32;
pub type DeviceTypeId = u32;
pub type EventId = u32;

pub const INVALID_ENDPOINT_ID: EndpointId = 0xFFFF;
pub const INVALID_CLUSTER_ID: ClusterId = 0xFFFF_FFFF;
pub const INVALID_SUBJECT_ID: u32 = 0xFFFF_FFFF;

/// Global attribute carrying the revision of the cluster it belongs to.
pub const CLUSTER_REVISION_ATTRIBUTE_ID: AttributeId = 0xFFFD;

/// Fully qualified location of one attribute on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttributePath {
    pub node: NodeId,
    pub endpoint: EndpointId,
    pub cluster: ClusterId,
    pub attribute: AttributeId,
}

impl AttributePath {
    pub fn new(
        node: NodeId,
        endpoint: EndpointId,
        cluster: ClusterId,
        attribute: AttributeId,
    ) -> Self {
        Self {
            node,
            endpoint,
            cluster,
            attribute,
        }
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{:#06x}/{:#06x}",
            self.node, self.endpoint, self.cluster, self.attribute
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventPath {
    pub node: NodeId,
    pub endpoint: EndpointId,
    pub cluster: ClusterId,
    pub event: EventId,
}

impl fmt::Display for EventPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{:#06x}/event {:#06x}",
            self.node, self.endpoint, self.cluster, self.event
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CommandKind {
    Invoke,
    WriteAttribute,
}

/// The interaction a fuzzing round drives: a command invocation or an attribute write.
///
/// `id` is a command id for [`CommandKind::Invoke`] and an attribute id for
/// [`CommandKind::WriteAttribute`]. The destination node is carried by the round, not the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandPath {
    pub endpoint: EndpointId,
    pub cluster: ClusterId,
    pub id: u32,
    pub kind: CommandKind,
}

impl CommandPath {
    pub fn invoke(endpoint: EndpointId, cluster: ClusterId, command: CommandId) -> Self {
        Self {
            endpoint,
            cluster,
            id: command,
            kind: CommandKind::Invoke,
        }
    }

    pub fn write(endpoint: EndpointId, cluster: ClusterId, attribute: AttributeId) -> Self {
        Self {
            endpoint,
            cluster,
            id: attribute,
            kind: CommandKind::WriteAttribute,
        }
    }

    pub fn is_command(&self) -> bool {
        self.kind == CommandKind::Invoke
    }
}

impl fmt::Display for CommandPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.kind {
            CommandKind::Invoke => "invoke",
            CommandKind::WriteAttribute => "write",
        };
        write!(
            f,
            "{verb} e={} c={:#06x} id={:#06x}",
            self.endpoint, self.cluster, self.id
        )
    }
}

macro_rules! im_status_codes {
    ($($name:ident = $code:literal),+ $(,)?) => {
        /// Interaction-model status codes reported by a device.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum ImStatus {
            $($name,)+
            Unknown(u8),
        }

        impl ImStatus {
            pub fn code(self) -> u8 {
                match self {
                    $(ImStatus::$name => $code,)+
                    ImStatus::Unknown(code) => code,
                }
            }

            pub fn from_code(code: u8) -> Self {
                match code {
                    $($code => ImStatus::$name,)+
                    other => ImStatus::Unknown(other),
                }
            }
        }
    };
}

im_status_codes! {
    Success = 0x00,
    Failure = 0x01,
    InvalidSubscription = 0x7D,
    UnsupportedAccess = 0x7E,
    UnsupportedEndpoint = 0x7F,
    InvalidAction = 0x80,
    UnsupportedCommand = 0x81,
    InvalidCommand = 0x85,
    UnsupportedAttribute = 0x86,
    ConstraintError = 0x87,
    UnsupportedWrite = 0x88,
    ResourceExhausted = 0x89,
    NotFound = 0x8B,
    UnreportableAttribute = 0x8C,
    InvalidDataType = 0x8D,
    UnsupportedRead = 0x8F,
    DataVersionMismatch = 0x92,
    Timeout = 0x94,
    UnsupportedNode = 0x9B,
    Busy = 0x9C,
    AccessRestricted = 0x9D,
    UnsupportedCluster = 0xC3,
    NoUpstreamSubscription = 0xC5,
    NeedsTimedInteraction = 0xC6,
    UnsupportedEvent = 0xC7,
    PathsExhausted = 0xC8,
    TimedRequestMismatch = 0xC9,
    FailsafeRequired = 0xCA,
    InvalidInState = 0xCB,
    NoCommandResponse = 0xCC,
}

impl From<u8> for ImStatus {
    fn from(code: u8) -> Self {
        ImStatus::from_code(code)
    }
}

impl From<ImStatus> for u8 {
    fn from(status: ImStatus) -> Self {
        status.code()
    }
}

impl fmt::Display for ImStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImStatus::Unknown(code) => write!(f, "Unknown({code:#04x})"),
            known => write!(f, "{known:?}"),
        }
    }
}

/// Standard clusters live in `0x0000_0000..=0x0007_FFFF`. Manufacturer-specific
/// clusters whose manufacturer code falls in `0xFFF1..=0xFFF4` are reserved for testing.
pub fn is_manufacturer_testing_cluster(cluster: ClusterId) -> bool {
    let manufacturer_code = cluster & 0xFFFF_0000;
    let product_code = cluster & 0x0000_FFFE;
    (0xFFF1_0000..=0xFFF4_0000).contains(&manufacturer_code) && product_code >= 0xFC00
}
