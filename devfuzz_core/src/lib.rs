pub mod callbacks;
pub mod config;
pub mod context;
pub mod fuzzer;
pub mod observation;
pub mod oracle;
pub mod snapshot;
pub mod state;
pub mod tlv;
pub mod transport;
pub mod types;

pub use callbacks::{CoreCallbacks, DeviceCallbacks, MessageKind};
pub use config::Config;
pub use context::{
    ContextError, ResultSlot, RoundCoordinator, RoundOutcome, RoundSignal, RoundStatus,
    RoundUpdate, RoundView,
};
pub use fuzzer::{Fuzzer, FuzzerError, RoundReport, RunSummary, SharedState, TestCase};
pub use observation::{Observation, ObservationLog};
pub use oracle::{Oracle, OracleError, OracleResult, OracleRule, OracleStatus, Outcome, RuleKey};
pub use snapshot::{Snapshot, SnapshotError, load_snapshot, save_snapshot};
pub use state::{DeviceStateStore, StateError};
pub use tlv::{DecodeError, DecodedElement, ElementType, Tag, Value};
pub use transport::{CommandReply, InProcessTransport, Transport, TransportError};
pub use types::{AttributePath, CommandKind, CommandPath, EventPath, ImStatus};
