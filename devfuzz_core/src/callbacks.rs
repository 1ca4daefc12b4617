use crate::context::{ContextError, RoundCoordinator, RoundUpdate};
use crate::oracle::{Oracle, OracleStatus, Outcome};
use crate::state::DeviceStateStore;
use crate::tlv::{self, FirstStructureChild, PayloadLocator};
use crate::types::{
    AttributePath, CommandPath, EventPath, ImStatus, is_manufacturer_testing_cluster,
};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Kind of exchange an asynchronous error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Invoke,
    Write,
    Read,
    Subscribe,
    Session,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Invoke => "invoke",
            MessageKind::Write => "write",
            MessageKind::Read => "read",
            MessageKind::Subscribe => "subscribe",
            MessageKind::Session => "session",
        };
        f.write_str(name)
    }
}

/// Entry points the transport layer calls when something arrives from a device.
///
/// Implementations are called from arbitrary threads, possibly concurrently with
/// each other and with the driver.
pub trait DeviceCallbacks: Send + Sync {
    /// The device answered a command or write issued by the current round.
    fn on_command_response(&self, path: &CommandPath, status: ImStatus, raw: Option<&[u8]>);

    /// An attribute report arrived, typically through a subscription.
    fn on_attribute_report(&self, path: AttributePath, status: ImStatus, raw: Option<&[u8]>);

    fn on_event_report(&self, path: EventPath, status: ImStatus, raw: Option<&[u8]>);

    /// The exchange failed below the interaction model. `code` is transport specific;
    /// codes that are not interaction-model statuses are treated as `Failure`.
    fn on_error(&self, kind: MessageKind, code: u32);
}

/// Wires device callbacks into the state store, the oracle and the live round.
///
/// The store and oracle locks are never held while the round coordinator is called.
#[derive(Clone)]
pub struct CoreCallbacks {
    store: Arc<Mutex<DeviceStateStore>>,
    oracle: Arc<Mutex<Oracle>>,
    coordinator: Arc<RoundCoordinator>,
    locator: Arc<dyn PayloadLocator>,
}

impl CoreCallbacks {
    pub fn new(
        store: Arc<Mutex<DeviceStateStore>>,
        oracle: Arc<Mutex<Oracle>>,
        coordinator: Arc<RoundCoordinator>,
    ) -> Self {
        Self {
            store,
            oracle,
            coordinator,
            locator: Arc::new(FirstStructureChild),
        }
    }

    pub fn with_locator(mut self, locator: Arc<dyn PayloadLocator>) -> Self {
        self.locator = locator;
        self
    }

    fn update_round(&self, update: RoundUpdate) {
        if let Err(e) = self.coordinator.update(update) {
            match e {
                ContextError::NoContext | ContextError::Terminated(_) => {
                    debug!(error = %e, "callback update found no live round")
                }
                other => warn!(error = %other, "callback update rejected"),
            }
        }
    }

    fn judge(&self, path: &CommandPath, status: ImStatus) {
        let verdict = self
            .oracle
            .lock()
            .consume_path(path, Outcome::Status(status));
        match verdict {
            OracleStatus::UnexpectedResponse => {
                warn!(%path, %status, "unexpected response")
            }
            OracleStatus::Unreachable => error!(%path, "device unreachable"),
            OracleStatus::Timeout => warn!(%path, "device timed out"),
            _ => debug!(%path, %status, ?verdict, "response conforms"),
        }
    }

    fn gate_unreadable(&self, path: AttributePath, status: ImStatus) {
        let read_failure = matches!(
            status,
            ImStatus::UnsupportedRead | ImStatus::UnsupportedAccess | ImStatus::Failure
        );
        let gate = status == ImStatus::UnsupportedRead
            || (read_failure && is_manufacturer_testing_cluster(path.cluster));
        if !gate {
            return;
        }

        let mut store = self.store.lock();
        if let Err(e) = store.add_attribute(path) {
            debug!(%path, error = %e, "cannot gate an attribute outside the known tree");
            return;
        }
        if store.is_readable(path) == Ok(true) && store.toggle_read_block(path).is_ok() {
            info!(%path, %status, "attribute read gate closed");
        }
    }
}

impl DeviceCallbacks for CoreCallbacks {
    fn on_command_response(&self, path: &CommandPath, status: ImStatus, raw: Option<&[u8]>) {
        if let Some(raw) = raw.filter(|r| !r.is_empty()) {
            match tlv::decode(raw) {
                Ok(element) => debug!(%path, response = %element, "command response"),
                Err(e) => warn!(
                    %path,
                    error = %e,
                    raw = %hex::encode(raw),
                    "undecodable command response"
                ),
            }
        }

        self.judge(path, status);
        self.update_round(RoundUpdate::Response(status));
    }

    fn on_attribute_report(&self, path: AttributePath, status: ImStatus, raw: Option<&[u8]>) {
        if status != ImStatus::Success {
            self.gate_unreadable(path, status);
            return;
        }
        let Some(raw) = raw else {
            return;
        };

        let envelope = match tlv::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%path, error = %e, raw = %hex::encode(raw), "undecodable attribute report");
                return;
            }
        };
        let Some(payload) = self.locator.locate(&envelope) else {
            warn!(%path, "attribute report carries no payload");
            return;
        };

        let written = self.store.lock().write(path, payload.clone());
        match written {
            Ok(()) => {
                debug!(%path, value = %payload, "attribute updated");
                self.update_round(RoundUpdate::ChangedAttributes(BTreeSet::from([path])));
            }
            Err(e) => warn!(%path, error = %e, "attribute report not stored"),
        }
    }

    fn on_event_report(&self, path: EventPath, status: ImStatus, raw: Option<&[u8]>) {
        match raw.map(tlv::decode) {
            Some(Ok(element)) => info!(%path, %status, event = %element, "event report"),
            Some(Err(e)) => warn!(%path, error = %e, "undecodable event report"),
            None => info!(%path, %status, "event report without payload"),
        }
    }

    fn on_error(&self, kind: MessageKind, code: u32) {
        let status = u8::try_from(code)
            .map(ImStatus::from_code)
            .ok()
            .filter(|s| !matches!(s, ImStatus::Unknown(_)))
            .unwrap_or(ImStatus::Failure);
        error!(%kind, code = format_args!("{code:#x}"), %status, "exchange failed");

        let pending = self
            .coordinator
            .view()
            .ok()
            .and_then(|round| round.command_path);
        if let Some(path) = pending {
            self.judge(&path, status);
        }
        self.update_round(RoundUpdate::Response(status));
    }
}
