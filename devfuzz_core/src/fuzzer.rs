use crate::callbacks::{CoreCallbacks, DeviceCallbacks, MessageKind};
use crate::config::Config;
use crate::context::{
    ContextError, ResultSlot, RoundCoordinator, RoundOutcome, RoundSignal, RoundUpdate,
};
use crate::oracle::{Oracle, OracleError, OracleStatus};
use crate::snapshot::{SnapshotError, save_snapshot};
use crate::state::{DeviceStateStore, StateError};
use crate::tlv::{self, DecodeError, DecodedElement};
use crate::transport::{Transport, TransportError};
use crate::types::{CommandKind, CommandPath, ImStatus, NodeId};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, info_span, warn};

#[derive(Error, Debug)]
pub enum FuzzerError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The oracle declared the device unreachable. Ends the run.
    #[error("Device stopped responding during round {round}")]
    Unreachable { round: u64 },
}

/// One interaction to replay against the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub path: CommandPath,
    /// Encoded command fields or attribute value.
    pub payload: Vec<u8>,
}

impl TestCase {
    pub fn new(path: CommandPath, payload: Vec<u8>) -> Self {
        Self { path, payload }
    }

    pub fn from_element(path: CommandPath, element: &DecodedElement) -> Self {
        Self::new(path, tlv::encode(element))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    pub round: u64,
    pub outcome: RoundOutcome,
    /// Status the device answered with, if any arrived.
    pub response: Option<ImStatus>,
    pub verdict: OracleStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub rounds: usize,
    pub subscription_timeouts: usize,
    pub unexpected_responses: usize,
    /// Round during which the device became unreachable, if it did.
    pub unreachable_at: Option<u64>,
    pub observations: usize,
}

/// Handles shared between the driver and the callback threads.
#[derive(Clone)]
pub struct SharedState {
    pub store: Arc<Mutex<DeviceStateStore>>,
    pub oracle: Arc<Mutex<Oracle>>,
    pub coordinator: Arc<RoundCoordinator>,
}

impl SharedState {
    pub fn new(config: &Config) -> Self {
        Self {
            store: Arc::new(Mutex::new(DeviceStateStore::new())),
            oracle: Arc::new(Mutex::new(Oracle::new(
                config.oracle.unreachable_timeout_streak,
            ))),
            coordinator: Arc::new(RoundCoordinator::new(
                config.round.subscription_wait(),
                config.round.subscription_timeout_limit,
            )),
        }
    }

    pub fn callbacks(&self) -> CoreCallbacks {
        CoreCallbacks::new(
            Arc::clone(&self.store),
            Arc::clone(&self.oracle),
            Arc::clone(&self.coordinator),
        )
    }
}

/// Drives fuzzing rounds against one device, one round at a time.
pub struct Fuzzer<T: Transport> {
    config: Config,
    shared: SharedState,
    callbacks: CoreCallbacks,
    signal: Arc<RoundSignal>,
    transport: T,
    history: Vec<String>,
}

impl<T: Transport> Fuzzer<T> {
    pub fn new(config: Config, transport: T) -> Self {
        let shared = SharedState::new(&config);
        Self::with_shared(config, shared, transport)
    }

    /// Builds a fuzzer around state the caller already handed to its transport layer.
    pub fn with_shared(config: Config, shared: SharedState, transport: T) -> Self {
        let callbacks = shared.callbacks();
        Self {
            config,
            shared,
            callbacks,
            signal: Arc::new(RoundSignal::new()),
            transport,
            history: Vec::new(),
        }
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Runs one full round for `case`.
    ///
    /// A failing round is always force-closed so the next round can start.
    ///
    /// # Errors
    /// `Unreachable` once the oracle declares the device unreachable; coordinator
    /// errors if the round could not be driven.
    pub fn run_case(&mut self, case: &TestCase) -> Result<RoundReport, FuzzerError> {
        let destination = self.config.fuzzer.destination;
        let coordinator = Arc::clone(&self.shared.coordinator);
        let round = coordinator.initialize(Arc::clone(&self.signal))?;
        let span = info_span!("round", id = round, path = %case.path);
        let _enter = span.enter();

        let driven = self.drive_round(destination, case);
        let (outcome, response) = match driven {
            Ok(driven) => {
                if let Err(e) = coordinator.close(false) {
                    coordinator.close(true)?;
                    return Err(e.into());
                }
                driven
            }
            Err(e) => {
                coordinator.close(true)?;
                return Err(e);
            }
        };

        let answer = response.map_or_else(|| "no response".to_string(), |s| s.to_string());
        self.history.push(format!(
            "{} payload={} -> {}",
            case.path,
            hex::encode(&case.payload),
            answer
        ));

        let verdict = self.shared.oracle.lock().current_status();
        info!(?outcome, %answer, ?verdict, "round finished");
        if verdict == OracleStatus::Unreachable {
            error!("device unreachable");
            return Err(FuzzerError::Unreachable { round });
        }

        Ok(RoundReport {
            round,
            outcome,
            response,
            verdict,
        })
    }

    fn drive_round(
        &mut self,
        destination: NodeId,
        case: &TestCase,
    ) -> Result<(RoundOutcome, Option<ImStatus>), FuzzerError> {
        let coordinator = &self.shared.coordinator;
        let needs_subscription =
            self.config.round.await_subscriptions && coordinator.expects_subscription(&case.path);
        coordinator.update(RoundUpdate::Flags {
            waiting: needs_subscription,
            needs_subscription,
        })?;

        let slot = ResultSlot::new();
        coordinator.update(RoundUpdate::Target {
            destination,
            command_path: case.path,
            result: slot.clone(),
        })?;

        match self.transport.invoke(destination, &case.path, &case.payload) {
            Ok(reply) => {
                self.callbacks
                    .on_command_response(&case.path, reply.status, reply.response.as_deref())
            }
            Err(e) => {
                error!(error = %e, "transport failed");
                let kind = match case.path.kind {
                    CommandKind::Invoke => MessageKind::Invoke,
                    CommandKind::WriteAttribute => MessageKind::Write,
                };
                self.callbacks.on_error(kind, e.code());
            }
        }

        let outcome = coordinator.finalize()?;
        Ok((outcome, slot.get()))
    }

    /// Runs `cases` in order, at most `fuzzer.iterations` of them.
    ///
    /// An unreachable device ends the run early; its state is dumped when a snapshot
    /// directory is configured. Any other error aborts the run.
    pub fn run<'a, I>(&mut self, cases: I) -> Result<RunSummary, FuzzerError>
    where
        I: IntoIterator<Item = &'a TestCase>,
    {
        let limit = usize::try_from(self.config.fuzzer.iterations).unwrap_or(usize::MAX);
        let mut summary = RunSummary::default();

        for case in cases.into_iter().take(limit) {
            summary.rounds += 1;
            match self.run_case(case) {
                Ok(report) => {
                    if report.outcome == RoundOutcome::SubscriptionTimeout {
                        summary.subscription_timeouts += 1;
                    }
                    if report.verdict == OracleStatus::UnexpectedResponse {
                        summary.unexpected_responses += 1;
                    }
                }
                Err(FuzzerError::Unreachable { round }) => {
                    summary.unreachable_at = Some(round);
                    if let Err(e) = self.dump_snapshot() {
                        warn!(error = %e, "could not dump state of unreachable device");
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        summary.observations = self.shared.coordinator.observation_count();
        info!(?summary, "run finished");
        Ok(summary)
    }

    /// Writes the device state and command history to the configured snapshot
    /// directory. Returns `None` when no directory is configured.
    pub fn dump_snapshot(&self) -> Result<Option<PathBuf>, FuzzerError> {
        let Some(dir) = &self.config.snapshot.directory else {
            return Ok(None);
        };
        let snapshot = self.shared.store.lock().dump(&self.history);
        Ok(Some(save_snapshot(dir, &snapshot)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RoundStatus;
    use crate::snapshot::load_snapshot;
    use crate::tlv::Tag;
    use crate::transport::{CommandReply, InProcessTransport};
    use crate::types::AttributePath;
    use tempfile::tempdir;

    fn quick_config(await_subscriptions: bool) -> Config {
        let mut config = Config::default();
        config.round.subscription_wait_ms = 20;
        config.round.await_subscriptions = await_subscriptions;
        config
    }

    fn on_off_case(command: u32) -> TestCase {
        TestCase::new(CommandPath::invoke(1, 6, command), vec![0x15, 0x18])
    }

    fn seeded(config: &Config) -> SharedState {
        let shared = SharedState::new(config);
        {
            let mut store = shared.store.lock();
            store.add_node(1);
            store.add_endpoint(1, 1).unwrap();
            store.add_cluster(1, 1, 6, 4).unwrap();
        }
        shared
            .oracle
            .lock()
            .add_scope_rules(1, 6, &[0, 1, 2], &[0], &[])
            .unwrap();
        shared
    }

    #[test]
    fn run_case_records_history_and_verdict() {
        let config = quick_config(false);
        let shared = seeded(&config);
        let transport = InProcessTransport::new(|_, _: &CommandPath, _: &[u8]| {
            Ok(CommandReply::status(ImStatus::Success))
        });
        let mut fuzzer = Fuzzer::with_shared(config, shared, transport);

        let report = fuzzer.run_case(&on_off_case(0)).unwrap();
        assert_eq!(report.round, 0);
        assert_eq!(report.response, Some(ImStatus::Success));
        assert_eq!(report.verdict, OracleStatus::Ok);
        assert_eq!(
            report.outcome,
            RoundOutcome::Completed(RoundStatus::InvokeResponse)
        );
        assert_eq!(
            fuzzer.history(),
            &["invoke e=1 c=0x0006 id=0x0000 payload=1518 -> Success".to_string()]
        );

        let report = fuzzer.run_case(&on_off_case(1)).unwrap();
        assert_eq!(report.round, 1, "round ids keep increasing");
    }

    #[test]
    fn synchronous_report_satisfies_the_subscription_wait() {
        let config = quick_config(true);
        let shared = seeded(&config);
        let callbacks = shared.callbacks();
        let transport = InProcessTransport::new(move |_, _: &CommandPath, _: &[u8]| {
            let report = tlv::encode(&DecodedElement::structure(vec![
                DecodedElement::bool(true).with_tag(Tag::Context(0)),
            ]));
            callbacks.on_attribute_report(
                AttributePath::new(1, 1, 6, 0),
                ImStatus::Success,
                Some(&report),
            );
            Ok(CommandReply::status(ImStatus::Success))
        });
        let mut fuzzer = Fuzzer::with_shared(config, shared, transport);

        let report = fuzzer.run_case(&on_off_case(1)).unwrap();
        assert_eq!(
            report.outcome,
            RoundOutcome::Completed(RoundStatus::SubscriptionResponse)
        );
        let store = fuzzer.shared().store.lock();
        assert!(store.read_current(AttributePath::new(1, 1, 6, 0)).is_ok());
    }

    #[test]
    fn silent_device_times_out_subscriptions_until_the_limit() {
        let config = quick_config(true);
        let shared = seeded(&config);
        let transport = InProcessTransport::new(|_, _: &CommandPath, _: &[u8]| {
            Ok(CommandReply::status(ImStatus::Success))
        });
        let mut fuzzer = Fuzzer::with_shared(config, shared, transport);
        let case = on_off_case(2);

        for _ in 0..3 {
            let report = fuzzer.run_case(&case).unwrap();
            assert_eq!(report.outcome, RoundOutcome::SubscriptionTimeout);
        }
        let report = fuzzer.run_case(&case).unwrap();
        assert_eq!(
            report.outcome,
            RoundOutcome::Completed(RoundStatus::InvokeResponse),
            "after three timeouts the path no longer waits"
        );
    }

    #[test]
    fn crashing_device_ends_the_run() {
        let dir = tempdir().unwrap();
        let mut config = quick_config(false);
        config.snapshot.directory = Some(dir.path().to_path_buf());
        let shared = seeded(&config);
        let transport = InProcessTransport::new(
            |_, _: &CommandPath, _: &[u8]| -> Result<CommandReply, TransportError> {
                panic!("device rebooted")
            },
        );
        let mut fuzzer = Fuzzer::with_shared(config, shared, transport);

        let cases: Vec<TestCase> = (0..5).map(on_off_case).collect();
        let summary = fuzzer.run(&cases).unwrap();

        assert_eq!(summary.rounds, 2);
        assert_eq!(summary.unreachable_at, Some(1));
        assert_eq!(fuzzer.history().len(), 2);
        assert!(fuzzer.history()[0].ends_with("-> Timeout"));

        let dumps: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(dumps.len(), 1, "state is dumped when the device goes away");
        let path = dumps[0].as_ref().unwrap().path();
        assert_eq!(load_snapshot(&path).unwrap().history.len(), 2);
    }

    #[test]
    fn transport_errors_go_through_the_error_callback() {
        let config = quick_config(false);
        let shared = seeded(&config);
        let transport = InProcessTransport::new(|destination, _: &CommandPath, _: &[u8]| {
            Err(TransportError::NotConnected(destination))
        });
        let mut fuzzer = Fuzzer::with_shared(config, shared, transport);

        let report = fuzzer.run_case(&on_off_case(0)).unwrap();
        assert_eq!(report.response, Some(ImStatus::UnsupportedNode));
        assert_eq!(report.verdict, OracleStatus::UnexpectedResponse);
    }

    #[test]
    fn run_counts_unexpected_answers_and_respects_the_iteration_cap() {
        let mut config = quick_config(false);
        config.fuzzer.iterations = 3;
        let shared = seeded(&config);
        let transport = InProcessTransport::new(|_, path: &CommandPath, _: &[u8]| {
            let status = if path.id == 0 {
                ImStatus::Success
            } else {
                ImStatus::UnsupportedCommand
            };
            Ok(CommandReply::status(status))
        });
        let mut fuzzer = Fuzzer::with_shared(config, shared, transport);

        let cases: Vec<TestCase> = [0, 7, 0, 7, 7].into_iter().map(on_off_case).collect();
        let summary = fuzzer.run(&cases).unwrap();
        assert_eq!(summary.rounds, 3);
        assert_eq!(summary.unexpected_responses, 1);
        assert_eq!(summary.unreachable_at, None);
        assert_eq!(summary.observations, 2);
    }

    #[test]
    fn dump_snapshot_is_a_no_op_without_a_directory() {
        let config = quick_config(false);
        let transport = InProcessTransport::new(|_, _: &CommandPath, _: &[u8]| {
            Ok(CommandReply::status(ImStatus::Success))
        });
        let fuzzer = Fuzzer::new(config, transport);
        assert!(fuzzer.dump_snapshot().unwrap().is_none());
    }
}
