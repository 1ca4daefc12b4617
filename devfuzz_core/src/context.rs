//! Lifecycle of a single fuzzing round.
//!
//! A round moves strictly forward through [`RoundStatus`]:
//!
//! ```text
//! Uninitialized -> {NonInvoke|Invoke}Request -> {NonInvoke|Invoke}Response
//!               -> [SubscriptionResponse] -> Terminated
//! ```
//!
//! The driver thread opens a round with [`RoundCoordinator::initialize`], feeds it
//! through [`RoundCoordinator::update`] while callback threads do the same, then
//! ends it with [`RoundCoordinator::finalize`] and [`RoundCoordinator::close`].
//! Only a report naming changed attributes moves a round into `SubscriptionResponse`.
//!
//! Locks are always taken outer before inner. The outer `RwLock` guards which
//! context is live; each context owns an inner `Mutex` for its fields. The
//! [`RoundSignal`] mutex may be held while taking the inner lock, never the reverse.
//! `finalize` keeps a read guard on the outer lock until the round is terminated,
//! so `close` and `initialize` cannot swap the round out from under it.

use crate::observation::{Observation, ObservationLog};
use crate::types::{AttributePath, CommandPath, ImStatus, NodeId};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_SUBSCRIPTION_WAIT: Duration = Duration::from_secs(3);
pub const DEFAULT_SUBSCRIPTION_TIMEOUT_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RoundStatus {
    Uninitialized,
    NonInvokeRequest,
    InvokeRequest,
    NonInvokeResponse,
    InvokeResponse,
    SubscriptionResponse,
    Terminated,
}

/// What an update contributes to the round's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Request,
    Response,
    Report,
    Metadata,
}

/// Cell the response callbacks fill with the device's answer for the round.
#[derive(Debug, Clone, Default)]
pub struct ResultSlot(Arc<Mutex<Option<ImStatus>>>);

impl ResultSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, status: ImStatus) {
        *self.0.lock() = Some(status);
    }

    pub fn get(&self) -> Option<ImStatus> {
        *self.0.lock()
    }
}

/// Two slots are equal when they are the same cell.
impl PartialEq for ResultSlot {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for ResultSlot {}

/// Mutex, condition variable and "waiting" flag shared between the driver and the
/// coordinator. Owned by the driver; a round only borrows it.
#[derive(Debug, Default)]
pub struct RoundSignal {
    waiting: Mutex<bool>,
    ready: Condvar,
}

impl RoundSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_waiting(&self) -> bool {
        *self.waiting.lock()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundUpdate {
    Target {
        destination: NodeId,
        command_path: CommandPath,
        result: ResultSlot,
    },
    Destination {
        destination: NodeId,
        result: ResultSlot,
    },
    Response(ImStatus),
    ChangedAttributes(BTreeSet<AttributePath>),
    Flags {
        waiting: bool,
        needs_subscription: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The round finished; carries the last status reached before termination.
    Completed(RoundStatus),
    /// A subscription report was expected and never arrived. Not fatal.
    SubscriptionTimeout,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("No round is live")]
    NoContext,

    #[error("Round {0} is still live and must be closed first")]
    AlreadyActive(u64),

    #[error("Round {0} is already terminated")]
    Terminated(u64),

    #[error("Round {id} cannot be closed in status {status:?}")]
    NotTerminated { id: u64, status: RoundStatus },
}

#[derive(Debug)]
struct RoundFields {
    destination: Option<NodeId>,
    status: RoundStatus,
    command_path: Option<CommandPath>,
    needs_subscription: bool,
    changed: BTreeSet<AttributePath>,
    result: Option<ResultSlot>,
    response: Option<ImStatus>,
}

impl RoundFields {
    /// Moves the status by the one step `stage` allows from where the round stands.
    /// An update that has no legal step from here only leaves its metadata behind.
    ///
    /// `SubscriptionResponse` is reached only once a report has named changed
    /// attributes. A report that overtakes the response is held until the response
    /// arrives.
    fn advance(&mut self, stage: Stage) {
        use RoundStatus::*;

        let (request, response) = if self.command_path.is_some_and(|p| p.is_command()) {
            (InvokeRequest, InvokeResponse)
        } else {
            (NonInvokeRequest, NonInvokeResponse)
        };
        let reported = !self.changed.is_empty();

        self.status = match (stage, self.status) {
            // The branch follows the command path, which may arrive after the destination.
            (Stage::Request, Uninitialized | NonInvokeRequest | InvokeRequest) => request,
            (Stage::Response, NonInvokeRequest | InvokeRequest) if reported => {
                SubscriptionResponse
            }
            (Stage::Response, NonInvokeRequest | InvokeRequest) => response,
            (Stage::Report, NonInvokeResponse | InvokeResponse) if reported => {
                SubscriptionResponse
            }
            (_, status) => status,
        };
    }
}

/// Copy of a live round's fields at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundView {
    pub id: u64,
    pub destination: Option<NodeId>,
    pub status: RoundStatus,
    pub command_path: Option<CommandPath>,
    pub needs_subscription: bool,
    pub changed: BTreeSet<AttributePath>,
    pub response: Option<ImStatus>,
}

#[derive(Debug)]
struct RoundContext {
    id: u64,
    fields: Mutex<RoundFields>,
    signal: Arc<RoundSignal>,
}

impl RoundContext {
    fn new(id: u64, signal: Arc<RoundSignal>) -> Self {
        Self {
            id,
            fields: Mutex::new(RoundFields {
                destination: None,
                status: RoundStatus::Uninitialized,
                command_path: None,
                needs_subscription: false,
                changed: BTreeSet::new(),
                result: None,
                response: None,
            }),
            signal,
        }
    }

    fn reached_subscription(&self) -> bool {
        self.fields.lock().status >= RoundStatus::SubscriptionResponse
    }

    fn view(&self) -> RoundView {
        let fields = self.fields.lock();
        RoundView {
            id: self.id,
            destination: fields.destination,
            status: fields.status,
            command_path: fields.command_path,
            needs_subscription: fields.needs_subscription,
            changed: fields.changed.clone(),
            response: fields.response,
        }
    }
}

#[derive(Debug, Default)]
struct LiveSlot {
    context: Option<Arc<RoundContext>>,
    last_id: Option<u64>,
}

/// Owns the live round and the state that must outlive single rounds: the per-path
/// subscription timeout counters and the observation log.
#[derive(Debug)]
pub struct RoundCoordinator {
    live: RwLock<LiveSlot>,
    subscription_timeouts: Mutex<HashMap<CommandPath, u32>>,
    observations: Mutex<ObservationLog>,
    subscription_wait: Duration,
    subscription_timeout_limit: u32,
}

impl Default for RoundCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIPTION_WAIT, DEFAULT_SUBSCRIPTION_TIMEOUT_LIMIT)
    }
}

impl RoundCoordinator {
    pub fn new(subscription_wait: Duration, subscription_timeout_limit: u32) -> Self {
        Self {
            live: RwLock::new(LiveSlot::default()),
            subscription_timeouts: Mutex::new(HashMap::new()),
            observations: Mutex::new(ObservationLog::new()),
            subscription_wait,
            subscription_timeout_limit,
        }
    }

    /// Opens a new round and returns its id: one past the previous round's id, or 0
    /// for the first round.
    pub fn initialize(&self, signal: Arc<RoundSignal>) -> Result<u64, ContextError> {
        let mut live = self.live.write();
        if let Some(context) = &live.context {
            return Err(ContextError::AlreadyActive(context.id));
        }
        let id = live.last_id.map_or(0, |last| last + 1);
        live.context = Some(Arc::new(RoundContext::new(id, signal)));
        live.last_id = Some(id);
        debug!(round = id, "round initialized");
        Ok(id)
    }

    /// Records `update` on the live round and advances it by at most one step
    /// (`Flags` only records). Wakes anyone waiting on the round's signal.
    pub fn update(&self, update: RoundUpdate) -> Result<RoundStatus, ContextError> {
        // Recursive read: callbacks must reach a round held by `finalize` even while
        // a `close` or `initialize` is queued for the write lock.
        let live = self.live.read_recursive();
        let context = live.context.as_ref().ok_or(ContextError::NoContext)?;

        let mut fields = context.fields.lock();
        if fields.status == RoundStatus::Terminated {
            return Err(ContextError::Terminated(context.id));
        }

        let mut set_waiting = None;
        let stage = match update {
            RoundUpdate::Target {
                destination,
                command_path,
                result,
            } => {
                fields.destination = Some(destination);
                fields.command_path = Some(command_path);
                fields.result = Some(result);
                Stage::Request
            }
            RoundUpdate::Destination {
                destination,
                result,
            } => {
                fields.destination = Some(destination);
                fields.result = Some(result);
                Stage::Request
            }
            RoundUpdate::Response(status) => {
                fields.response = Some(status);
                if let Some(slot) = &fields.result {
                    slot.set(status);
                }
                Stage::Response
            }
            RoundUpdate::ChangedAttributes(paths) => {
                fields.changed.extend(paths);
                Stage::Report
            }
            RoundUpdate::Flags {
                waiting,
                needs_subscription,
            } => {
                fields.needs_subscription = needs_subscription;
                set_waiting = Some(waiting);
                Stage::Metadata
            }
        };

        fields.advance(stage);
        let status = fields.status;
        drop(fields);

        let mut waiting = context.signal.waiting.lock();
        if let Some(flag) = set_waiting {
            *waiting = flag;
        }
        context.signal.ready.notify_all();
        Ok(status)
    }

    /// Ends the live round.
    ///
    /// When the round needs a subscription report and its command path has not hit
    /// the timeout limit, blocks for at most the configured wait until the round
    /// reaches `SubscriptionResponse`. Afterwards the round is `Terminated`, the
    /// waiting flag is cleared and an observation is recorded for the command path.
    pub fn finalize(&self) -> Result<RoundOutcome, ContextError> {
        // Held until the round is terminated, so the round cannot be replaced under us.
        // Callback updates still get in through `read_recursive`.
        let live = self.live.read();
        let context = live.context.as_ref().ok_or(ContextError::NoContext)?;

        let (needs_subscription, command_path) = {
            let fields = context.fields.lock();
            if fields.status == RoundStatus::Terminated {
                return Err(ContextError::Terminated(context.id));
            }
            (fields.needs_subscription, fields.command_path)
        };

        let should_wait = needs_subscription
            && command_path.is_none_or(|path| self.expects_subscription(&path));

        let mut waiting = context.signal.waiting.lock();
        let mut timed_out = false;
        if should_wait {
            context.signal.ready.wait_while_for(
                &mut waiting,
                |_| !context.reached_subscription(),
                self.subscription_wait,
            );
            timed_out = !context.reached_subscription();
            if let Some(path) = command_path {
                let mut timeouts = self.subscription_timeouts.lock();
                if timed_out {
                    *timeouts.entry(path).or_insert(0) += 1;
                } else {
                    timeouts.remove(&path);
                }
            }
        }
        *waiting = false;

        let (reached, observation) = {
            let mut fields = context.fields.lock();
            let reached = fields.status;
            fields.status = RoundStatus::Terminated;
            let status = fields
                .result
                .as_ref()
                .and_then(ResultSlot::get)
                .or(fields.response);
            let observation = fields.command_path.map(|path| Observation {
                round: context.id,
                path,
                status,
                changed: fields.changed.clone(),
            });
            (reached, observation)
        };
        context.signal.ready.notify_all();
        drop(waiting);

        if timed_out {
            warn!(round = context.id, "subscription report did not arrive in time");
        }
        debug!(round = context.id, status = ?reached, "round finalized");

        if let Some(observation) = observation {
            let text = observation.to_string();
            if self.observations.lock().record(observation) {
                info!(observation = %text, "new observation");
            }
        }

        Ok(if timed_out {
            RoundOutcome::SubscriptionTimeout
        } else {
            RoundOutcome::Completed(reached)
        })
    }

    /// Releases the live round.
    ///
    /// Refuses a round that was not finalized, or a missing round, unless
    /// `skip_errors` is set for best-effort teardown.
    pub fn close(&self, skip_errors: bool) -> Result<(), ContextError> {
        let mut live = self.live.write();
        let Some(context) = &live.context else {
            return if skip_errors {
                Ok(())
            } else {
                Err(ContextError::NoContext)
            };
        };
        let status = context.fields.lock().status;
        if status != RoundStatus::Terminated && !skip_errors {
            return Err(ContextError::NotTerminated {
                id: context.id,
                status,
            });
        }
        debug!(round = context.id, "round closed");
        live.context = None;
        Ok(())
    }

    /// Whether rounds issuing `path` should still wait for a subscription report.
    pub fn expects_subscription(&self, path: &CommandPath) -> bool {
        self.subscription_timeouts(path) < self.subscription_timeout_limit
    }

    pub fn subscription_timeouts(&self, path: &CommandPath) -> u32 {
        self.subscription_timeouts
            .lock()
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub fn status(&self) -> Result<RoundStatus, ContextError> {
        Ok(self.view()?.status)
    }

    pub fn view(&self) -> Result<RoundView, ContextError> {
        let live = self.live.read_recursive();
        live.context
            .as_ref()
            .map(|context| context.view())
            .ok_or(ContextError::NoContext)
    }

    /// Id of the live round, if any.
    pub fn current_id(&self) -> Option<u64> {
        self.live
            .read_recursive()
            .context
            .as_ref()
            .map(|context| context.id)
    }

    pub fn observation_count(&self) -> usize {
        self.observations.lock().len()
    }

    pub fn drain_observations(&self) -> Vec<Observation> {
        self.observations.lock().drain()
    }
}
