use crate::types::{
    AttributeId, ClusterId, CommandId, CommandPath, EndpointId, INVALID_CLUSTER_ID,
    INVALID_ENDPOINT_ID, INVALID_SUBJECT_ID, ImStatus,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Consecutive timeouts after which a device is considered unreachable.
pub const DEFAULT_UNREACHABLE_TIMEOUT_STREAK: u32 = 2;

/// Verdict of the oracle after the latest observation.
///
/// `Uninitialized` and `Initialized` only ever appear as the bootstrap values of
/// [`Oracle::last_status`] and [`Oracle::current_status`] before the first observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OracleStatus {
    Uninitialized,
    Initialized,
    Ok,
    UnexpectedResponse,
    Timeout,
    Unreachable,
}

/// Scope a rule applies to: one command or one attribute of one cluster instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleKey {
    pub endpoint: EndpointId,
    pub cluster: ClusterId,
    pub subject: u32,
    pub is_command: bool,
}

impl RuleKey {
    pub fn new(endpoint: EndpointId, cluster: ClusterId, subject: u32, is_command: bool) -> Self {
        Self {
            endpoint,
            cluster,
            subject,
            is_command,
        }
    }

    fn is_wildcard(&self) -> bool {
        self.endpoint == INVALID_ENDPOINT_ID
            || self.cluster == INVALID_CLUSTER_ID
            || self.subject == INVALID_SUBJECT_ID
    }
}

impl From<&CommandPath> for RuleKey {
    fn from(path: &CommandPath) -> Self {
        RuleKey::new(path.endpoint, path.cluster, path.id, path.is_command())
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_command { "command" } else { "attribute" };
        write!(
            f,
            "{kind} {:#06x} of cluster {:#06x} on endpoint {}",
            self.subject, self.cluster, self.endpoint
        )
    }
}

/// Set of status codes a device may legitimately answer with for one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleRule {
    pub key: RuleKey,
    pub accepted: BTreeSet<ImStatus>,
}

impl OracleRule {
    /// Stand-in for "no rule registered": wildcard ids and nothing accepted.
    pub const INVALID: OracleRule = OracleRule {
        key: RuleKey {
            endpoint: INVALID_ENDPOINT_ID,
            cluster: INVALID_CLUSTER_ID,
            subject: INVALID_SUBJECT_ID,
            is_command: false,
        },
        accepted: BTreeSet::new(),
    };

    /// Builds the default rule for `key`, widened by `extras`.
    ///
    /// Commands accept `Success`, `Failure`, `InvalidCommand` and `ConstraintError`;
    /// attributes accept `Success` and `Failure`.
    pub fn new(key: RuleKey, extras: &[ImStatus]) -> Self {
        let defaults: &[ImStatus] = if key.is_command {
            &[
                ImStatus::Success,
                ImStatus::Failure,
                ImStatus::InvalidCommand,
                ImStatus::ConstraintError,
            ]
        } else {
            &[ImStatus::Success, ImStatus::Failure]
        };
        Self {
            key,
            accepted: defaults.iter().chain(extras).copied().collect(),
        }
    }

    pub fn accepts(&self, status: ImStatus) -> bool {
        self.accepted.contains(&status)
    }

    pub fn is_invalid(&self) -> bool {
        self.key == OracleRule::INVALID.key
    }
}

/// Result of classifying one non-timeout status against the rule table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleResult {
    /// The rule consulted, or [`OracleRule::INVALID`] when none was registered.
    pub rule: OracleRule,
    pub matched: bool,
    pub status: OracleStatus,
}

/// What the device answered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A plain interaction-model status, including `Timeout` when the device stayed silent.
    Status(ImStatus),
    /// A status refined by a cluster-specific code. Not classified yet.
    ClusterSpecific { status: ImStatus, cluster_status: u8 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    /// A rule for this scope is already registered; rules are never overwritten.
    #[error("Duplicate oracle rule for {0}")]
    DuplicateRule(RuleKey),
}

/// Running tallies of every verdict the oracle has handed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OracleStats {
    pub consumed: u64,
    pub ok: u64,
    pub unexpected: u64,
    pub timeouts: u64,
    pub unreachable: u64,
    pub cluster_specific: u64,
}

/// Classifies device answers as conformant or not, and tracks reachability.
///
/// The oracle keeps a two-slot history: every call to [`Oracle::consume`] first
/// moves the current verdict into the last slot. Timeouts are counted as a streak;
/// once the streak reaches the configured threshold the verdict becomes
/// [`OracleStatus::Unreachable`]. Any other answer breaks the streak.
#[derive(Debug)]
pub struct Oracle {
    current: OracleStatus,
    last: OracleStatus,
    rules: BTreeMap<RuleKey, OracleRule>,
    timeout_streak: u32,
    unreachable_after: u32,
    last_result: Option<OracleResult>,
    stats: OracleStats,
}

impl Default for Oracle {
    fn default() -> Self {
        Self::new(DEFAULT_UNREACHABLE_TIMEOUT_STREAK)
    }
}

impl Oracle {
    /// Creates an oracle that declares a device unreachable after
    /// `unreachable_timeout_streak` consecutive timeouts (at least one).
    pub fn new(unreachable_timeout_streak: u32) -> Self {
        Self {
            current: OracleStatus::Initialized,
            last: OracleStatus::Uninitialized,
            rules: BTreeMap::new(),
            timeout_streak: 0,
            unreachable_after: unreachable_timeout_streak.max(1),
            last_result: None,
            stats: OracleStats::default(),
        }
    }

    /// Registers the acceptable statuses for one command or attribute.
    ///
    /// # Arguments
    /// * `extras`: statuses accepted on top of the defaults for the subject's kind.
    ///
    /// # Errors
    /// `DuplicateRule` if the scope already has a rule. A scope using a reserved
    /// wildcard id is skipped without error.
    pub fn add_rule(
        &mut self,
        endpoint: EndpointId,
        cluster: ClusterId,
        subject: u32,
        is_command: bool,
        extras: &[ImStatus],
    ) -> Result<(), OracleError> {
        let key = RuleKey::new(endpoint, cluster, subject, is_command);
        if key.is_wildcard() {
            debug!(%key, "skipping oracle rule with a wildcard id");
            return Ok(());
        }
        if self.rules.contains_key(&key) {
            return Err(OracleError::DuplicateRule(key));
        }
        self.rules.insert(key, OracleRule::new(key, extras));
        Ok(())
    }

    /// Registers one rule per command and per attribute of a discovered cluster.
    ///
    /// Stops at the first failing registration. Returns the number of rules added,
    /// which leaves out skipped wildcard ids.
    pub fn add_scope_rules(
        &mut self,
        endpoint: EndpointId,
        cluster: ClusterId,
        commands: &[CommandId],
        attributes: &[AttributeId],
        attribute_extras: &[ImStatus],
    ) -> Result<usize, OracleError> {
        let before = self.rules.len();
        for &command in commands {
            self.add_rule(endpoint, cluster, command, true, &[])?;
        }
        for &attribute in attributes {
            self.add_rule(endpoint, cluster, attribute, false, attribute_extras)?;
        }
        Ok(self.rules.len() - before)
    }

    /// Folds one observed answer into the oracle and returns the new verdict.
    ///
    /// Never fails: a scope without a rule is an `UnexpectedResponse` against
    /// [`OracleRule::INVALID`].
    pub fn consume(
        &mut self,
        endpoint: EndpointId,
        cluster: ClusterId,
        subject: u32,
        is_command: bool,
        outcome: Outcome,
    ) -> OracleStatus {
        self.last = self.current;
        self.stats.consumed += 1;

        let status = match outcome {
            Outcome::ClusterSpecific {
                status,
                cluster_status,
            } => {
                self.stats.cluster_specific += 1;
                debug!(%status, cluster_status, "cluster-specific status left unclassified");
                return self.current;
            }
            Outcome::Status(status) => status,
        };

        if status == ImStatus::Timeout {
            self.timeout_streak += 1;
            self.current = if self.timeout_streak >= self.unreachable_after {
                self.stats.unreachable += 1;
                OracleStatus::Unreachable
            } else {
                self.stats.timeouts += 1;
                OracleStatus::Timeout
            };
            return self.current;
        }

        self.timeout_streak = 0;
        let key = RuleKey::new(endpoint, cluster, subject, is_command);
        let rule = self.rules.get(&key).cloned().unwrap_or(OracleRule::INVALID);
        let matched = rule.accepts(status);
        self.current = if matched {
            self.stats.ok += 1;
            OracleStatus::Ok
        } else {
            self.stats.unexpected += 1;
            OracleStatus::UnexpectedResponse
        };
        debug!(%key, %status, verdict = ?self.current, "oracle consumed status");
        self.last_result = Some(OracleResult {
            rule,
            matched,
            status: self.current,
        });
        self.current
    }

    /// Shorthand for [`Oracle::consume`] keyed by a round's command path.
    pub fn consume_path(&mut self, path: &CommandPath, outcome: Outcome) -> OracleStatus {
        let key = RuleKey::from(path);
        self.consume(key.endpoint, key.cluster, key.subject, key.is_command, outcome)
    }

    pub fn current_status(&self) -> OracleStatus {
        self.current
    }

    pub fn last_status(&self) -> OracleStatus {
        self.last
    }

    /// Classification behind the latest non-timeout verdict.
    pub fn last_result(&self) -> Option<&OracleResult> {
        self.last_result.as_ref()
    }

    pub fn stats(&self) -> OracleStats {
        self.stats
    }

    pub fn rule(&self, key: &RuleKey) -> Option<&OracleRule> {
        self.rules.get(key)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> Outcome {
        Outcome::Status(ImStatus::Timeout)
    }

    #[test]
    fn new_oracle_starts_initialized() {
        let oracle = Oracle::default();
        assert_eq!(oracle.current_status(), OracleStatus::Initialized);
        assert_eq!(oracle.last_status(), OracleStatus::Uninitialized);
        assert!(oracle.last_result().is_none());
    }

    #[test]
    fn registered_command_rule_classifies_statuses() {
        let mut oracle = Oracle::default();
        oracle.add_rule(1, 6, 0, true, &[]).unwrap();

        let status = oracle.consume(1, 6, 0, true, Outcome::Status(ImStatus::Success));
        assert_eq!(status, OracleStatus::Ok);
        assert_eq!(oracle.last_status(), OracleStatus::Initialized);

        let status = oracle.consume(1, 6, 0, true, Outcome::Status(ImStatus::UnsupportedCluster));
        assert_eq!(status, OracleStatus::UnexpectedResponse);
        assert_eq!(oracle.last_status(), OracleStatus::Ok);

        let result = oracle.last_result().unwrap();
        assert!(!result.matched);
        assert_eq!(result.rule.key, RuleKey::new(1, 6, 0, true));
    }

    #[test]
    fn missing_rule_is_unexpected_against_the_invalid_sentinel() {
        let mut oracle = Oracle::default();
        let status = oracle.consume(1, 6, 0, true, Outcome::Status(ImStatus::Success));
        assert_eq!(status, OracleStatus::UnexpectedResponse);

        let result = oracle.last_result().unwrap();
        assert!(result.rule.is_invalid(), "no rule should map to the sentinel");
        assert!(result.rule.accepted.is_empty());
    }

    #[test]
    fn two_consecutive_timeouts_make_the_device_unreachable() {
        let mut oracle = Oracle::default();
        assert_eq!(oracle.consume(1, 6, 0, true, timeout()), OracleStatus::Timeout);
        assert_eq!(oracle.consume(1, 6, 0, true, timeout()), OracleStatus::Unreachable);
        assert_eq!(oracle.last_status(), OracleStatus::Timeout);
    }

    #[test]
    fn any_answer_breaks_the_timeout_streak() {
        let mut oracle = Oracle::default();
        oracle.add_rule(1, 6, 0, true, &[]).unwrap();

        oracle.consume(1, 6, 0, true, timeout());
        let status = oracle.consume(1, 6, 0, true, Outcome::Status(ImStatus::Success));
        assert_eq!(status, OracleStatus::Ok);
        assert_eq!(
            oracle.consume(1, 6, 0, true, timeout()),
            OracleStatus::Timeout,
            "the streak restarts after a real answer"
        );
    }

    #[test]
    fn streak_threshold_is_configurable() {
        let mut oracle = Oracle::new(3);
        assert_eq!(oracle.consume(1, 6, 0, true, timeout()), OracleStatus::Timeout);
        assert_eq!(oracle.consume(1, 6, 0, true, timeout()), OracleStatus::Timeout);
        assert_eq!(oracle.consume(1, 6, 0, true, timeout()), OracleStatus::Unreachable);
    }

    #[test]
    fn cluster_specific_outcome_keeps_the_verdict() {
        let mut oracle = Oracle::default();
        oracle.consume(1, 6, 0, true, timeout());
        let status = oracle.consume(
            1,
            6,
            0,
            true,
            Outcome::ClusterSpecific {
                status: ImStatus::Failure,
                cluster_status: 2,
            },
        );
        assert_eq!(status, OracleStatus::Timeout);
        assert_eq!(oracle.last_status(), OracleStatus::Timeout);
        assert_eq!(
            oracle.consume(1, 6, 0, true, timeout()),
            OracleStatus::Unreachable,
            "a cluster-specific answer must not reset the streak"
        );
    }

    #[test]
    fn attribute_rules_take_extras() {
        let mut oracle = Oracle::default();
        oracle
            .add_rule(1, 8, 0, false, &[ImStatus::UnsupportedWrite])
            .unwrap();
        let rule = oracle.rule(&RuleKey::new(1, 8, 0, false)).unwrap();
        assert!(rule.accepts(ImStatus::Success));
        assert!(rule.accepts(ImStatus::UnsupportedWrite));
        assert!(!rule.accepts(ImStatus::InvalidCommand));
    }

    #[test]
    fn duplicates_fail_and_wildcards_are_skipped() {
        let mut oracle = Oracle::default();
        oracle.add_rule(1, 6, 0, true, &[]).unwrap();
        assert_eq!(
            oracle.add_rule(1, 6, 0, true, &[ImStatus::Busy]),
            Err(OracleError::DuplicateRule(RuleKey::new(1, 6, 0, true)))
        );
        assert!(
            oracle.add_rule(1, 6, 0, false, &[]).is_ok(),
            "same id as an attribute is a different scope"
        );
        assert_eq!(oracle.add_rule(INVALID_ENDPOINT_ID, 6, 0, true, &[]), Ok(()));
        assert_eq!(oracle.add_rule(1, 6, INVALID_SUBJECT_ID, true, &[]), Ok(()));
        assert_eq!(oracle.rule_count(), 2, "wildcard scopes register nothing");
        assert_eq!(
            oracle.add_scope_rules(2, 6, &[0, INVALID_SUBJECT_ID], &[0], &[]),
            Ok(2)
        );
    }

    #[test]
    fn scope_rules_cover_commands_and_attributes() {
        let mut oracle = Oracle::default();
        let added = oracle
            .add_scope_rules(1, 6, &[0, 1, 2], &[0, 0x4000], &[])
            .unwrap();
        assert_eq!(added, 5);
        assert!(oracle.rule(&RuleKey::new(1, 6, 2, true)).is_some());
        assert!(oracle.rule(&RuleKey::new(1, 6, 0x4000, false)).is_some());
    }

    #[test]
    fn stats_tally_each_verdict() {
        let mut oracle = Oracle::default();
        oracle.add_rule(1, 6, 0, true, &[]).unwrap();
        let path = CommandPath::invoke(1, 6, 0);
        oracle.consume_path(&path, Outcome::Status(ImStatus::Success));
        oracle.consume_path(&path, Outcome::Status(ImStatus::Busy));
        oracle.consume_path(&path, timeout());
        oracle.consume_path(&path, timeout());

        let stats = oracle.stats();
        assert_eq!(stats.consumed, 4);
        assert_eq!(stats.ok, 1);
        assert_eq!(stats.unexpected, 1);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.unreachable, 1);
    }
}
