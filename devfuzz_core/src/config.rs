use crate::context::{DEFAULT_SUBSCRIPTION_TIMEOUT_LIMIT, DEFAULT_SUBSCRIPTION_WAIT};
use crate::oracle::DEFAULT_UNREACHABLE_TIMEOUT_STREAK;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_destination")]
    pub destination: NodeId,
    #[serde(default = "default_iterations")]
    pub iterations: u64,
}

pub fn default_destination() -> NodeId {
    1
}
pub fn default_iterations() -> u64 {
    1000
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            iterations: default_iterations(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OracleSettings {
    #[serde(default = "default_unreachable_timeout_streak")]
    pub unreachable_timeout_streak: u32,
}

fn default_unreachable_timeout_streak() -> u32 {
    DEFAULT_UNREACHABLE_TIMEOUT_STREAK
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            unreachable_timeout_streak: default_unreachable_timeout_streak(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RoundSettings {
    #[serde(default = "default_subscription_wait_ms")]
    pub subscription_wait_ms: u64,
    #[serde(default = "default_subscription_timeout_limit")]
    pub subscription_timeout_limit: u32,
    #[serde(default = "default_await_subscriptions")]
    pub await_subscriptions: bool,
}

fn default_subscription_wait_ms() -> u64 {
    DEFAULT_SUBSCRIPTION_WAIT.as_millis() as u64
}
fn default_subscription_timeout_limit() -> u32 {
    DEFAULT_SUBSCRIPTION_TIMEOUT_LIMIT
}
fn default_await_subscriptions() -> bool {
    true
}

impl RoundSettings {
    pub fn subscription_wait(&self) -> Duration {
        Duration::from_millis(self.subscription_wait_ms)
    }
}

impl Default for RoundSettings {
    fn default() -> Self {
        Self {
            subscription_wait_ms: default_subscription_wait_ms(),
            subscription_timeout_limit: default_subscription_timeout_limit(),
            await_subscriptions: default_await_subscriptions(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SnapshotSettings {
    /// Where state dumps go. No directory means no dumps.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub oracle: OracleSettings,
    #[serde(default)]
    pub round: RoundSettings,
    #[serde(default)]
    pub snapshot: SnapshotSettings,
}

impl Config {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: Config = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, anyhow::Error> {
        toml::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to render config as TOML: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [fuzzer]
            destination = 7
            iterations = 50

            [oracle]
            unreachable-timeout-streak = 4

            [round]
            subscription-wait-ms = 250
            subscription-timeout-limit = 5
            await-subscriptions = false

            [snapshot]
            directory = "./statedumps"
            "#,
        )
        .unwrap();

        assert_eq!(config.fuzzer.destination, 7);
        assert_eq!(config.oracle.unreachable_timeout_streak, 4);
        assert_eq!(config.round.subscription_wait(), Duration::from_millis(250));
        assert!(!config.round.await_subscriptions);
        assert_eq!(
            config.snapshot.directory,
            Some(PathBuf::from("./statedumps"))
        );
    }

    #[test]
    fn missing_sections_take_defaults() {
        let config: Config = toml::from_str("[fuzzer]\niterations = 3\n").unwrap();
        assert_eq!(config.fuzzer.iterations, 3);
        assert_eq!(config.fuzzer.destination, 1);
        assert_eq!(config.oracle.unreachable_timeout_streak, 2);
        assert_eq!(config.round.subscription_timeout_limit, 3);
        assert_eq!(config.round.subscription_wait(), Duration::from_secs(3));
        assert!(config.snapshot.directory.is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result: Result<Config, _> = toml::from_str("[round]\nsubscription-wait = 3\n");
        assert!(result.is_err(), "misspelled keys must not be silently ignored");
    }

    #[test]
    fn load_from_file_reads_toml_and_reports_bad_paths() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[oracle]\nunreachable-timeout-streak = 3").unwrap();
        let config = Config::load_from_file(&file.path().to_path_buf()).unwrap();
        assert_eq!(config.oracle.unreachable_timeout_streak, 3);

        let missing = PathBuf::from("/nonexistent/devfuzz.toml");
        let err = Config::load_from_file(&missing).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn rendered_toml_parses_back() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        let back: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(back, config);
    }
}
