use std::{env, fs, num::NonZeroU64, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, Result};

/// Environment variable that overrides `initial_peers` with a comma separated list.
pub const INITIAL_PEERS_ENV: &str = "INITIAL_PEERS";

/// What to do once `max_round_retries` consecutive rounds have failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail the run with `CoordinatorError::Aborted`.
    Abort,
    /// Drop the local accumulation and start accumulating from zero.
    #[default]
    Restart,
}

/// The closed set of options recognized by the coordinator.
///
/// Unknown keys are rejected when deserializing, nothing is forwarded blindly to the
/// transport or the averager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    pub target_batch_size: NonZeroU64,
    #[serde(default = "default_run_id")]
    pub run_id: String,
    #[serde(default)]
    pub initial_peers: Vec<String>,
    #[serde(default = "default_host_addrs")]
    pub host_addrs: Vec<String>,
    #[serde(default)]
    pub delay_state_averaging: bool,
    #[serde(default)]
    pub delay_grad_averaging: bool,
    #[serde(default)]
    pub delay_optimizer_step: bool,
    #[serde(default)]
    pub offload_optimizer: bool,
    #[serde(default = "default_round_timeout", with = "secs")]
    pub round_timeout: Duration,
    #[serde(default = "default_average_state_every")]
    pub average_state_every: NonZeroU64,
    #[serde(default = "default_max_round_retries")]
    pub max_round_retries: u32,
    #[serde(default)]
    pub on_round_failure: FailurePolicy,
    #[serde(default = "default_grad_accumulation_steps")]
    pub grad_accumulation_steps: u32,
    #[serde(default = "default_progress_expiration", with = "secs")]
    pub progress_expiration: Duration,
}

fn default_run_id() -> String {
    "collab_run".to_string()
}

fn default_host_addrs() -> Vec<String> {
    vec!["0.0.0.0:0".to_string()]
}

fn default_round_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_average_state_every() -> NonZeroU64 {
    NonZeroU64::MIN
}

fn default_max_round_retries() -> u32 {
    3
}

fn default_grad_accumulation_steps() -> u32 {
    1
}

fn default_progress_expiration() -> Duration {
    Duration::from_secs(60)
}

impl CoordinatorConfig {
    /// Creates a configuration with every option set to its default.
    ///
    /// # Arguments
    /// * `target_batch_size` - The collective amount of samples per optimizer step.
    ///
    /// # Returns
    /// A new `CoordinatorConfig` instance.
    pub fn new(target_batch_size: NonZeroU64) -> Self {
        Self {
            target_batch_size,
            run_id: default_run_id(),
            initial_peers: Vec::new(),
            host_addrs: default_host_addrs(),
            delay_state_averaging: false,
            delay_grad_averaging: false,
            delay_optimizer_step: false,
            offload_optimizer: false,
            round_timeout: default_round_timeout(),
            average_state_every: default_average_state_every(),
            max_round_retries: default_max_round_retries(),
            on_round_failure: FailurePolicy::default(),
            grad_accumulation_steps: default_grad_accumulation_steps(),
            progress_expiration: default_progress_expiration(),
        }
    }

    /// Parses a configuration from a json document.
    ///
    /// # Errors
    /// `ConfigurationConflict` on malformed json, unknown options or a missing `target_batch_size`.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a json configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Overrides `initial_peers` with the `INITIAL_PEERS` environment variable, if set.
    pub fn apply_env(&mut self) {
        if let Ok(peers) = env::var(INITIAL_PEERS_ENV) {
            self.initial_peers = parse_peer_list(&peers);
        }
    }

    /// Returns true if any of the `delay_*` flags is set, which makes every round run
    /// in the background and replace the optimizer on completion.
    pub fn any_delay(&self) -> bool {
        self.delay_state_averaging || self.delay_grad_averaging || self.delay_optimizer_step
    }

    /// Checks the option combinations that can be decided without the caller's scheduler.
    ///
    /// # Errors
    /// `ConfigurationConflict` describing the first offending option.
    pub fn validate(&self) -> Result<()> {
        if self.round_timeout.is_zero() {
            return Err(CoordinatorError::ConfigurationConflict(
                "round_timeout must be greater than 0".into(),
            ));
        }

        if self.grad_accumulation_steps != 1 {
            return Err(CoordinatorError::ConfigurationConflict(format!(
                "grad_accumulation_steps is {}, the trainer must not accumulate gradients on its \
                 own while the coordinator accumulates toward target_batch_size",
                self.grad_accumulation_steps
            )));
        }

        if self.any_delay() && !self.offload_optimizer {
            return Err(CoordinatorError::ConfigurationConflict(
                "delay_state_averaging, delay_grad_averaging and delay_optimizer_step require \
                 offload_optimizer"
                    .into(),
            ));
        }

        if self.run_id.is_empty() {
            return Err(CoordinatorError::ConfigurationConflict(
                "run_id must not be empty".into(),
            ));
        }

        if self.host_addrs.is_empty() {
            return Err(CoordinatorError::ConfigurationConflict(
                "at least one host address is required".into(),
            ));
        }

        Ok(())
    }
}

/// Splits a comma separated peer list, ignoring blanks.
pub fn parse_peer_list(peers: &str) -> Vec<String> {
    peers
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

/// (De)serializes a `Duration` as fractional seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CoordinatorConfig {
        CoordinatorConfig::new(NonZeroU64::new(100).unwrap())
    }

    #[test]
    fn parses_minimal_json_with_defaults() {
        let cfg = CoordinatorConfig::from_json(r#"{ "target_batch_size": 64 }"#).unwrap();
        assert_eq!(cfg.target_batch_size.get(), 64);
        assert_eq!(cfg.run_id, "collab_run");
        assert_eq!(cfg.round_timeout, Duration::from_secs(30));
        assert_eq!(cfg.on_round_failure, FailurePolicy::Restart);
        assert!(cfg.initial_peers.is_empty());
        cfg.validate().unwrap();
    }

    #[test]
    fn parses_fractional_timeout() {
        let cfg = CoordinatorConfig::from_json(
            r#"{ "target_batch_size": 8, "round_timeout": 0.25, "on_round_failure": "abort" }"#,
        )
        .unwrap();
        assert_eq!(cfg.round_timeout, Duration::from_millis(250));
        assert_eq!(cfg.on_round_failure, FailurePolicy::Abort);
    }

    #[test]
    fn rejects_unknown_option() {
        let err = CoordinatorConfig::from_json(
            r#"{ "target_batch_size": 8, "matchmaking_time": 5.0 }"#,
        )
        .unwrap_err();
        assert!(matches!(err, CoordinatorError::ConfigurationConflict(_)));
    }

    #[test]
    fn rejects_zero_target_batch_size() {
        let err = CoordinatorConfig::from_json(r#"{ "target_batch_size": 0 }"#).unwrap_err();
        assert!(matches!(err, CoordinatorError::ConfigurationConflict(_)));
    }

    #[test]
    fn delay_flags_require_offload() {
        let mut cfg = config();
        cfg.delay_grad_averaging = true;
        assert!(matches!(
            cfg.validate(),
            Err(CoordinatorError::ConfigurationConflict(_))
        ));

        cfg.offload_optimizer = true;
        cfg.validate().unwrap();
    }

    #[test]
    fn trainer_accumulation_conflicts() {
        let mut cfg = config();
        cfg.grad_accumulation_steps = 4;
        assert!(matches!(
            cfg.validate(),
            Err(CoordinatorError::ConfigurationConflict(_))
        ));
    }

    #[test]
    fn peer_list_parsing() {
        assert_eq!(
            parse_peer_list("10.0.0.1:4000, 10.0.0.2:4000,,"),
            vec!["10.0.0.1:4000", "10.0.0.2:4000"]
        );
        assert!(parse_peer_list("").is_empty());
    }
}
