//! Operator configuration
//!
//! Loaded from a TOML file, then overridden from `OPERATOR_*` environment
//! variables. Every section has defaults, so an empty file is a valid config
//! apart from the worker program.

use crate::error::ConfigError;
use crate::types::ProfileId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default recovery ladder, cheapest action first
pub const DEFAULT_RECOVERY_STEPS: [&str; 5] = [
    "navigate-home",
    "navigate-back",
    "refresh",
    "reopen-profile-session",
    "restart-profile-runtime",
];

/// Top-level operator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    pub supervisor: SupervisorConfig,
    pub launcher: LauncherConfig,
    pub worker: WorkerCommand,
    pub recovery: RecoveryConfig,
    pub store: StoreConfig,
    /// Profiles supervised by `run`
    pub profiles: Vec<ProfileId>,
}

impl OperatorConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a TOML file and apply environment overrides
    ///
    /// # Errors
    /// - `ConfigError::Read` if the file cannot be read
    /// - `ConfigError::Parse` on malformed TOML
    /// - `ConfigError::Env` on an unparsable override
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml(&raw)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a TOML document
    ///
    /// # Errors
    /// `ConfigError::Parse` on malformed TOML
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `OPERATOR_*` overrides read through `lookup`
    ///
    /// # Errors
    /// `ConfigError::Env` when an override does not parse
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env_parse(&lookup, "OPERATOR_MAX_ERROR_STREAK")? {
            self.supervisor.max_error_streak = v;
        }
        if let Some(v) = env_parse(&lookup, "OPERATOR_COOLDOWN_SECS")? {
            self.supervisor.cooldown_secs = v;
        }
        if let Some(v) = env_parse(&lookup, "OPERATOR_FAILURE_BACKOFF_MS")? {
            self.supervisor.failure_backoff_ms = v;
        }
        if let Some(v) = env_parse(&lookup, "OPERATOR_MAX_RUNTIME_MS")? {
            self.launcher.max_runtime_ms = v;
        }
        if let Some(v) = env_parse(&lookup, "OPERATOR_GRACE_PERIOD_MS")? {
            self.launcher.grace_period_ms = v;
        }
        if let Some(path) = lookup("OPERATOR_STATE_PATH") {
            self.store.path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Reject values no component can work with
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the offending value
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.program.trim().is_empty() {
            return Err(ConfigError::Invalid("worker.program is empty".to_string()));
        }
        if self.launcher.max_runtime_ms == 0 {
            return Err(ConfigError::Invalid(
                "launcher.max_runtime_ms must be positive".to_string(),
            ));
        }
        if self.recovery.steps.is_empty() {
            return Err(ConfigError::Invalid("recovery.steps is empty".to_string()));
        }
        if self.recovery.max_steps == 0 {
            return Err(ConfigError::Invalid(
                "recovery.max_steps must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// With a worker command
    #[inline]
    #[must_use]
    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = worker;
        self
    }

    /// With supervised profiles
    #[inline]
    #[must_use]
    pub fn with_profiles(mut self, profiles: Vec<ProfileId>) -> Self {
        self.profiles = profiles;
        self
    }
}

fn env_parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Env {
                key: key.to_string(),
                value: value.clone(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Breaker and scheduling settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Streak above which a profile is paused
    pub max_error_streak: u32,
    /// Cooldown length once paused
    pub cooldown_secs: u64,
    /// Delay after a failed recovery or an aborted cycle
    pub failure_backoff_ms: u64,
    /// Delay after a successful or recovered cycle
    pub cycle_interval_ms: u64,
    /// Upper bound on a single sleep while paused
    pub pause_poll_interval_ms: u64,
}

impl SupervisorConfig {
    /// Cooldown as a duration
    #[inline]
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    #[inline]
    #[must_use]
    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }

    #[inline]
    #[must_use]
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    #[inline]
    #[must_use]
    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms)
    }

    /// With max error streak
    #[inline]
    #[must_use]
    pub fn with_max_error_streak(mut self, max: u32) -> Self {
        self.max_error_streak = max;
        self
    }

    /// With cooldown
    #[inline]
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_secs = cooldown.as_secs();
        self
    }

    /// With failure backoff
    #[inline]
    #[must_use]
    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff_ms = duration_ms(backoff);
        self
    }

    /// With cycle interval
    #[inline]
    #[must_use]
    pub fn with_cycle_interval(mut self, interval: Duration) -> Self {
        self.cycle_interval_ms = duration_ms(interval);
        self
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_error_streak: 3,
            cooldown_secs: 24 * 60 * 60,
            failure_backoff_ms: 30_000,
            cycle_interval_ms: 5_000,
            pause_poll_interval_ms: 60_000,
        }
    }
}

/// Worker process limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Maximum runtime before the worker is terminated
    pub max_runtime_ms: u64,
    /// Wait between the graceful signal and the forced kill
    pub grace_period_ms: u64,
    /// Captured output lines kept per launch
    pub output_capacity: usize,
    /// Exit codes that mean the worker died of an uncaught error
    pub crash_exit_codes: Vec<i32>,
}

impl LauncherConfig {
    #[inline]
    #[must_use]
    pub fn max_runtime(&self) -> Duration {
        Duration::from_millis(self.max_runtime_ms)
    }

    #[inline]
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// With maximum runtime
    #[inline]
    #[must_use]
    pub fn with_max_runtime(mut self, max: Duration) -> Self {
        self.max_runtime_ms = duration_ms(max);
        self
    }

    /// With grace period
    #[inline]
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = duration_ms(grace);
        self
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            max_runtime_ms: 30 * 60 * 1000,
            grace_period_ms: 5_000,
            output_capacity: 200,
            crash_exit_codes: vec![101],
        }
    }
}

/// Command used to start a profile's worker
///
/// `{profile}` in any argument is replaced with the profile id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl WorkerCommand {
    /// Create a command with no arguments
    #[inline]
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append several arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable
    #[inline]
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Arguments with `{profile}` substituted
    #[must_use]
    pub fn args_for(&self, profile: &ProfileId) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace("{profile}", profile.as_str()))
            .collect()
    }
}

/// One rung of the recovery ladder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStepConfig {
    pub name: String,
    /// Shell command run for this step; log-only when absent
    #[serde(default)]
    pub command: Option<String>,
}

impl RecoveryStepConfig {
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

/// Recovery ladder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Steps tried before wrapping back to the first
    pub max_steps: u32,
    /// Limit on a single action
    pub action_timeout_ms: u64,
    pub steps: Vec<RecoveryStepConfig>,
}

impl RecoveryConfig {
    #[inline]
    #[must_use]
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_steps: u32::try_from(DEFAULT_RECOVERY_STEPS.len()).unwrap_or(u32::MAX),
            action_timeout_ms: 60_000,
            steps: DEFAULT_RECOVERY_STEPS
                .iter()
                .map(|name| RecoveryStepConfig::new(*name))
                .collect(),
        }
    }
}

/// Where runner records live
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON state file; in-memory when absent
    pub path: Option<PathBuf>,
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
profiles = ["alice", "bob"]

[supervisor]
max_error_streak = 5
cooldown_secs = 3600

[launcher]
max_runtime_ms = 120000

[worker]
program = "node"
args = ["worker.js", "--profile", "{profile}"]

[[recovery.steps]]
name = "refresh"
command = "echo refresh {profile}"

[[recovery.steps]]
name = "restart-profile-runtime"
"#;

    #[test]
    fn defaults_match_documented_values() {
        let config = OperatorConfig::new();
        assert_eq!(config.supervisor.max_error_streak, 3);
        assert_eq!(config.supervisor.cooldown(), Duration::from_secs(86_400));
        assert_eq!(config.launcher.crash_exit_codes, vec![101]);
        assert_eq!(config.recovery.steps.len(), 5);
        assert_eq!(config.recovery.max_steps, 5);
        assert!(config.store.path.is_none());
    }

    #[test]
    fn parses_toml_with_partial_sections() {
        let config = OperatorConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.profiles.len(), 2);
        assert_eq!(config.supervisor.max_error_streak, 5);
        assert_eq!(config.supervisor.failure_backoff_ms, 30_000);
        assert_eq!(config.launcher.max_runtime(), Duration::from_secs(120));
        assert_eq!(config.launcher.grace_period_ms, 5_000);
        assert_eq!(config.recovery.steps.len(), 2);
        assert_eq!(
            config.recovery.steps[0].command.as_deref(),
            Some("echo refresh {profile}")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_win() {
        let mut config = OperatorConfig::from_toml(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            ("OPERATOR_MAX_ERROR_STREAK", "7"),
            ("OPERATOR_STATE_PATH", "/tmp/state.json"),
        ]
        .into_iter()
        .collect();

        config
            .apply_env(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.supervisor.max_error_streak, 7);
        assert_eq!(config.store.path, Some(PathBuf::from("/tmp/state.json")));
    }

    #[test]
    fn bad_env_override_is_reported() {
        let mut config = OperatorConfig::new();
        let err = config
            .apply_env(|k| (k == "OPERATOR_GRACE_PERIOD_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("OPERATOR_GRACE_PERIOD_MS=soon"));
    }

    #[test]
    fn validation_rejects_missing_program() {
        let config = OperatorConfig::new();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn profile_placeholder_is_substituted() {
        let cmd = WorkerCommand::new("node").args(["w.js", "--profile", "{profile}"]);
        assert_eq!(
            cmd.args_for(&ProfileId::new("alice")),
            vec!["w.js", "--profile", "alice"]
        );
    }
}
