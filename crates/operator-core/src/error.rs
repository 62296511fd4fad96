//! Error types for the operator
//!
//! Provides error handling for:
//! - Worker launch failures
//! - Classified worker failures (timeout, exit, crash)
//! - Recovery action failures
//! - State persistence failures
//! - Supervisor lifecycle violations

use crate::lifecycle::ProfilePhase;
use crate::types::ProfileId;
use std::time::Duration;

/// Main supervisor error type
///
/// Only launch and persistence failures abort a scheduling cycle; worker
/// outcome failures are absorbed by the breaker and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Worker could not be started
    #[error("launch failed: {0}")]
    Launch(#[from] LaunchError),

    /// State store unavailable
    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),

    /// Phase change not allowed by the lifecycle
    #[error("illegal transition for {profile}: {from:?} -> {to:?}")]
    IllegalTransition {
        profile: ProfileId,
        from: ProfilePhase,
        to: ProfilePhase,
    },
}

impl SupervisorError {
    /// Whether the failed cycle may simply be tried again after backoff
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Launch(LaunchError::Spawn { .. } | LaunchError::AlreadyRunning(_))
                | Self::Persistence(PersistenceError::Io(_) | PersistenceError::Unavailable(_))
        )
    }

    /// Whether the error ends the current scheduling cycle
    #[inline]
    #[must_use]
    pub fn aborts_cycle(&self) -> bool {
        matches!(self, Self::Launch(_) | Self::Persistence(_))
    }
}

/// Worker launch errors
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The subprocess could not be spawned
    #[error("failed to spawn worker for {profile}: {source}")]
    Spawn {
        profile: ProfileId,
        #[source]
        source: std::io::Error,
    },

    /// A worker is already active for the profile
    #[error("worker already running for profile {0}")]
    AlreadyRunning(ProfileId),

    /// The worker command is unusable
    #[error("invalid worker command: {0}")]
    InvalidCommand(String),
}

/// A classified worker failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerFailure {
    /// Deadline exceeded
    #[error("worker timed out after {}ms", after.as_millis())]
    Timeout { after: Duration },

    /// Non-zero exit
    #[error("worker exited with code {code}")]
    Exit { code: i32 },

    /// Uncaught error surfaced by the worker
    #[error("worker crashed: {detail}")]
    Crash { detail: String },
}

/// Recovery action errors
#[derive(Debug, thiserror::Error)]
pub enum RecoveryStepError {
    /// The action ran and reported failure
    #[error("recovery action {action} failed: {message}")]
    Failed { action: String, message: String },

    /// The action did not finish in time
    #[error("recovery action {action} timed out after {}ms", after.as_millis())]
    TimedOut { action: String, after: Duration },

    /// The action's command could not be started
    #[error("recovery action {action} could not start: {source}")]
    Spawn {
        action: String,
        #[source]
        source: std::io::Error,
    },
}

impl RecoveryStepError {
    /// Create a failure for an action
    #[inline]
    pub fn failed(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            action: action.into(),
            message: message.into(),
        }
    }
}

/// State store errors
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Backing file could not be read or written
    #[error("state store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored document is malformed
    #[error("state store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store cannot serve requests
    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// TOML is malformed
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Environment override holds an unparsable value
    #[error("failed to parse env var {key}={value}: {message}")]
    Env {
        key: String,
        value: String,
        message: String,
    },

    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}
