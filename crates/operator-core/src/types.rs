//! Core types for the operator
//!
//! Defines the fundamental records shared by every component:
//! - Profile identifiers and launch identifiers
//! - The persisted per-profile runner record and its partial update
//! - Worker outcome classification
//! - The clock abstraction used for cooldown arithmetic

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Identity of one supervised profile
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(String);

impl ProfileId {
    /// Create a profile id
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProfileId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProfileId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Unique id of a single worker launch (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LaunchId(pub Ulid);

impl LaunchId {
    /// Generate new launch ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for LaunchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LaunchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Boolean flags of a runner record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerFlags {
    /// A worker is currently active for the profile
    pub running: bool,
    /// The last outcome was a failure that has not been recovered
    pub needs_recovery: bool,
    /// The circuit breaker tripped
    pub paused: bool,
}

/// Persisted per-profile runner record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerState {
    /// Profile this record belongs to
    pub profile_id: ProfileId,
    /// Consecutive classified failures since the last success
    pub error_streak: u32,
    /// Lifecycle flags
    pub flags: RunnerFlags,
    /// End of the current cooldown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_until: Option<DateTime<Utc>>,
    /// Index of the recovery step executed last, 0 when idle
    pub last_recovery_step: u32,
    /// Time of the last write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RunnerState {
    /// Default record for a profile that has never been seen
    #[must_use]
    pub fn new(profile_id: ProfileId) -> Self {
        Self {
            profile_id,
            error_streak: 0,
            flags: RunnerFlags::default(),
            paused_until: None,
            last_recovery_step: 0,
            updated_at: None,
        }
    }

    /// Whether a cooldown is in force at `now`
    #[inline]
    #[must_use]
    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.paused_until.is_some_and(|until| now < until)
    }

    /// Merge a partial update into this record
    pub fn apply(&mut self, patch: &RunnerStatePatch) {
        match patch.error_streak {
            Some(StreakUpdate::Set(value)) => self.error_streak = value,
            Some(StreakUpdate::Increment) => {
                self.error_streak = self.error_streak.saturating_add(1);
            }
            None => {}
        }
        if let Some(running) = patch.running {
            self.flags.running = running;
        }
        if let Some(needs_recovery) = patch.needs_recovery {
            self.flags.needs_recovery = needs_recovery;
        }
        if let Some(paused) = patch.paused {
            self.flags.paused = paused;
        }
        if let Some(paused_until) = patch.paused_until {
            self.paused_until = paused_until;
        }
        if let Some(step) = patch.last_recovery_step {
            self.last_recovery_step = step;
        }
    }
}

/// How a patch changes the error streak
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreakUpdate {
    /// Overwrite with a value
    Set(u32),
    /// Add one to whatever is stored
    Increment,
}

/// Partial update of a [`RunnerState`]
///
/// Fields left as `None` are not touched by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerStatePatch {
    pub error_streak: Option<StreakUpdate>,
    pub running: Option<bool>,
    pub needs_recovery: Option<bool>,
    pub paused: Option<bool>,
    /// `Some(None)` clears the cooldown
    pub paused_until: Option<Option<DateTime<Utc>>>,
    pub last_recovery_step: Option<u32>,
}

impl RunnerStatePatch {
    /// Empty patch
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the error streak
    #[inline]
    #[must_use]
    pub fn error_streak(mut self, value: u32) -> Self {
        self.error_streak = Some(StreakUpdate::Set(value));
        self
    }

    /// Increment the error streak in place
    #[inline]
    #[must_use]
    pub fn increment_error_streak(mut self) -> Self {
        self.error_streak = Some(StreakUpdate::Increment);
        self
    }

    #[inline]
    #[must_use]
    pub fn running(mut self, value: bool) -> Self {
        self.running = Some(value);
        self
    }

    #[inline]
    #[must_use]
    pub fn needs_recovery(mut self, value: bool) -> Self {
        self.needs_recovery = Some(value);
        self
    }

    #[inline]
    #[must_use]
    pub fn paused(mut self, value: bool) -> Self {
        self.paused = Some(value);
        self
    }

    #[inline]
    #[must_use]
    pub fn paused_until(mut self, value: Option<DateTime<Utc>>) -> Self {
        self.paused_until = Some(value);
        self
    }

    #[inline]
    #[must_use]
    pub fn last_recovery_step(mut self, value: u32) -> Self {
        self.last_recovery_step = Some(value);
        self
    }
}

/// Classification of one completed worker launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FailureEvent {
    /// Clean exit with code 0
    Success,
    /// The maximum runtime elapsed and the worker was terminated
    Timeout,
    /// Exit with a non-zero code
    NonZeroExit { code: i32 },
    /// Uncaught error surfaced by the worker
    Crash,
}

impl FailureEvent {
    /// Whether the event counts as a failure for the breaker
    #[inline]
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Success)
    }
}

impl fmt::Display for FailureEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Timeout => write!(f, "timeout"),
            Self::NonZeroExit { code } => write!(f, "exit code {code}"),
            Self::Crash => write!(f, "crash"),
        }
    }
}

/// Why an active worker was stopped by the operator rather than by itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The supervisor is shutting down
    Shutdown,
    /// An external pause request arrived for the profile
    PauseRequested,
}

/// Source of wall-clock time
///
/// Cooldown arithmetic goes through this trait so tests can move time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
