//! Per-profile error-streak circuit breaker
//!
//! Counts consecutive classified failures and pauses a profile once the
//! streak is strictly greater than `max_error_streak`. A paused profile stays
//! paused until `pausedUntil`; after that it is eligible again but keeps its
//! streak, so the next failure pauses it straight away. Only a success (or an
//! operator resume) resets the streak.

use crate::config::SupervisorConfig;
use crate::error::PersistenceError;
use crate::store::RunnerStateStore;
use crate::types::{Clock, ProfileId, RunnerState, RunnerStatePatch, SystemClock};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the breaker decided after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerDecision {
    /// Streak after the increment
    pub error_streak: u32,
    /// End of the cooldown when the profile is paused
    pub paused_until: Option<DateTime<Utc>>,
}

impl BreakerDecision {
    #[inline]
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused_until.is_some()
    }
}

/// Pause state of a profile at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseStatus {
    /// Not paused
    NotPaused,
    /// Cooling down until the given instant
    Active { until: DateTime<Utc> },
    /// Flagged paused but the cooldown is over
    Elapsed,
}

/// Error-streak breaker over the shared state store
#[derive(Debug)]
pub struct CircuitBreaker {
    store: Arc<dyn RunnerStateStore>,
    clock: Arc<dyn Clock>,
    max_error_streak: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    /// Create a breaker using the system clock
    #[must_use]
    pub fn new(store: Arc<dyn RunnerStateStore>, config: &SupervisorConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            max_error_streak: config.max_error_streak,
            cooldown: config.cooldown(),
        }
    }

    /// With a different time source
    #[inline]
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[inline]
    #[must_use]
    pub fn max_error_streak(&self) -> u32 {
        self.max_error_streak
    }

    #[inline]
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Current instant of the breaker's clock
    #[inline]
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Record a classified failure and pause if the streak is too long
    ///
    /// # Errors
    /// `PersistenceError` when the store rejects the update
    pub async fn on_failure(
        &self,
        profile: &ProfileId,
    ) -> Result<BreakerDecision, PersistenceError> {
        let state = self
            .store
            .update(
                profile,
                RunnerStatePatch::new()
                    .increment_error_streak()
                    .needs_recovery(true),
            )
            .await?;
        debug!(profile = %profile, error_streak = state.error_streak, "failure recorded");

        let paused_until = self.evaluate_pause(profile).await?;
        Ok(BreakerDecision {
            error_streak: state.error_streak,
            paused_until,
        })
    }

    /// Pause the profile if its streak exceeds the maximum
    ///
    /// Returns the end of the cooldown when the profile is (or already was)
    /// cooling down, `None` otherwise. A cooldown in force is never extended.
    ///
    /// # Errors
    /// `PersistenceError` when the store rejects the update
    pub async fn evaluate_pause(
        &self,
        profile: &ProfileId,
    ) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        let state = self.store.get(profile).await?;
        let now = self.clock.now();

        if state.is_cooling_down(now) {
            return Ok(state.paused_until);
        }
        if state.error_streak <= self.max_error_streak {
            return Ok(None);
        }

        let until = deadline(now, self.cooldown);
        self.store
            .update(
                profile,
                RunnerStatePatch::new()
                    .paused(true)
                    .needs_recovery(false)
                    .paused_until(Some(until)),
            )
            .await?;

        warn!(
            profile = %profile,
            error_streak = state.error_streak,
            max_error_streak = self.max_error_streak,
            paused_until = %until,
            "error streak exceeded, pausing profile"
        );
        Ok(Some(until))
    }

    /// Record a success: streak, cursor and pause are all cleared
    ///
    /// # Errors
    /// `PersistenceError` when the store rejects the update
    pub async fn on_success(&self, profile: &ProfileId) -> Result<RunnerState, PersistenceError> {
        let state = self.store.update(profile, cleared()).await?;
        debug!(profile = %profile, "success recorded, streak reset");
        Ok(state)
    }

    /// Pause state at the current instant
    ///
    /// # Errors
    /// `PersistenceError` when the record cannot be read
    pub async fn pause_status(&self, profile: &ProfileId) -> Result<PauseStatus, PersistenceError> {
        let state = self.store.get(profile).await?;
        let now = self.clock.now();
        Ok(match state.paused_until {
            Some(until) if now < until => PauseStatus::Active { until },
            _ if state.flags.paused => PauseStatus::Elapsed,
            _ => PauseStatus::NotPaused,
        })
    }

    /// Whether a cooldown is in force
    ///
    /// # Errors
    /// `PersistenceError` when the record cannot be read
    pub async fn is_paused(&self, profile: &ProfileId) -> Result<bool, PersistenceError> {
        Ok(matches!(
            self.pause_status(profile).await?,
            PauseStatus::Active { .. }
        ))
    }

    /// Clear the paused flag once the cooldown is over
    ///
    /// The streak is kept. Returns `true` when the flag was cleared.
    ///
    /// # Errors
    /// `PersistenceError` when the store rejects the update
    pub async fn resume_if_elapsed(&self, profile: &ProfileId) -> Result<bool, PersistenceError> {
        if self.pause_status(profile).await? != PauseStatus::Elapsed {
            return Ok(false);
        }
        self.store
            .update(profile, RunnerStatePatch::new().paused(false))
            .await?;
        info!(profile = %profile, "cooldown elapsed, profile eligible again");
        Ok(true)
    }

    /// Pause for `duration` regardless of the streak
    ///
    /// # Errors
    /// `PersistenceError` when the store rejects the update
    pub async fn force_pause(
        &self,
        profile: &ProfileId,
        duration: Duration,
    ) -> Result<DateTime<Utc>, PersistenceError> {
        let until = deadline(self.clock.now(), duration);
        self.store
            .update(
                profile,
                RunnerStatePatch::new()
                    .paused(true)
                    .paused_until(Some(until)),
            )
            .await?;
        info!(profile = %profile, paused_until = %until, "profile paused by operator");
        Ok(until)
    }

    /// Lift any pause and forget the streak
    ///
    /// # Errors
    /// `PersistenceError` when the store rejects the update
    pub async fn resume(&self, profile: &ProfileId) -> Result<RunnerState, PersistenceError> {
        let state = self.store.update(profile, cleared()).await?;
        info!(profile = %profile, "profile resumed by operator");
        Ok(state)
    }
}

fn cleared() -> RunnerStatePatch {
    RunnerStatePatch::new()
        .error_streak(0)
        .needs_recovery(false)
        .last_recovery_step(0)
        .paused(false)
        .paused_until(None)
}

fn deadline(now: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
