//! Per-profile scheduling supervisor
//!
//! Drives one loop per profile:
//! launch -> classify -> update state -> recover or pause -> wait -> repeat.
//!
//! Profiles run in parallel, one task each; everything within a profile is
//! serialized. Worker outcome failures are absorbed by the breaker and the
//! recovery ladder; only launch and persistence errors abort a cycle.

use crate::breaker::{CircuitBreaker, PauseStatus};
use crate::config::{OperatorConfig, SupervisorConfig, WorkerCommand};
use crate::error::{LaunchError, SupervisorError};
use crate::launcher::{LaunchOutcome, WorkerLauncher};
use crate::lifecycle::{validate_transition, ProfilePhase};
use crate::recovery::{RecoveryOutcome, RecoveryStepExecutor};
use crate::store::RunnerStateStore;
use crate::types::{CancelReason, Clock, FailureEvent, ProfileId, RunnerState, RunnerStatePatch};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one scheduling cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Worker exited cleanly
    Succeeded,
    /// Worker failed and the recovery step succeeded
    Recovered(RecoveryOutcome),
    /// Worker failed and the recovery step failed too
    RecoveryFailed(RecoveryOutcome),
    /// Profile is cooling down
    Paused { until: DateTime<Utc> },
    /// Worker was stopped by shutdown or a pause request
    Cancelled,
}

/// Supervisor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    /// Cycles that launched a worker
    pub cycles: u64,
    pub successes: u64,
    /// Classified worker failures
    pub failures: u64,
    pub recoveries_attempted: u64,
    pub recoveries_succeeded: u64,
    /// Times the breaker tripped
    pub pauses: u64,
    pub launch_errors: u64,
}

/// Phase plus persisted record of one profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSnapshot {
    pub phase: ProfilePhase,
    pub worker_active: bool,
    pub state: RunnerState,
}

/// Orchestrates launcher, breaker and recovery ladder per profile
#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
    worker: WorkerCommand,
    store: Arc<dyn RunnerStateStore>,
    launcher: WorkerLauncher,
    breaker: CircuitBreaker,
    recovery: RecoveryStepExecutor,
    phases: DashMap<ProfileId, ProfilePhase>,
    cycles: DashMap<ProfileId, ()>,
    shutdown: CancellationToken,
    stats: Mutex<SupervisorStats>,
}

/// Marks a profile's cycle as in flight until dropped
struct CycleClaim<'a> {
    cycles: &'a DashMap<ProfileId, ()>,
    profile: ProfileId,
}

impl<'a> CycleClaim<'a> {
    fn acquire(cycles: &'a DashMap<ProfileId, ()>, profile: &ProfileId) -> Option<Self> {
        match cycles.entry(profile.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(Self {
                    cycles,
                    profile: profile.clone(),
                })
            }
        }
    }
}

impl Drop for CycleClaim<'_> {
    fn drop(&mut self) {
        self.cycles.remove(&self.profile);
    }
}

impl Supervisor {
    /// Build every component from configuration
    #[must_use]
    pub fn new(config: &OperatorConfig, store: Arc<dyn RunnerStateStore>) -> Self {
        Self {
            config: config.supervisor,
            worker: config.worker.clone(),
            launcher: WorkerLauncher::new(config.launcher.clone()),
            breaker: CircuitBreaker::new(Arc::clone(&store), &config.supervisor),
            recovery: RecoveryStepExecutor::from_config(Arc::clone(&store), &config.recovery),
            store,
            phases: DashMap::new(),
            cycles: DashMap::new(),
            shutdown: CancellationToken::new(),
            stats: Mutex::new(SupervisorStats::default()),
        }
    }

    /// With a different time source for cooldowns
    #[inline]
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.breaker = self.breaker.with_clock(clock);
        self
    }

    /// With a custom recovery ladder
    #[inline]
    #[must_use]
    pub fn with_recovery(mut self, recovery: RecoveryStepExecutor) -> Self {
        self.recovery = recovery;
        self
    }

    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RunnerStateStore> {
        &self.store
    }

    #[inline]
    #[must_use]
    pub fn launcher(&self) -> &WorkerLauncher {
        &self.launcher
    }

    #[inline]
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Current phase, `Idle` for unknown profiles
    #[must_use]
    pub fn phase(&self, profile: &ProfileId) -> ProfilePhase {
        self.phases.get(profile).map(|p| *p).unwrap_or_default()
    }

    /// Whether `shutdown` was called
    #[inline]
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> SupervisorStats {
        *self.stats.lock()
    }

    /// Run one scheduling cycle for `profile`
    ///
    /// Cycles of one profile never overlap: a call made while another cycle
    /// for the same profile is in flight is rejected before it touches the
    /// phase or the record.
    ///
    /// # Errors
    /// - `SupervisorError::Launch` if the worker could not be started, or
    ///   `LaunchError::AlreadyRunning` if a cycle is already in flight
    /// - `SupervisorError::Persistence` if the store failed mid-cycle
    /// - `SupervisorError::IllegalTransition` on a phase bug
    pub async fn run_cycle(&self, profile: &ProfileId) -> Result<CycleOutcome, SupervisorError> {
        let Some(_claim) = CycleClaim::acquire(&self.cycles, profile) else {
            warn!(profile = %profile, "cycle already in flight");
            return Err(LaunchError::AlreadyRunning(profile.clone()).into());
        };

        let result = self.cycle(profile).await;
        if let Err(e) = &result {
            error!(profile = %profile, error = %e, "cycle aborted");
            self.phases.insert(profile.clone(), ProfilePhase::Idle);
        }
        result
    }

    async fn cycle(&self, profile: &ProfileId) -> Result<CycleOutcome, SupervisorError> {
        if self.is_shut_down() {
            return Ok(CycleOutcome::Cancelled);
        }

        match self.breaker.pause_status(profile).await? {
            PauseStatus::Active { until } => {
                self.transition(profile, ProfilePhase::Paused)?;
                debug!(profile = %profile, paused_until = %until, "profile cooling down");
                return Ok(CycleOutcome::Paused { until });
            }
            PauseStatus::Elapsed => {
                self.breaker.resume_if_elapsed(profile).await?;
                self.transition(profile, ProfilePhase::Idle)?;
            }
            PauseStatus::NotPaused => self.transition(profile, ProfilePhase::Idle)?,
        }

        self.transition(profile, ProfilePhase::Running)?;
        self.store
            .update(profile, RunnerStatePatch::new().running(true))
            .await?;
        self.stats.lock().cycles += 1;

        let launched = self.launcher.launch(profile, &self.worker).await;
        self.store
            .update(profile, RunnerStatePatch::new().running(false))
            .await?;

        let report = match launched {
            Ok(report) => report,
            Err(e) => {
                self.stats.lock().launch_errors += 1;
                self.transition(profile, ProfilePhase::Idle)?;
                return Err(e.into());
            }
        };

        let event = match report.outcome {
            LaunchOutcome::Finished(event) => event,
            LaunchOutcome::Cancelled(reason) => return self.cancelled(profile, reason).await,
        };

        // A pause stored by another process while the worker ran wins over
        // the outcome, as if the worker had been cancelled for it.
        if let PauseStatus::Active { until } = self.breaker.pause_status(profile).await? {
            info!(
                profile = %profile,
                outcome = %event,
                "pause arrived during launch, outcome dropped"
            );
            self.transition(profile, ProfilePhase::Paused)?;
            return Ok(CycleOutcome::Paused { until });
        }

        if event == FailureEvent::Success {
            self.breaker.on_success(profile).await?;
            self.stats.lock().successes += 1;
            self.transition(profile, ProfilePhase::Idle)?;
            info!(profile = %profile, "worker succeeded");
            return Ok(CycleOutcome::Succeeded);
        }

        self.stats.lock().failures += 1;
        if let Some(failure) = report.failure(self.launcher.config().max_runtime()) {
            warn!(profile = %profile, error = %failure, "worker failed");
        }

        let decision = self.breaker.on_failure(profile).await?;
        if let Some(until) = decision.paused_until {
            self.stats.lock().pauses += 1;
            self.transition(profile, ProfilePhase::Paused)?;
            return Ok(CycleOutcome::Paused { until });
        }

        self.transition(profile, ProfilePhase::RecoveryExecuting)?;
        self.stats.lock().recoveries_attempted += 1;
        let outcome = self.recovery.recover(profile).await?;
        self.transition(profile, ProfilePhase::Idle)?;

        if outcome.success {
            self.stats.lock().recoveries_succeeded += 1;
            Ok(CycleOutcome::Recovered(outcome))
        } else {
            Ok(CycleOutcome::RecoveryFailed(outcome))
        }
    }

    async fn cancelled(
        &self,
        profile: &ProfileId,
        reason: CancelReason,
    ) -> Result<CycleOutcome, SupervisorError> {
        if reason == CancelReason::PauseRequested {
            if let PauseStatus::Active { until } = self.breaker.pause_status(profile).await? {
                self.transition(profile, ProfilePhase::Paused)?;
                return Ok(CycleOutcome::Paused { until });
            }
        }
        self.transition(profile, ProfilePhase::Idle)?;
        Ok(CycleOutcome::Cancelled)
    }

    /// Loop cycles for `profile` until shutdown
    ///
    /// A non-retryable error (an unusable worker command, a corrupt state
    /// file) ends the loop for this profile only.
    pub async fn run_profile(&self, profile: ProfileId) {
        info!(profile = %profile, "supervising profile");

        while !self.is_shut_down() {
            let delay = match self.run_cycle(&profile).await {
                Ok(
                    CycleOutcome::Succeeded
                    | CycleOutcome::Recovered(_)
                    | CycleOutcome::Cancelled,
                ) => self.config.cycle_interval(),
                Ok(CycleOutcome::RecoveryFailed(_)) => self.config.failure_backoff(),
                Ok(CycleOutcome::Paused { until }) => self.pause_wait(until),
                Err(e) if e.is_retryable() => self.config.failure_backoff(),
                Err(e) => {
                    error!(profile = %profile, error = %e, "unrecoverable error, giving up");
                    break;
                }
            };

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        info!(profile = %profile, "profile supervision stopped");
    }

    /// Remaining cooldown, capped by the poll interval
    fn pause_wait(&self, until: DateTime<Utc>) -> Duration {
        let remaining = (until - self.breaker.now()).to_std().unwrap_or(Duration::ZERO);
        remaining.min(self.config.pause_poll_interval())
    }

    /// Supervise every profile in parallel until `shutdown`
    ///
    /// Duplicate ids are supervised once.
    pub async fn run(self: &Arc<Self>, mut profiles: Vec<ProfileId>) {
        let mut seen = HashSet::new();
        profiles.retain(|p| seen.insert(p.clone()));
        info!(profiles = profiles.len(), "supervisor starting");

        let handles: Vec<_> = profiles
            .into_iter()
            .map(|profile| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.run_profile(profile).await })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "profile task panicked");
            }
        }

        info!(stats = ?self.stats(), "supervisor stopped");
    }

    /// Stop every profile loop and every active worker
    pub fn shutdown(&self) {
        info!("supervisor shutting down");
        self.shutdown.cancel();
        self.launcher.shutdown();
    }

    /// Pause `profile` for `duration` and stop its active worker
    ///
    /// The streak is left untouched.
    ///
    /// # Errors
    /// `SupervisorError::Persistence` when the pause cannot be stored
    pub async fn request_pause(
        &self,
        profile: &ProfileId,
        duration: Duration,
    ) -> Result<DateTime<Utc>, SupervisorError> {
        let until = self.breaker.force_pause(profile, duration).await?;
        if self.launcher.cancel(profile, CancelReason::PauseRequested) {
            info!(profile = %profile, "active worker cancelled for pause");
        }
        Ok(until)
    }

    /// Clear a pause and reset the streak
    ///
    /// # Errors
    /// `SupervisorError::Persistence` when the record cannot be stored
    pub async fn resume(&self, profile: &ProfileId) -> Result<RunnerState, SupervisorError> {
        Ok(self.breaker.resume(profile).await?)
    }

    /// Phase and record of every known profile, ordered by id
    ///
    /// # Errors
    /// `SupervisorError::Persistence` when the store cannot be listed
    pub async fn snapshot(&self) -> Result<Vec<ProfileSnapshot>, SupervisorError> {
        let mut states = self.store.list().await?;
        let tracked: Vec<ProfileId> = self.phases.iter().map(|e| e.key().clone()).collect();
        for profile in tracked {
            if !states.iter().any(|s| s.profile_id == profile) {
                states.push(self.store.get(&profile).await?);
            }
        }
        states.sort_by(|a, b| a.profile_id.cmp(&b.profile_id));

        Ok(states
            .into_iter()
            .map(|state| ProfileSnapshot {
                phase: self.phase(&state.profile_id),
                worker_active: self.launcher.is_running(&state.profile_id),
                state,
            })
            .collect())
    }

    fn transition(&self, profile: &ProfileId, to: ProfilePhase) -> Result<(), SupervisorError> {
        let mut phase = self.phases.entry(profile.clone()).or_default();
        let from = *phase;
        if from == to {
            return Ok(());
        }
        validate_transition(profile, from, to)?;
        *phase = to;
        debug!(profile = %profile, ?from, ?to, "phase changed");
        Ok(())
    }
}
