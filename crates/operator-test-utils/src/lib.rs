//! Testing utilities for the profile operator workspace
//!
//! Shared fixtures: a manually advanced clock, a recovery action with a
//! scripted sequence of results, and shell-command helpers.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use operator_core::{
    Clock, MemoryStateStore, OperatorConfig, ProfileId, RecoveryAction, RecoveryStepError,
    RunnerStateStore, WorkerCommand,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn starting_now() -> Arc<Self> {
        Arc::new(Self::new(Utc::now()))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        let step = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        *now = now.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Recovery action that replays a scripted list of results
///
/// Once the script is exhausted every further call succeeds.
#[derive(Debug)]
pub struct ScriptedAction {
    name: String,
    script: Mutex<VecDeque<bool>>,
    calls: AtomicUsize,
    profiles: Mutex<Vec<ProfileId>>,
}

impl ScriptedAction {
    pub fn new(name: &str, script: impl IntoIterator<Item = bool>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
            profiles: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding(name: &str) -> Arc<Self> {
        Self::new(name, [])
    }

    pub fn failing(name: &str, times: usize) -> Arc<Self> {
        Self::new(name, std::iter::repeat(false).take(times))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Profiles the action ran for, in call order
    pub fn profiles(&self) -> Vec<ProfileId> {
        self.profiles.lock().clone()
    }
}

#[async_trait]
impl RecoveryAction for ScriptedAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, profile: &ProfileId) -> Result<(), RecoveryStepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.profiles.lock().push(profile.clone());
        match self.script.lock().pop_front() {
            Some(false) => Err(RecoveryStepError::failed(&self.name, "scripted failure")),
            _ => Ok(()),
        }
    }
}

/// Ladder of scripted actions, upcast for `RecoveryStepExecutor::new`
pub fn ladder(actions: &[Arc<ScriptedAction>]) -> Vec<Arc<dyn RecoveryAction>> {
    actions
        .iter()
        .map(|a| Arc::clone(a) as Arc<dyn RecoveryAction>)
        .collect()
}

/// Worker command running `script` through `sh -c`
pub fn sh_command(script: &str) -> WorkerCommand {
    WorkerCommand::new("sh").args(["-c", script])
}

/// Fresh in-memory store behind the trait object
pub fn memory_store() -> Arc<dyn RunnerStateStore> {
    Arc::new(MemoryStateStore::new())
}

/// Configuration with short timings suited to tests
pub fn fast_config(worker: WorkerCommand) -> OperatorConfig {
    let mut config = OperatorConfig::new().with_worker(worker);
    config.supervisor.cycle_interval_ms = 20;
    config.supervisor.failure_backoff_ms = 20;
    config.supervisor.pause_poll_interval_ms = 50;
    config.launcher.max_runtime_ms = 5_000;
    config.launcher.grace_period_ms = 500;
    config.recovery.action_timeout_ms = 1_000;
    config
}
