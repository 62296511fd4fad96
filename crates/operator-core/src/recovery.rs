//! Escalating recovery ladder
//!
//! After a classified worker failure the supervisor runs one rung of an
//! ordered ladder of named actions. The per-profile cursor
//! (`lastRecoveryStep`) advances after every attempt, successful or not, and
//! wraps back to the first rung after `max_steps`.
//!
//! Action errors never escape the executor: they are logged and reported as
//! `success: false`.

use crate::config::RecoveryConfig;
use crate::error::{PersistenceError, RecoveryStepError};
use crate::launcher::PROFILE_ENV;
use crate::store::RunnerStateStore;
use crate::types::{ProfileId, RunnerStatePatch};
use async_trait::async_trait;
use std::fmt::Debug;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// One remedial action
#[async_trait]
pub trait RecoveryAction: Send + Sync + Debug {
    /// Stable action name used in logs and outcomes
    fn name(&self) -> &str;

    /// Attempt the remedy for `profile`
    async fn run(&self, profile: &ProfileId) -> Result<(), RecoveryStepError>;
}

/// Action that only records that the rung was reached
///
/// Used for rungs with no configured command; the remedy itself is carried
/// out by the worker on its next launch.
#[derive(Debug, Clone)]
pub struct LogOnlyAction {
    name: String,
}

impl LogOnlyAction {
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl RecoveryAction for LogOnlyAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, profile: &ProfileId) -> Result<(), RecoveryStepError> {
        info!(profile = %profile, action = %self.name, "recovery action requested");
        Ok(())
    }
}

/// Action that runs a shell command and succeeds iff it exits 0
#[derive(Debug, Clone)]
pub struct CommandAction {
    name: String,
    command: String,
}

impl CommandAction {
    /// `{profile}` in `command` is replaced with the profile id
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }

    fn shell(script: &str) -> Command {
        #[cfg(unix)]
        {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(script);
            cmd
        }
        #[cfg(not(unix))]
        {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(script);
            cmd
        }
    }
}

#[async_trait]
impl RecoveryAction for CommandAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, profile: &ProfileId) -> Result<(), RecoveryStepError> {
        let script = self.command.replace("{profile}", profile.as_str());
        debug!(
            profile = %profile,
            action = %self.name,
            script = %script,
            "running recovery command"
        );

        let output = Self::shell(&script)
            .env(PROFILE_ENV, profile.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RecoveryStepError::Spawn {
                action: self.name.clone(),
                source,
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().last().unwrap_or("").trim();
        let message = match output.status.code() {
            Some(code) if detail.is_empty() => format!("exited with code {code}"),
            Some(code) => format!("exited with code {code}: {detail}"),
            None => "terminated by signal".to_string(),
        };
        Err(RecoveryStepError::failed(&self.name, message))
    }
}

/// Result of one recovery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// 1-based rung that was executed
    pub step: u32,
    /// Action name at that rung
    pub action: String,
    pub success: bool,
}

/// Runs rungs of the recovery ladder and tracks the per-profile cursor
#[derive(Debug)]
pub struct RecoveryStepExecutor {
    steps: Vec<Arc<dyn RecoveryAction>>,
    max_steps: u32,
    action_timeout: Duration,
    store: Arc<dyn RunnerStateStore>,
}

impl RecoveryStepExecutor {
    /// Create an executor over an explicit ladder
    ///
    /// `max_steps` is clamped to the ladder length.
    #[must_use]
    pub fn new(
        store: Arc<dyn RunnerStateStore>,
        steps: Vec<Arc<dyn RecoveryAction>>,
        max_steps: u32,
        action_timeout: Duration,
    ) -> Self {
        let len = u32::try_from(steps.len()).unwrap_or(u32::MAX);
        Self {
            max_steps: max_steps.min(len),
            steps,
            action_timeout,
            store,
        }
    }

    /// Build the ladder described by configuration
    #[must_use]
    pub fn from_config(store: Arc<dyn RunnerStateStore>, config: &RecoveryConfig) -> Self {
        let steps = config
            .steps
            .iter()
            .map(|step| -> Arc<dyn RecoveryAction> {
                match &step.command {
                    Some(command) => Arc::new(CommandAction::new(&step.name, command)),
                    None => Arc::new(LogOnlyAction::new(&step.name)),
                }
            })
            .collect();
        Self::new(store, steps, config.max_steps, config.action_timeout())
    }

    /// Effective ladder length
    #[inline]
    #[must_use]
    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    /// Action names in ladder order
    #[must_use]
    pub fn action_names(&self) -> Vec<String> {
        self.steps.iter().map(|a| a.name().to_string()).collect()
    }

    /// Rung following `current`, wrapping to 1 after `max_steps`
    #[inline]
    #[must_use]
    pub fn next_step(&self, current: u32) -> u32 {
        if current >= self.max_steps {
            1
        } else {
            current + 1
        }
    }

    /// Run exactly the action at 1-based `step`
    ///
    /// Never fails: action errors, timeouts and out-of-range steps are
    /// logged and reported as `success: false`.
    pub async fn execute(&self, profile: &ProfileId, step: u32) -> RecoveryOutcome {
        let Some(action) = step
            .checked_sub(1)
            .filter(|i| *i < self.max_steps)
            .and_then(|i| self.steps.get(i as usize))
        else {
            warn!(
                profile = %profile,
                step,
                max_steps = self.max_steps,
                "recovery step out of range"
            );
            return RecoveryOutcome {
                step,
                action: String::new(),
                success: false,
            };
        };

        let name = action.name().to_string();
        info!(profile = %profile, step, action = %name, "executing recovery step");

        let result = match tokio::time::timeout(self.action_timeout, action.run(profile)).await {
            Ok(result) => result,
            Err(_) => Err(RecoveryStepError::TimedOut {
                action: name.clone(),
                after: self.action_timeout,
            }),
        };

        let success = match result {
            Ok(()) => {
                info!(profile = %profile, step, action = %name, "recovery step succeeded");
                true
            }
            Err(e) => {
                warn!(profile = %profile, step, action = %name, error = %e, "recovery step failed");
                false
            }
        };

        RecoveryOutcome {
            step,
            action: name,
            success,
        }
    }

    /// Advance the profile's cursor and run that rung
    ///
    /// The new cursor is persisted whether or not the action succeeded; a
    /// successful action also clears `needsRecovery`.
    ///
    /// # Errors
    /// `PersistenceError` when the cursor cannot be read or written
    pub async fn recover(&self, profile: &ProfileId) -> Result<RecoveryOutcome, PersistenceError> {
        let state = self.store.get(profile).await?;
        let step = self.next_step(state.last_recovery_step);
        let outcome = self.execute(profile, step).await;

        let mut patch = RunnerStatePatch::new().last_recovery_step(step);
        if outcome.success {
            patch = patch.needs_recovery(false);
        }
        self.store.update(profile, patch).await?;

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl RecoveryAction for Counting {
        fn name(&self) -> &str {
            if self.fail {
                "broken"
            } else {
                "counting"
            }
        }

        async fn run(&self, _profile: &ProfileId) -> Result<(), RecoveryStepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(RecoveryStepError::failed("broken", "boom"))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Debug)]
    struct Slow;

    #[async_trait]
    impl RecoveryAction for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn run(&self, _profile: &ProfileId) -> Result<(), RecoveryStepError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn ladder(len: usize) -> Vec<Arc<dyn RecoveryAction>> {
        (0..len)
            .map(|_| Arc::new(Counting::default()) as Arc<dyn RecoveryAction>)
            .collect()
    }

    fn executor(steps: Vec<Arc<dyn RecoveryAction>>, max: u32) -> RecoveryStepExecutor {
        RecoveryStepExecutor::new(
            Arc::new(MemoryStateStore::new()),
            steps,
            max,
            Duration::from_millis(200),
        )
    }

    #[test]
    fn next_step_wraps_after_max() {
        let exec = executor(ladder(5), 3);
        assert_eq!(exec.next_step(0), 1);
        assert_eq!(exec.next_step(2), 3);
        assert_eq!(exec.next_step(3), 1);
    }

    #[test]
    fn max_steps_is_clamped_to_ladder() {
        let exec = executor(ladder(2), 10);
        assert_eq!(exec.max_steps(), 2);
        assert_eq!(exec.next_step(2), 1);
    }

    #[tokio::test]
    async fn execute_runs_exactly_the_indexed_action() {
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());
        let exec = executor(
            vec![
                first.clone() as Arc<dyn RecoveryAction>,
                second.clone() as Arc<dyn RecoveryAction>,
            ],
            2,
        );

        let outcome = exec.execute(&ProfileId::new("p1"), 2).await;

        assert!(outcome.success);
        assert_eq!(outcome.step, 2);
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_action_is_absorbed() {
        let broken: Arc<dyn RecoveryAction> = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let exec = executor(vec![broken], 1);

        let outcome = exec.execute(&ProfileId::new("p1"), 1).await;

        assert_eq!(
            outcome,
            RecoveryOutcome {
                step: 1,
                action: "broken".to_string(),
                success: false
            }
        );
    }

    #[tokio::test]
    async fn slow_action_times_out() {
        let exec = executor(vec![Arc::new(Slow) as Arc<dyn RecoveryAction>], 1);
        let outcome = exec.execute(&ProfileId::new("p1"), 1).await;
        assert!(!outcome.success);
        assert_eq!(outcome.action, "slow");
    }

    #[tokio::test]
    async fn out_of_range_step_fails_softly() {
        let exec = executor(ladder(2), 2);
        assert!(!exec.execute(&ProfileId::new("p1"), 0).await.success);
        assert!(!exec.execute(&ProfileId::new("p1"), 3).await.success);
    }

    #[tokio::test]
    async fn recover_persists_cursor_even_on_failure() {
        let store = Arc::new(MemoryStateStore::new());
        let broken: Arc<dyn RecoveryAction> = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let exec = RecoveryStepExecutor::new(
            store.clone(),
            vec![broken.clone(), broken],
            2,
            Duration::from_secs(1),
        );
        let p = ProfileId::new("p1");
        store
            .update(&p, RunnerStatePatch::new().needs_recovery(true))
            .await
            .unwrap();

        let steps: Vec<u32> = {
            let mut seen = Vec::new();
            for _ in 0..3 {
                seen.push(exec.recover(&p).await.unwrap().step);
            }
            seen
        };

        assert_eq!(steps, vec![1, 2, 1]);
        let state = store.get(&p).await.unwrap();
        assert_eq!(state.last_recovery_step, 1);
        assert!(state.flags.needs_recovery);
    }

    #[tokio::test]
    async fn successful_recovery_clears_needs_recovery() {
        let store = Arc::new(MemoryStateStore::new());
        let exec = RecoveryStepExecutor::new(store.clone(), ladder(3), 3, Duration::from_secs(1));
        let p = ProfileId::new("p1");
        store
            .update(&p, RunnerStatePatch::new().needs_recovery(true))
            .await
            .unwrap();

        let outcome = exec.recover(&p).await.unwrap();

        assert!(outcome.success);
        let state = store.get(&p).await.unwrap();
        assert!(!state.flags.needs_recovery);
        assert_eq!(state.last_recovery_step, 1);
    }

    #[test]
    fn from_config_builds_default_ladder() {
        let exec = RecoveryStepExecutor::from_config(
            Arc::new(MemoryStateStore::new()),
            &RecoveryConfig::default(),
        );
        assert_eq!(exec.max_steps(), 5);
        assert_eq!(exec.action_names()[0], "navigate-home");
        assert_eq!(exec.action_names()[4], "restart-profile-runtime");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_action_reports_exit_status() {
        let p = ProfileId::new("alice");
        let ok = CommandAction::new("ok", "test \"$OPERATOR_PROFILE_ID\" = {profile}");
        let bad = CommandAction::new("bad", "echo nope >&2; exit 4");

        assert!(ok.run(&p).await.is_ok());
        let err = bad.run(&p).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "recovery action bad failed: exited with code 4: nope"
        );
    }
}
