//! Worker launcher for per-profile subprocesses
//!
//! Starts one worker per profile and races it against:
//! - the maximum-runtime deadline
//! - a cancellation token (supervisor shutdown or an external pause)
//!
//! On deadline or cancellation the worker's process group receives SIGTERM,
//! then SIGKILL once the grace period has passed. Output is captured line by
//! line into a bounded buffer and mirrored to `tracing` at debug level.

use crate::config::{LauncherConfig, WorkerCommand};
use crate::error::{LaunchError, WorkerFailure};
use crate::types::{CancelReason, FailureEvent, LaunchId, ProfileId};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Environment variable carrying the profile id into the worker
pub const PROFILE_ENV: &str = "OPERATOR_PROFILE_ID";

/// How long captured-output readers may lag behind process exit
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Final state of one launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The worker finished on its own or hit the deadline
    Finished(FailureEvent),
    /// The operator stopped the worker
    Cancelled(CancelReason),
}

/// Everything the caller learns about one launch
#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub launch_id: LaunchId,
    pub profile: ProfileId,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub outcome: LaunchOutcome,
    /// Exit code when the worker exited normally
    pub exit_code: Option<i32>,
    /// Tail of the combined stdout/stderr
    pub output: Vec<String>,
}

impl LaunchReport {
    /// Classified outcome, `None` when cancelled
    #[inline]
    #[must_use]
    pub fn event(&self) -> Option<FailureEvent> {
        match self.outcome {
            LaunchOutcome::Finished(event) => Some(event),
            LaunchOutcome::Cancelled(_) => None,
        }
    }

    /// Failure detail for logging, `None` on success or cancellation
    #[must_use]
    pub fn failure(&self, max_runtime: Duration) -> Option<WorkerFailure> {
        match self.event()? {
            FailureEvent::Success => None,
            FailureEvent::Timeout => Some(WorkerFailure::Timeout { after: max_runtime }),
            FailureEvent::NonZeroExit { code } => Some(WorkerFailure::Exit { code }),
            FailureEvent::Crash => Some(WorkerFailure::Crash {
                detail: self
                    .output
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "no output".to_string()),
            }),
        }
    }
}

/// Bounded tail of captured lines
#[derive(Debug)]
struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// Registry entry of an active worker
#[derive(Debug)]
struct ActiveWorker {
    launch_id: LaunchId,
    cancel: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

/// Removes the registry entry when a launch ends, whatever the path
struct Registration<'a> {
    active: &'a DashMap<ProfileId, ActiveWorker>,
    profile: ProfileId,
    launch_id: LaunchId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.active
            .remove_if(&self.profile, |_, w| w.launch_id == self.launch_id);
    }
}

/// Starts and monitors worker subprocesses, one per profile
#[derive(Debug)]
pub struct WorkerLauncher {
    config: LauncherConfig,
    active: DashMap<ProfileId, ActiveWorker>,
    /// Parent of every per-launch token; cancelled once on shutdown
    root: CancellationToken,
}

impl WorkerLauncher {
    /// Create a launcher
    #[inline]
    #[must_use]
    pub fn new(config: LauncherConfig) -> Self {
        Self {
            config,
            active: DashMap::new(),
            root: CancellationToken::new(),
        }
    }

    /// Limits in force
    #[inline]
    #[must_use]
    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Run one worker for `profile` to completion
    ///
    /// Returns once the worker exited, timed out or was cancelled. The
    /// registry entry for the profile lives exactly as long as this call.
    ///
    /// # Errors
    /// - `LaunchError::AlreadyRunning` if the profile has an active worker
    /// - `LaunchError::InvalidCommand` if the program is empty
    /// - `LaunchError::Spawn` if the process could not be started
    pub async fn launch(
        &self,
        profile: &ProfileId,
        command: &WorkerCommand,
    ) -> Result<LaunchReport, LaunchError> {
        if command.program.trim().is_empty() {
            return Err(LaunchError::InvalidCommand(
                "worker program is empty".to_string(),
            ));
        }

        let launch_id = LaunchId::new();
        let started_at = Utc::now();
        let cancel = self.root.child_token();
        let reason = Arc::new(Mutex::new(None));

        match self.active.entry(profile.clone()) {
            Entry::Occupied(_) => return Err(LaunchError::AlreadyRunning(profile.clone())),
            Entry::Vacant(slot) => {
                slot.insert(ActiveWorker {
                    launch_id,
                    cancel: cancel.clone(),
                    reason: Arc::clone(&reason),
                });
            }
        }
        let _registration = Registration {
            active: &self.active,
            profile: profile.clone(),
            launch_id,
        };

        let mut child = self.spawn(profile, command)?;
        info!(profile = %profile, launch = %launch_id, pid = child.id(), "worker started");

        let output = Arc::new(Mutex::new(OutputBuffer::new(self.config.output_capacity)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let buffer = Arc::clone(&output);
            readers.push(tokio::spawn(pump(stdout, profile.clone(), "stdout", buffer)));
        }
        if let Some(stderr) = child.stderr.take() {
            let buffer = Arc::clone(&output);
            readers.push(tokio::spawn(pump(stderr, profile.clone(), "stderr", buffer)));
        }

        let clock = Instant::now();
        let deadline = tokio::time::sleep(self.config.max_runtime());
        tokio::pin!(deadline);

        let (outcome, exit_code) = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => (LaunchOutcome::Finished(self.classify(status)), status.code()),
                Err(e) => {
                    error!(profile = %profile, error = %e, "failed waiting on worker");
                    (LaunchOutcome::Finished(FailureEvent::Crash), None)
                }
            },
            () = &mut deadline => {
                warn!(
                    profile = %profile,
                    max_runtime_ms = self.config.max_runtime_ms,
                    "worker exceeded maximum runtime, terminating"
                );
                let code = self.terminate(&mut child, profile).await;
                (LaunchOutcome::Finished(FailureEvent::Timeout), code)
            },
            () = cancel.cancelled() => {
                let why = (*reason.lock()).unwrap_or(CancelReason::Shutdown);
                info!(profile = %profile, reason = ?why, "worker cancelled, terminating");
                let code = self.terminate(&mut child, profile).await;
                (LaunchOutcome::Cancelled(why), code)
            },
        };

        for reader in readers {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
                debug!(profile = %profile, "output reader still open after exit");
            }
        }

        let report = LaunchReport {
            launch_id,
            profile: profile.clone(),
            started_at,
            elapsed: clock.elapsed(),
            outcome,
            exit_code,
            output: output.lock().snapshot(),
        };

        info!(
            profile = %profile,
            launch = %launch_id,
            outcome = ?report.outcome,
            elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            "worker finished"
        );
        Ok(report)
    }

    /// Stop the profile's active worker, if any
    ///
    /// Returns `true` when a worker was signalled.
    pub fn cancel(&self, profile: &ProfileId, why: CancelReason) -> bool {
        match self.active.get(profile) {
            Some(worker) => {
                *worker.reason.lock() = Some(why);
                worker.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop every active worker
    pub fn cancel_all(&self, why: CancelReason) -> usize {
        let mut count = 0;
        for worker in self.active.iter() {
            *worker.reason.lock() = Some(why);
            worker.cancel.cancel();
            count += 1;
        }
        count
    }

    /// Stop every active worker and every worker launched from now on
    pub fn shutdown(&self) {
        let stopped = self.cancel_all(CancelReason::Shutdown);
        self.root.cancel();
        debug!(stopped, "launcher shut down");
    }

    /// Whether `shutdown` was called
    #[inline]
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Whether the profile has an active worker
    #[inline]
    #[must_use]
    pub fn is_running(&self, profile: &ProfileId) -> bool {
        self.active.contains_key(profile)
    }

    /// Number of active workers
    #[inline]
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn spawn(&self, profile: &ProfileId, command: &WorkerCommand) -> Result<Child, LaunchError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(command.args_for(profile))
            .envs(&command.env)
            .env(PROFILE_ENV, profile.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn().map_err(|source| {
            error!(
                profile = %profile,
                program = %command.program,
                "failed to spawn worker: {source}"
            );
            LaunchError::Spawn {
                profile: profile.clone(),
                source,
            }
        })
    }

    fn classify(&self, status: ExitStatus) -> FailureEvent {
        match status.code() {
            Some(0) => FailureEvent::Success,
            Some(code) if self.config.crash_exit_codes.contains(&code) => FailureEvent::Crash,
            Some(code) => FailureEvent::NonZeroExit { code },
            // Killed by a signal nobody here sent
            None => FailureEvent::Crash,
        }
    }

    /// Graceful signal, grace period, then forced kill
    async fn terminate(&self, child: &mut Child, profile: &ProfileId) -> Option<i32> {
        signal_graceful(child);
        if let Ok(Ok(status)) = tokio::time::timeout(self.config.grace_period(), child.wait()).await
        {
            return status.code();
        }

        warn!(
            profile = %profile,
            grace_ms = self.config.grace_period_ms,
            "worker ignored termination signal, killing"
        );
        signal_kill(child);
        match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                error!(profile = %profile, error = %e, "failed to reap killed worker");
                None
            }
        }
    }
}

#[cfg(unix)]
fn signal_graceful(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) {
        let _ = killpg(Pid::from_raw(pid), Signal::SIGTERM);
    }
}

#[cfg(unix)]
fn signal_kill(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) {
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn signal_graceful(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn signal_kill(child: &mut Child) {
    let _ = child.start_kill();
}

async fn pump<R>(
    reader: R,
    profile: ProfileId,
    stream: &'static str,
    buffer: Arc<Mutex<OutputBuffer>>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(profile = %profile, stream, "{line}");
        buffer.lock().push(line);
    }
}
