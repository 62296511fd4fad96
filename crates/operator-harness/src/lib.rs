//! Failure-injection harness
//!
//! A deterministic stand-in for a profile worker. Each mode reproduces one
//! worker outcome the operator has to classify:
//! - `exit`: wait, then exit with a chosen code
//! - `timeout`: wait a chosen duration, then exit 1
//! - `error`: wait, then die of an unhandled panic (exit code 101)
//! - `hang`: never exit on its own
//!
//! Every mode prints a `[harness]` announcement before terminating, and
//! SIGINT/SIGTERM make any mode exit 0 promptly.

#![allow(missing_docs)]

use clap::{value_parser, Arg, ArgMatches, Command, ValueEnum};
use std::fmt;
use std::time::Duration;

/// Prefix of every announcement line
pub const ANNOUNCE_PREFIX: &str = "[harness]";

/// Worker behaviour to reproduce
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FailureMode {
    /// Exit with `--exitCode` after `--delay`
    Exit,
    /// Exit 1 after `--duration`
    Timeout,
    /// Panic after `--delay`
    Error,
    /// Block until signalled
    Hang,
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Exit => "exit",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Hang => "hang",
        };
        f.write_str(name)
    }
}

/// Parsed harness invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessArgs {
    pub profile: String,
    pub mode: FailureMode,
    pub exit_code: i32,
    pub duration: Duration,
    pub delay: Duration,
}

/// Argument definitions
#[must_use]
pub fn command() -> Command {
    Command::new("failure-harness")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Deterministic failure-injection worker for the profile operator")
        .arg(
            Arg::new("profile")
                .long("profile")
                .required(true)
                .value_name("ID")
                .help("Profile the run pretends to serve"),
        )
        .arg(
            Arg::new("type")
                .long("type")
                .required(true)
                .value_parser(value_parser!(FailureMode))
                .help("Failure mode to reproduce"),
        )
        .arg(
            Arg::new("exit-code")
                .long("exitCode")
                .default_value("1")
                .allow_negative_numbers(true)
                .value_parser(value_parser!(i32))
                .help("Exit code used by the exit mode"),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .default_value("10000")
                .value_parser(value_parser!(u64))
                .help("Milliseconds the timeout mode runs before exiting 1"),
        )
        .arg(
            Arg::new("delay")
                .long("delay")
                .default_value("2000")
                .value_parser(value_parser!(u64))
                .help("Milliseconds the exit and error modes wait before failing"),
        )
}

/// Parse a full argument list, program name first
///
/// # Errors
/// The clap error for help, version, or any usage problem
pub fn parse_args<I, T>(args: I) -> Result<HarnessArgs, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = command().try_get_matches_from(args)?;
    Ok(from_matches(&matches))
}

fn from_matches(matches: &ArgMatches) -> HarnessArgs {
    HarnessArgs {
        profile: matches
            .get_one::<String>("profile")
            .cloned()
            .unwrap_or_default(),
        mode: matches
            .get_one::<FailureMode>("type")
            .copied()
            .unwrap_or(FailureMode::Exit),
        exit_code: matches.get_one::<i32>("exit-code").copied().unwrap_or(1),
        duration: Duration::from_millis(
            matches.get_one::<u64>("duration").copied().unwrap_or(10_000),
        ),
        delay: Duration::from_millis(matches.get_one::<u64>("delay").copied().unwrap_or(2_000)),
    }
}

/// Report a parse failure and return the process exit code
///
/// Help and version requests exit 0; every other error prints the help text
/// and exits 1.
pub fn usage_exit(err: &clap::Error) -> i32 {
    use clap::error::ErrorKind;

    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            let _ = err.print();
            0
        }
        _ => {
            eprintln!("{ANNOUNCE_PREFIX} usage error: {}", err.kind());
            let _ = err.print();
            let _ = command().print_help();
            println!();
            1
        }
    }
}

fn announce(args: &HarnessArgs, message: &str) {
    println!(
        "{ANNOUNCE_PREFIX} profile={} mode={} {message}",
        args.profile, args.mode
    );
}

/// Play the chosen mode and return the exit code
///
/// The `error` mode does not return: it panics.
pub async fn run(args: &HarnessArgs, signals: &mut ShutdownSignals) -> i32 {
    announce(args, "started");
    tracing::debug!(?args, "harness running");

    tokio::select! {
        code = play(args) => code,
        signal = signals.recv() => {
            announce(args, &format!("received {signal}, exiting with code 0"));
            0
        }
    }
}

async fn play(args: &HarnessArgs) -> i32 {
    match args.mode {
        FailureMode::Exit => {
            tokio::time::sleep(args.delay).await;
            announce(args, &format!("exiting with code {}", args.exit_code));
            args.exit_code
        }
        FailureMode::Timeout => {
            tokio::time::sleep(args.duration).await;
            announce(
                args,
                &format!(
                    "ran for {}ms, exiting with code 1",
                    args.duration.as_millis()
                ),
            );
            1
        }
        FailureMode::Error => {
            tokio::time::sleep(args.delay).await;
            announce(args, "raising unhandled error");
            panic!("injected failure for profile {}", args.profile);
        }
        FailureMode::Hang => {
            announce(args, "hanging until a termination signal arrives");
            std::future::pending::<i32>().await
        }
    }
}

/// SIGTERM/SIGINT listeners
///
/// Install these before anything else so a signal arriving during start-up
/// still ends the run with exit code 0.
#[derive(Debug)]
pub struct ShutdownSignals {
    #[cfg(unix)]
    streams: Option<(tokio::signal::unix::Signal, tokio::signal::unix::Signal)>,
}

impl ShutdownSignals {
    /// Register the listeners; needs a running tokio runtime
    #[cfg(unix)]
    #[must_use]
    pub fn install() -> Self {
        use tokio::signal::unix::{signal, SignalKind};

        let streams = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => Some((term, int)),
            (Err(e), _) | (_, Err(e)) => {
                eprintln!("{ANNOUNCE_PREFIX} signal handlers unavailable: {e}");
                None
            }
        };
        Self { streams }
    }

    #[cfg(not(unix))]
    #[must_use]
    pub fn install() -> Self {
        Self {}
    }

    #[cfg(unix)]
    async fn recv(&mut self) -> &'static str {
        let Some((term, int)) = self.streams.as_mut() else {
            return std::future::pending().await;
        };
        tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "ctrl-c",
            Err(_) => std::future::pending().await,
        }
    }
}
