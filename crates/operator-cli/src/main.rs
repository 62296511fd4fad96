use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use operator_core::{
    open_store, OperatorConfig, ProfileId, RunnerState, RunnerStateStore, Supervisor,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "operator_core=info,profile_operator=info";

fn cli() -> Command {
    let profile = Arg::new("profile")
        .required(true)
        .value_name("PROFILE")
        .help("Profile id");

    Command::new("profile-operator")
        .version(operator_core::VERSION)
        .about("Supervises per-profile automation workers")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .default_value("operator.toml")
                .value_parser(value_parser!(PathBuf))
                .help("Operator configuration file"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("text")
                .value_parser(["text", "json"])
                .help("Log output format"),
        )
        .subcommand(
            Command::new("run")
                .about("Supervise profiles until interrupted")
                .arg(
                    Arg::new("profile")
                        .long("profile")
                        .action(ArgAction::Append)
                        .help("Profile to supervise (repeatable); defaults to the configured list"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Print every persisted runner record")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("resume")
                .about("Clear a pause and reset the error streak")
                .arg(profile.clone()),
        )
        .subcommand(
            Command::new("pause")
                .about("Pause a profile for a fixed time")
                .arg(profile)
                .arg(
                    Arg::new("minutes")
                        .long("minutes")
                        .default_value("60")
                        .value_parser(value_parser!(u64))
                        .help("Pause length in minutes"),
                ),
        )
}

fn init_tracing(format: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn load_config(path: &Path) -> Result<OperatorConfig> {
    OperatorConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let format = matches
        .get_one::<String>("log-format")
        .map_or("text", String::as_str);
    init_tracing(format);

    let config_path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("operator.toml"));
    let config = load_config(&config_path)?;

    match matches.subcommand() {
        Some(("run", args)) => run(config, args).await,
        Some(("status", args)) => status(&config, args.get_flag("json")).await,
        Some(("resume", args)) => resume(&config, profile_arg(args)?).await,
        Some(("pause", args)) => {
            let minutes = args.get_one::<u64>("minutes").copied().unwrap_or(60);
            pause(&config, profile_arg(args)?, pause_duration(minutes)).await
        }
        _ => bail!("unknown command"),
    }
}

fn pause_duration(minutes: u64) -> Duration {
    Duration::from_secs(minutes.saturating_mul(60))
}

fn profile_arg(args: &ArgMatches) -> Result<ProfileId> {
    args.get_one::<String>("profile")
        .map(|p| ProfileId::new(p.as_str()))
        .context("missing profile")
}

fn selected_profiles(config: &OperatorConfig, args: &ArgMatches) -> Vec<ProfileId> {
    match args.get_many::<String>("profile") {
        Some(values) => values.map(|p| ProfileId::new(p.as_str())).collect(),
        None => config.profiles.clone(),
    }
}

async fn run(config: OperatorConfig, args: &ArgMatches) -> Result<()> {
    config.validate()?;
    let profiles = selected_profiles(&config, args);
    if profiles.is_empty() {
        bail!("no profiles to supervise: pass --profile or set `profiles` in the config");
    }

    let store = open_store(&config.store).await?;
    let supervisor = Arc::new(Supervisor::new(&config, store));

    let signals = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            supervisor.shutdown();
        })
    };

    supervisor.run(profiles).await;
    signals.abort();

    let stats = supervisor.stats();
    tracing::info!(
        cycles = stats.cycles,
        successes = stats.successes,
        failures = stats.failures,
        pauses = stats.pauses,
        "operator stopped"
    );
    Ok(())
}

async fn status(config: &OperatorConfig, json: bool) -> Result<()> {
    let store = persistent_store(config).await?;
    let records = store.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("no runner records");
    } else {
        for record in &records {
            println!("{}", describe(record));
        }
    }
    Ok(())
}

async fn resume(config: &OperatorConfig, profile: ProfileId) -> Result<()> {
    let supervisor = Supervisor::new(config, persistent_store(config).await?);
    let state = supervisor.resume(&profile).await?;
    println!("{}", describe(&state));
    Ok(())
}

async fn pause(config: &OperatorConfig, profile: ProfileId, duration: Duration) -> Result<()> {
    let supervisor = Supervisor::new(config, persistent_store(config).await?);
    let until = supervisor.request_pause(&profile, duration).await?;
    println!("{profile} paused until {until}");
    Ok(())
}

/// Store for commands that only make sense against a state file
async fn persistent_store(config: &OperatorConfig) -> Result<Arc<dyn RunnerStateStore>> {
    if config.store.path.is_none() {
        bail!("store.path is not configured; runner records are not persisted");
    }
    Ok(open_store(&config.store).await?)
}

fn describe(state: &RunnerState) -> String {
    let until = state
        .paused_until
        .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
    format!(
        "{:<24} streak={:<3} running={:<5} needs_recovery={:<5} paused={:<5} until={} step={}",
        state.profile_id.as_str(),
        state.error_streak,
        state.flags.running,
        state.flags.needs_recovery,
        state.flags.paused,
        until,
        state.last_recovery_step,
    )
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => tracing::info!("received SIGTERM"),
                _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, listening for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use operator_core::{FileStateStore, RunnerStatePatch};

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn run_accepts_repeated_profiles() {
        let matches = cli()
            .try_get_matches_from([
                "profile-operator",
                "run",
                "--config",
                "x.toml",
                "--profile",
                "a",
                "--profile",
                "b",
            ])
            .unwrap();
        let (_, args) = matches.subcommand().unwrap();
        let profiles = selected_profiles(&OperatorConfig::new(), args);
        assert_eq!(profiles, vec![ProfileId::new("a"), ProfileId::new("b")]);
    }

    #[test]
    fn run_falls_back_to_configured_profiles() {
        let matches = cli().try_get_matches_from(["profile-operator", "run"]).unwrap();
        let (_, args) = matches.subcommand().unwrap();
        let config = OperatorConfig::new().with_profiles(vec![ProfileId::new("c")]);
        assert_eq!(selected_profiles(&config, args), vec![ProfileId::new("c")]);
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        let result =
            cli().try_get_matches_from(["profile-operator", "status", "--log-format", "xml"]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_through_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OperatorConfig::new();
        config.store.path = Some(dir.path().join("state.json"));
        let p = ProfileId::new("p1");

        {
            let store = FileStateStore::open(dir.path().join("state.json")).await.unwrap();
            store
                .update(&p, RunnerStatePatch::new().error_streak(2))
                .await
                .unwrap();
        }

        pause(&config, p.clone(), Duration::from_secs(600)).await.unwrap();
        let store = FileStateStore::open(dir.path().join("state.json")).await.unwrap();
        let state = store.get(&p).await.unwrap();
        assert!(state.flags.paused);
        assert_eq!(state.error_streak, 2);

        resume(&config, p.clone()).await.unwrap();
        let store = FileStateStore::open(dir.path().join("state.json")).await.unwrap();
        let state = store.get(&p).await.unwrap();
        assert!(!state.flags.paused);
        assert_eq!(state.error_streak, 0);
    }

    #[tokio::test]
    async fn status_requires_persistent_store() {
        assert!(status(&OperatorConfig::new(), false).await.is_err());
    }

    #[test]
    fn huge_pause_length_saturates() {
        assert_eq!(pause_duration(90), Duration::from_secs(5_400));
        assert_eq!(pause_duration(u64::MAX), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn describe_shows_dash_without_cooldown() {
        let line = describe(&RunnerState::new(ProfileId::new("p1")));
        assert!(line.starts_with("p1"));
        assert!(line.contains("until=-"));
    }
}
