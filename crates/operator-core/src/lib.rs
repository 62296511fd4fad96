//! Operator Core - per-profile worker supervision
//!
//! Keeps a fleet of per-profile worker processes healthy:
//! - Launches one worker per profile and enforces a maximum runtime
//! - Classifies every outcome (success, timeout, non-zero exit, crash)
//! - Walks an escalating recovery ladder after each failure
//! - Pauses a profile once its error streak crosses a threshold
//! - Persists every transition through an injected state store
//!
//! # Example
//!
//! ```rust,ignore
//! use operator_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OperatorConfig::load("operator.toml")?;
//! let store = Arc::new(MemoryStateStore::new());
//! let supervisor = Arc::new(Supervisor::new(&config, store));
//!
//! supervisor.run(config.profiles.clone()).await;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod breaker;
pub mod config;
pub mod error;
pub mod launcher;
pub mod lifecycle;
pub mod recovery;
pub mod store;
pub mod supervisor;
pub mod types;

pub use breaker::{BreakerDecision, CircuitBreaker, PauseStatus};
pub use config::{
    LauncherConfig, OperatorConfig, RecoveryConfig, RecoveryStepConfig, StoreConfig,
    SupervisorConfig, WorkerCommand, DEFAULT_RECOVERY_STEPS,
};
pub use error::{
    ConfigError, LaunchError, PersistenceError, RecoveryStepError, SupervisorError, WorkerFailure,
};
pub use launcher::{LaunchOutcome, LaunchReport, WorkerLauncher, PROFILE_ENV};
pub use lifecycle::{allowed_transitions, validate_transition, ProfilePhase};
pub use recovery::{
    CommandAction, LogOnlyAction, RecoveryAction, RecoveryOutcome, RecoveryStepExecutor,
};
pub use store::{FileStateStore, MemoryStateStore, RunnerStateStore};
pub use supervisor::{CycleOutcome, ProfileSnapshot, Supervisor, SupervisorStats};
pub use types::{
    CancelReason, Clock, FailureEvent, LaunchId, ProfileId, RunnerFlags, RunnerState,
    RunnerStatePatch, StreakUpdate, SystemClock,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Operator Core
    pub use crate::{
        CircuitBreaker, CycleOutcome, FailureEvent, MemoryStateStore, OperatorConfig, ProfileId,
        RecoveryStepExecutor, RunnerState, RunnerStateStore, Supervisor, SupervisorError,
        WorkerCommand, WorkerLauncher,
    };
}

/// Open the store described by configuration
///
/// # Errors
/// `PersistenceError` if the state file exists but cannot be loaded
pub async fn open_store(
    config: &StoreConfig,
) -> Result<std::sync::Arc<dyn RunnerStateStore>, PersistenceError> {
    Ok(match &config.path {
        Some(path) => std::sync::Arc::new(FileStateStore::open(path).await?),
        None => std::sync::Arc::new(MemoryStateStore::new()),
    })
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
