//! Per-profile scheduling phases and their legal transitions.

use crate::error::SupervisorError;
use crate::types::ProfileId;
use serde::Serialize;

/// Phase of one profile's scheduling cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProfilePhase {
    /// Waiting for the next launch
    Idle,
    /// A worker is active
    Running,
    /// A recovery step is executing after a failure
    RecoveryExecuting,
    /// Breaker tripped, waiting for the cooldown to end
    Paused,
}

impl Default for ProfilePhase {
    fn default() -> Self {
        ProfilePhase::Idle
    }
}

/// Validates a phase transition.
///
/// There is no terminal phase: every phase eventually leads back to `Idle`.
pub fn validate_transition(
    profile: &ProfileId,
    from: ProfilePhase,
    to: ProfilePhase,
) -> Result<(), SupervisorError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(SupervisorError::IllegalTransition {
            profile: profile.clone(),
            from,
            to,
        })
    }
}

pub fn allowed_transitions(from: ProfilePhase) -> Vec<ProfilePhase> {
    use ProfilePhase::*;
    match from {
        Idle => vec![Running, Paused],
        Running => vec![Idle, RecoveryExecuting, Paused],
        RecoveryExecuting => vec![Idle],
        Paused => vec![Idle],
    }
}

fn allowed(from: ProfilePhase, to: ProfilePhase) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}
