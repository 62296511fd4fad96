use operator_core::{
    allowed_transitions, validate_transition, CircuitBreaker, Clock, MemoryStateStore, PauseStatus,
    ProfileId, ProfilePhase, RunnerStatePatch, RunnerStateStore, SupervisorConfig,
};
use operator_test_utils::ManualClock;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn breaker(max: u32) -> (Arc<MemoryStateStore>, Arc<ManualClock>, CircuitBreaker) {
    let store = Arc::new(MemoryStateStore::new());
    let clock = ManualClock::starting_now();
    let config = SupervisorConfig::default().with_max_error_streak(max);
    let breaker = CircuitBreaker::new(store.clone(), &config).with_clock(clock.clone());
    (store, clock, breaker)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_streak_of_four_pauses_for_a_day() {
    let (store, clock, breaker) = breaker(3);
    let p = ProfileId::new("p1");
    store
        .update(&p, RunnerStatePatch::new().error_streak(4))
        .await
        .unwrap();

    let until = breaker.evaluate_pause(&p).await.unwrap().unwrap();

    let state = store.get(&p).await.unwrap();
    assert!(state.flags.paused);
    assert!(until > clock.now());
    assert_eq!(until - clock.now(), chrono::Duration::hours(24));
}

#[tokio::test]
async fn test_pause_expires_with_clock() {
    let (_, clock, breaker) = breaker(0);
    let p = ProfileId::new("p1");
    let until = breaker.on_failure(&p).await.unwrap().paused_until.unwrap();

    clock.advance(Duration::from_secs(23 * 3600));
    assert_eq!(
        breaker.pause_status(&p).await.unwrap(),
        PauseStatus::Active { until }
    );

    clock.advance(Duration::from_secs(3600));
    assert_eq!(breaker.pause_status(&p).await.unwrap(), PauseStatus::Elapsed);
    assert!(!breaker.is_paused(&p).await.unwrap());
}

#[tokio::test]
async fn test_profiles_are_independent() {
    let (_, _, breaker) = breaker(1);
    let a = ProfileId::new("a");
    let b = ProfileId::new("b");

    breaker.on_failure(&a).await.unwrap();
    breaker.on_failure(&a).await.unwrap();
    breaker.on_failure(&b).await.unwrap();

    assert!(breaker.is_paused(&a).await.unwrap());
    assert!(!breaker.is_paused(&b).await.unwrap());
}

fn phase() -> impl Strategy<Value = ProfilePhase> {
    prop_oneof![
        Just(ProfilePhase::Idle),
        Just(ProfilePhase::Running),
        Just(ProfilePhase::RecoveryExecuting),
        Just(ProfilePhase::Paused),
    ]
}

proptest! {
    #[test]
    fn prop_paused_iff_trailing_failures_exceed_max(
        max in 0u32..6,
        outcomes in proptest::collection::vec(any::<bool>(), 1..30)
    ) {
        let (store, _, breaker) = breaker(max);
        let p = ProfileId::new("p1");

        let (paused, streak) = runtime().block_on(async {
            for success in &outcomes {
                if *success {
                    breaker.on_success(&p).await.unwrap();
                } else {
                    breaker.on_failure(&p).await.unwrap();
                }
            }
            (
                breaker.is_paused(&p).await.unwrap(),
                store.get(&p).await.unwrap().error_streak,
            )
        });

        let trailing = outcomes.iter().rev().take_while(|s| !**s).count() as u32;
        prop_assert_eq!(streak, trailing);
        prop_assert_eq!(paused, trailing > max);
    }

    #[test]
    fn prop_transitions_match_allowed_table(from in phase(), to in phase()) {
        let p = ProfileId::new("p1");
        let res = validate_transition(&p, from, to);
        prop_assert_eq!(res.is_ok(), allowed_transitions(from).contains(&to));
    }
}
