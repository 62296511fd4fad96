use operator_core::{
    MemoryStateStore, ProfileId, RecoveryStepExecutor, RunnerStatePatch, RunnerStateStore,
};
use operator_test_utils::{ladder, ScriptedAction};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_ladder_escalates_and_wraps() {
    let store = Arc::new(MemoryStateStore::new());
    let actions = [
        ScriptedAction::failing("navigate-home", 2),
        ScriptedAction::failing("navigate-back", 2),
        ScriptedAction::failing("refresh", 2),
    ];
    let exec =
        RecoveryStepExecutor::new(store.clone(), ladder(&actions), 3, Duration::from_secs(1));
    let p = ProfileId::new("p1");

    let mut names = Vec::new();
    for _ in 0..4 {
        let outcome = exec.recover(&p).await.unwrap();
        assert!(!outcome.success);
        names.push(outcome.action);
    }

    assert_eq!(
        names,
        vec!["navigate-home", "navigate-back", "refresh", "navigate-home"]
    );
    assert_eq!(actions[0].calls(), 2);
    assert_eq!(store.get(&p).await.unwrap().last_recovery_step, 1);
}

#[tokio::test]
async fn test_cursor_is_per_profile() {
    let store = Arc::new(MemoryStateStore::new());
    let actions = [
        ScriptedAction::succeeding("first"),
        ScriptedAction::succeeding("second"),
    ];
    let exec =
        RecoveryStepExecutor::new(store.clone(), ladder(&actions), 2, Duration::from_secs(1));
    let a = ProfileId::new("a");
    let b = ProfileId::new("b");

    exec.recover(&a).await.unwrap();
    exec.recover(&a).await.unwrap();
    let outcome = exec.recover(&b).await.unwrap();

    assert_eq!(outcome.step, 1);
    assert_eq!(actions[0].profiles(), vec![a.clone(), b.clone()]);
    assert_eq!(actions[1].profiles(), vec![a]);
}

#[tokio::test]
async fn test_cursor_beyond_max_restarts_at_one() {
    let store = Arc::new(MemoryStateStore::new());
    let actions = [ScriptedAction::succeeding("only")];
    let exec =
        RecoveryStepExecutor::new(store.clone(), ladder(&actions), 1, Duration::from_secs(1));
    let p = ProfileId::new("p1");
    store
        .update(&p, RunnerStatePatch::new().last_recovery_step(9))
        .await
        .unwrap();

    let outcome = exec.recover(&p).await.unwrap();

    assert_eq!(outcome.step, 1);
    assert!(outcome.success);
}

proptest! {
    #[test]
    fn prop_cursor_cycles_within_bounds(max in 1u32..8, attempts in 1usize..40) {
        let store = Arc::new(MemoryStateStore::new());
        let actions: Vec<_> = (0..max)
            .map(|i| ScriptedAction::failing(&format!("step-{i}"), attempts))
            .collect();
        let exec =
            RecoveryStepExecutor::new(store.clone(), ladder(&actions), max, Duration::from_secs(1));
        let p = ProfileId::new("p1");

        let steps: Vec<u32> = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(async {
                let mut steps = Vec::new();
                for _ in 0..attempts {
                    steps.push(exec.recover(&p).await.unwrap().step);
                }
                steps
            });

        for (i, step) in steps.iter().enumerate() {
            prop_assert!(*step >= 1 && *step <= max);
            prop_assert_eq!(*step, (i as u32 % max) + 1);
        }
    }
}
