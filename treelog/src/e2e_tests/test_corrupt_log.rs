//! Damaged logs stop recovery and leave the environment unusable.

use crate::e2e_tests::helpers::*;

/// Three records: two leaf writes and a commit. Returns the second write.
fn small_log(env: &mut TestEnv<SimulatedStorage>) -> Lsn {
    let txn = env.begin();
    env.write(Some(txn), &leaf(1, &[("a", "1")]));
    let second = env.write(Some(txn), &leaf(2, &[("b", "2")]));
    env.commit(txn);
    second
}

#[test]
fn test_flipped_byte_is_fatal() {
    let mut env = TestEnv::simulated(70);
    let second = small_log(&mut env);
    assert!(env.storage.corrupt_log_byte(second + 22));

    let err = env.recover(no_checkpoint()).expect_err("corrupt record");

    assert_eq!(err.kind, RecoveryErrorKind::CorruptLog);
    assert_eq!(err.phase, RecoveryPhase::LocatingCheckpoint);
    assert_eq!(err.lsn, Some(second));
}

#[test]
fn test_torn_tail_is_fatal() {
    let mut env = TestEnv::simulated(71);
    small_log(&mut env);
    let end = env.log_end();
    env.storage.truncate_log(end - 5);

    let err = env.recover(partial()).expect_err("torn tail");

    assert_eq!(err.kind, RecoveryErrorKind::CorruptLog);
    assert!(env.tree().is_empty());
}

#[test]
fn test_failure_sticks_until_close() {
    let mut env = TestEnv::simulated(72);
    let second = small_log(&mut env);
    assert!(env.storage.corrupt_log_byte(second + 22));

    let guard = EnvironmentGuard::new();
    let err = env
        .recover_with_guard(no_checkpoint(), &guard)
        .expect_err("corrupt record");
    assert!(matches!(err, EnvironmentError::RecoveryFailed(_)));
    assert_eq!(guard.state(), EnvironmentState::RecoveryFailed);

    // Every handle sees the failure.
    let other = guard.clone();
    match other.check() {
        Err(EnvironmentError::RecoveryFailed(failure)) => {
            assert_eq!(failure.kind, RecoveryErrorKind::CorruptLog);
            assert_eq!(failure.lsn, Some(second));
        }
        other => panic!("expected recovery failure, got {other:?}"),
    }

    // Reopening requires a close first.
    let err = env
        .recover_with_guard(no_checkpoint(), &guard)
        .expect_err("still failed");
    assert_eq!(
        err,
        EnvironmentError::InvalidTransition {
            from: EnvironmentState::RecoveryFailed,
            to: EnvironmentState::Opening,
        }
    );

    // Closing clears the state, but the log is still damaged.
    assert_eq!(guard.close(), EnvironmentState::RecoveryFailed);
    env.recover_with_guard(no_checkpoint(), &guard)
        .expect_err("log unchanged");
    assert_eq!(guard.state(), EnvironmentState::RecoveryFailed);

    // Cut the damaged record off and try again.
    guard.close();
    env.storage.truncate_log(second);
    let outcome = env
        .recover_with_guard(no_checkpoint(), &guard)
        .expect("recover");
    assert_eq!(guard.state(), EnvironmentState::Open);
    assert!(guard.check().is_ok());
    assert_eq!(outcome.stats.transactions_rolled_back, 1);
    assert!(env.tree().is_empty());
}
