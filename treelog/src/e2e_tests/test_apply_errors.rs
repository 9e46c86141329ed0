//! Records that cannot be applied: fatal by default, excised under partial
//! recovery.

use crate::e2e_tests::helpers::*;

/// Leaves 1 and 2 under node 3, flushed and checkpointed.
fn base(env: &mut TestEnv<SimulatedStorage>) {
    env.commit_nodes(&[
        leaf(1, &[("a", "1")]),
        leaf(2, &[("m", "2")]),
        internal(3, 1, &[1, 2]),
    ]);
    env.checkpoint(Some(3), None);
}

/// An unfinished transaction deleting node 2 without its prior image.
fn unfinished_delete_without_prior(env: &mut TestEnv<SimulatedStorage>) -> Lsn {
    let txn = env.begin();
    env.append(
        Some(txn),
        LogRecordPayload::NodeDelete {
            node_id: 2,
            level: 0,
            prior: None,
        },
    )
}

/// A committed write of node 2 whose image does not decode.
fn committed_garbage_write(env: &mut TestEnv<SimulatedStorage>) -> Lsn {
    let txn = env.begin();
    let lsn = env.append(
        Some(txn),
        LogRecordPayload::NodeWrite {
            node_id: 2,
            level: 0,
            image: vec![0xff; 3],
            prior: None,
        },
    );
    env.commit(txn);
    lsn
}

fn expect_failure(err: EnvironmentError) -> FatalRecoveryError {
    match err {
        EnvironmentError::RecoveryFailed(failure) => failure,
        other => panic!("expected recovery failure, got {other:?}"),
    }
}

#[test]
fn test_undo_without_prior_image_is_fatal() {
    let mut env = TestEnv::simulated(120);
    base(&mut env);
    let bad = unfinished_delete_without_prior(&mut env);
    let before = env.tree();
    let guard = EnvironmentGuard::new();

    let err = env
        .recover_with_guard(no_checkpoint(), &guard)
        .expect_err("cannot undo");

    let failure = expect_failure(err);
    assert_eq!(failure.kind, RecoveryErrorKind::Apply);
    assert_eq!(failure.phase, RecoveryPhase::UndoPass);
    assert_eq!(failure.lsn, Some(bad));
    assert!(failure.detail.contains("node 2"));
    assert_eq!(guard.state(), EnvironmentState::RecoveryFailed);
    assert_eq!(env.tree(), before);
}

#[test]
fn test_undo_without_prior_image_excised_when_partial() {
    let mut env = TestEnv::simulated(121);
    base(&mut env);
    let bad = unfinished_delete_without_prior(&mut env);

    let outcome = env.recover(partial()).expect("recover");

    assert_eq!(outcome.root, Some(3));
    assert_eq!(outcome.stats.nodes_excised, 1);
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].phase, RecoveryPhase::UndoPass);
    assert_eq!(outcome.warnings[0].lsn, Some(bad));

    let tree = env.tree();
    assert_eq!(tree.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(tree.get(&3).map(Node::children), Some(vec![1]));
}

#[test]
fn test_undecodable_redo_image_is_fatal() {
    let mut env = TestEnv::simulated(122);
    base(&mut env);
    let bad = committed_garbage_write(&mut env);
    let before = env.tree();
    let guard = EnvironmentGuard::new();

    let err = env
        .recover_with_guard(no_checkpoint(), &guard)
        .expect_err("cannot redo");

    let failure = expect_failure(err);
    assert_eq!(failure.kind, RecoveryErrorKind::Apply);
    assert_eq!(failure.phase, RecoveryPhase::RedoPass);
    assert_eq!(failure.lsn, Some(bad));
    assert_eq!(guard.state(), EnvironmentState::RecoveryFailed);
    assert_eq!(env.tree(), before);
}

#[test]
fn test_undecodable_redo_image_excised_when_partial() {
    let mut env = TestEnv::simulated(123);
    base(&mut env);
    let bad = committed_garbage_write(&mut env);

    let outcome = env.recover(partial()).expect("recover");

    assert_eq!(outcome.root, Some(3));
    assert_eq!(outcome.stats.nodes_excised, 1);
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].phase, RecoveryPhase::RedoPass);
    assert_eq!(outcome.warnings[0].lsn, Some(bad));

    let tree = env.tree();
    assert_eq!(tree.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(tree.get(&3).map(Node::children), Some(vec![1]));
}
