//! Internal nodes whose children are missing or misplaced after replay.

use crate::e2e_tests::helpers::*;

#[test]
fn test_missing_child_is_fatal() {
    let mut env = TestEnv::simulated(50);
    let txn = env.begin();
    env.write(Some(txn), &leaf(1, &[("a", "1")]));
    let parent_lsn = env.write(Some(txn), &internal(3, 1, &[1, 9]));
    env.commit(txn);

    let err = env.recover(no_checkpoint()).expect_err("dangling child");

    assert_eq!(err.kind, RecoveryErrorKind::DanglingChild);
    assert_eq!(err.phase, RecoveryPhase::ReconstructPass);
    assert_eq!(err.lsn, Some(parent_lsn));
    assert!(err.detail.contains("missing node 9"), "{}", err.detail);
}

#[test]
fn test_missing_child_is_dropped_in_partial_mode() {
    let mut env = TestEnv::simulated(51);
    let txn = env.begin();
    env.write(Some(txn), &leaf(1, &[("a", "1")]));
    let parent_lsn = env.write(Some(txn), &internal(3, 1, &[1, 9]));
    env.commit(txn);

    let outcome = env.recover(partial()).expect("partial recovery");

    assert_eq!(outcome.root, Some(3));
    assert_eq!(outcome.stats.dangling_dropped, 1);
    assert_eq!(outcome.warnings.len(), 1);
    let warning = &outcome.warnings[0];
    assert_eq!(warning.phase, RecoveryPhase::ReconstructPass);
    assert_eq!(warning.lsn, Some(parent_lsn));
    assert_eq!(env.tree().get(&3).map(Node::children), Some(vec![1]));
}

#[test]
fn test_child_at_wrong_level_is_fatal() {
    let mut env = TestEnv::simulated(52);
    env.commit_nodes(&[
        leaf(1, &[("a", "1")]),
        internal(5, 1, &[1]),
        internal(3, 1, &[5]),
    ]);

    let err = env.recover(no_checkpoint()).expect_err("level mismatch");

    assert_eq!(err.kind, RecoveryErrorKind::DanglingChild);
    assert!(err.detail.contains("node 5 at level 1"), "{}", err.detail);
}

#[test]
fn test_deleted_child_with_stale_parent() {
    let mut env = TestEnv::simulated(53);
    env.commit_nodes(&[
        leaf(1, &[("a", "1")]),
        leaf(2, &[("m", "2")]),
        internal(3, 1, &[1, 2]),
    ]);
    env.flush_live();

    // The parent is never rewritten to drop its entry.
    let txn = env.begin();
    env.delete(Some(txn), 2);
    env.commit(txn);

    let err = env.recover(no_checkpoint()).expect_err("stale parent");
    assert_eq!(err.kind, RecoveryErrorKind::DanglingChild);
    assert!(err.detail.contains("missing node 2"), "{}", err.detail);

    let outcome = env.recover(partial()).expect("partial recovery");
    assert_eq!(outcome.root, Some(3));
    assert_eq!(outcome.stats.dangling_dropped, 1);
    let tree = env.tree();
    assert_eq!(tree.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(tree.get(&3).map(Node::children), Some(vec![1]));
}

#[test]
fn test_stored_parent_without_log_records_is_checked() {
    let mut env = TestEnv::simulated(54);
    env.storage.write_node(&leaf(1, &[("a", "1")])).expect("write");
    env.storage.write_node(&internal(5, 1, &[1, 6])).expect("write");
    env.storage.sync().expect("sync");

    let err = env.recover(no_checkpoint()).expect_err("dangling child");

    assert_eq!(err.kind, RecoveryErrorKind::DanglingChild);
    assert_eq!(err.phase, RecoveryPhase::ReconstructPass);
    assert_eq!(err.lsn, None);
    assert!(err.detail.contains("missing node 6"), "{}", err.detail);
}
