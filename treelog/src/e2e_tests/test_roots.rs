//! Choosing the root once the tree has been rebuilt.

use crate::e2e_tests::helpers::*;

#[test]
fn test_two_parentless_nodes_at_top_level() {
    let mut env = TestEnv::simulated(60);
    env.commit_nodes(&[leaf(1, &[("a", "1")]), leaf(2, &[("b", "2")])]);

    let err = env.recover(no_checkpoint()).expect_err("two roots");
    assert_eq!(err.kind, RecoveryErrorKind::MultipleRoots);
    assert_eq!(err.phase, RecoveryPhase::Finalize);

    // Excision cannot pick between them either.
    let err = env.recover(partial()).expect_err("two roots");
    assert_eq!(err.kind, RecoveryErrorKind::MultipleRoots);
}

#[test]
fn test_second_subtree_without_parent_fails() {
    let mut env = TestEnv::simulated(61);
    env.commit_nodes(&[leaf(1, &[("a", "1")]), internal(2, 1, &[1])]);
    env.flush_live();
    // A later transaction builds a taller tree that never links node 2.
    let txn = env.begin();
    env.write(Some(txn), &leaf(3, &[("m", "3")]));
    env.write(Some(txn), &internal(4, 1, &[3]));
    env.write(Some(txn), &internal(5, 2, &[4]));
    env.commit(txn);
    let before = env.tree();

    let err = env.recover(no_checkpoint()).expect_err("node 2 has no parent");

    assert_eq!(err.kind, RecoveryErrorKind::MultipleRoots);
    assert_eq!(err.phase, RecoveryPhase::Finalize);
    assert!(err.detail.contains("[2]"));
    assert_eq!(env.tree(), before);
    assert!(env.tree().contains_key(&1));
    assert!(env.tree().contains_key(&2));
}

#[test]
fn test_orphan_below_root_fails_unless_partial() {
    let mut env = TestEnv::simulated(62);
    let txn = env.begin();
    env.write(Some(txn), &leaf(1, &[("a", "1")]));
    let orphan_lsn = env.write(Some(txn), &leaf(2, &[("b", "2")]));
    env.write(Some(txn), &internal(3, 1, &[1]));
    env.commit(txn);

    let err = env.recover(no_checkpoint()).expect_err("orphan");
    assert_eq!(err.kind, RecoveryErrorKind::MultipleRoots);
    assert_eq!(err.phase, RecoveryPhase::Finalize);
    assert!(env.tree().is_empty());

    let outcome = env.recover(partial()).expect("recover");

    assert_eq!(outcome.root, Some(3));
    assert_eq!(outcome.stats.nodes_excised, 1);
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].phase, RecoveryPhase::Finalize);
    assert_eq!(outcome.warnings[0].lsn, Some(orphan_lsn));
    assert_eq!(env.tree().keys().copied().collect::<Vec<_>>(), vec![1, 3]);
}

#[test]
fn test_partial_recovery_excises_orphan_subtree_whole() {
    let mut env = TestEnv::simulated(63);
    env.commit_nodes(&[
        leaf(1, &[("a", "1")]),
        leaf(2, &[("b", "2")]),
        leaf(3, &[("c", "3")]),
        internal(4, 1, &[1]),
        internal(5, 1, &[2, 3]),
        internal(6, 2, &[4]),
    ]);

    let outcome = env.recover(partial()).expect("recover");

    assert_eq!(outcome.root, Some(6));
    assert_eq!(outcome.stats.nodes_excised, 3);
    assert_eq!(env.tree().keys().copied().collect::<Vec<_>>(), vec![1, 4, 6]);
}

#[test]
fn test_reference_cycle_fails() {
    let mut env = TestEnv::simulated(64);
    env.storage.write_node(&internal(5, 1, &[6])).expect("write");
    env.storage.write_node(&internal(6, 1, &[5])).expect("write");
    env.storage.sync().expect("sync");
    let before = env.tree();
    let guard = EnvironmentGuard::new();

    let err = env
        .recover_with_guard(no_checkpoint(), &guard)
        .expect_err("no root");

    let err = match err {
        EnvironmentError::RecoveryFailed(failure) => failure,
        other => panic!("expected a recovery failure, got {other}"),
    };
    assert_eq!(err.kind, RecoveryErrorKind::DanglingChild);
    assert_eq!(err.phase, RecoveryPhase::ReconstructPass);
    assert_eq!(guard.state(), EnvironmentState::RecoveryFailed);
    assert_eq!(env.tree(), before);
}

#[test]
fn test_empty_environment_has_no_root() {
    let mut env = TestEnv::simulated(65);

    let outcome = env.recover(no_checkpoint()).expect("recover");

    assert_eq!(outcome.root, None);
    assert!(outcome.warnings.is_empty());
    assert!(env.tree().is_empty());
}

#[test]
fn test_superblock_records_root() {
    let mut env = TestEnv::simulated(66);
    env.commit_nodes(&[leaf(1, &[("a", "1")]), internal(2, 1, &[1])]);

    env.recover(no_checkpoint()).expect("recover");

    assert_eq!(env.storage.superblock().root(), Some(2));
}
