//! Recovery starting from a checkpoint marker.

use std::collections::BTreeMap;

use crate::e2e_tests::helpers::*;

fn base(env: &mut TestEnv<SimulatedStorage>) -> BTreeMap<NodeId, Node> {
    let nodes = [
        leaf(1, &[("a", "1")]),
        leaf(2, &[("m", "2")]),
        internal(3, 1, &[1, 2]),
    ];
    env.commit_nodes(&nodes);
    nodes.into_iter().map(|node| (node.id(), node)).collect()
}

#[test]
fn test_only_trace_records_after_checkpoint() {
    let mut env = TestEnv::simulated(30);
    let expected = base(&mut env);
    let checkpoint = env.checkpoint(Some(3), None);
    env.trace("compaction skipped");
    env.trace("shutting down");

    let outcome = env.recover(no_checkpoint()).expect("recover");

    assert_eq!(outcome.checkpoint_lsn, Some(checkpoint));
    assert_eq!(outcome.root, Some(3));
    assert_eq!(outcome.stats.records_redone, 0);
    assert_eq!(outcome.stats.records_undone, 0);
    // Stored node 3 is checked although no record after the marker names it.
    assert_eq!(outcome.stats.nodes_validated, 1);
    assert_eq!(env.tree(), expected);
}

#[test]
fn test_transaction_running_at_checkpoint_is_undone() {
    let mut env = TestEnv::simulated(31);
    let expected = base(&mut env);

    let txn = env.begin();
    let first_active = env.write(Some(txn), &leaf(4, &[("z", "9")]));
    env.write(Some(txn), &internal(3, 1, &[1, 2, 4]));
    // The checkpoint flushes the unfinished transaction's pages too.
    env.checkpoint(Some(3), Some(first_active));
    env.crash();

    let outcome = env.recover(no_checkpoint()).expect("recover");

    assert_eq!(outcome.root, Some(3));
    assert_eq!(outcome.stats.transactions_rolled_back, 1);
    assert_eq!(outcome.stats.records_undone, 2);
    assert_eq!(env.tree(), expected);
}

#[test]
fn test_work_after_checkpoint_is_redone() {
    let mut env = TestEnv::simulated(32);
    base(&mut env);
    let checkpoint = env.checkpoint(Some(3), None);

    let txn = env.begin();
    env.write(Some(txn), &leaf(2, &[("m", "2"), ("n", "3")]));
    env.commit(txn);

    let outcome = env.recover(no_checkpoint()).expect("recover");

    assert_eq!(outcome.checkpoint_lsn, Some(checkpoint));
    assert_eq!(outcome.stats.transactions_committed, 1);
    assert_eq!(outcome.stats.records_redone, 1);
    assert_eq!(
        env.tree().get(&2),
        Some(&leaf(2, &[("m", "2"), ("n", "3")]))
    );
}

#[test]
fn test_recovery_checkpoint_bounds_next_run() {
    let mut env = TestEnv::simulated(33);
    base(&mut env);
    let first = env.recover(RecoveryConfig::default()).expect("first run");

    let txn = env.begin();
    env.write(Some(txn), &leaf(1, &[("a", "updated")]));
    env.commit(txn);
    let second = env.recover(RecoveryConfig::default()).expect("second run");

    assert_eq!(
        second.checkpoint_lsn,
        first.post_recovery_checkpoint.map(|c| c.checkpoint_lsn)
    );
    assert_eq!(second.stats.records_redone, 1);
    assert_eq!(second.stats.transactions_committed, 1);
    assert_eq!(env.tree().get(&1), Some(&leaf(1, &[("a", "updated")])));
}
