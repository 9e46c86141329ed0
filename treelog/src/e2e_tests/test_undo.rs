//! Work of transactions that never committed is rolled back.

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
fn test_uncommitted_writes_leave_empty_tree() {
    let mut env = TestEnv::simulated(20);
    let txn = env.begin();
    env.write(Some(txn), &leaf(1, &[("a", "1")]));
    env.write(Some(txn), &leaf(2, &[("m", "2")]));
    env.write(Some(txn), &internal(3, 1, &[1, 2]));

    let outcome = env.recover(no_checkpoint()).expect("recover");

    assert_eq!(outcome.root, None);
    assert_eq!(outcome.stats.transactions_rolled_back, 1);
    assert_eq!(outcome.stats.records_redone, 0);
    assert!(env.tree().is_empty());
    assert_eq!(env.storage.superblock().root(), None);
}

#[test]
fn test_flushed_uncommitted_writes_are_removed() {
    let mut env = TestEnv::simulated(21);
    let txn = env.begin();
    env.write(Some(txn), &leaf(1, &[("a", "1")]));
    env.write(Some(txn), &leaf(2, &[("m", "2")]));
    env.write(Some(txn), &internal(3, 1, &[1, 2]));
    env.flush_live();
    env.crash();

    let outcome = env.recover(no_checkpoint()).expect("recover");

    assert_eq!(outcome.root, None);
    assert_eq!(outcome.stats.records_undone, 3);
    assert_eq!(outcome.stats.nodes_deleted, 3);
    assert!(env.tree().is_empty());
}

#[test]
fn test_aborted_transaction_is_rolled_back() {
    let mut env = TestEnv::simulated(22);
    let expected = base(&mut env);

    let txn = env.begin();
    env.write(Some(txn), &leaf(1, &[("a", "changed")]));
    env.delete(Some(txn), 2);
    env.abort(txn);

    let outcome = env.recover(no_checkpoint()).expect("recover");

    assert_eq!(outcome.root, Some(3));
    assert_eq!(outcome.stats.transactions_committed, 1);
    assert_eq!(outcome.stats.transactions_rolled_back, 1);
    assert_eq!(env.tree(), expected);
}

#[test]
fn test_in_flight_changes_on_disk_are_undone() {
    let mut env = TestEnv::simulated(23);
    let expected = base(&mut env);

    let txn = env.begin();
    env.write(Some(txn), &leaf(4, &[("z", "9")]));
    env.write(Some(txn), &internal(3, 1, &[1, 2, 4]));
    env.write(Some(txn), &leaf(1, &[("a", "changed")]));
    env.delete(Some(txn), 2);
    // The buffer pool wrote the unfinished transaction's pages.
    env.flush_live();
    env.crash();

    let outcome = env.recover(no_checkpoint()).expect("recover");

    assert_eq!(outcome.root, Some(3));
    assert_eq!(outcome.stats.records_undone, 4);
    assert_eq!(env.tree(), expected);
}

#[test]
fn test_interleaved_unfinished_transactions_undo_newest_first() {
    let mut env = TestEnv::simulated(24);
    let expected = base(&mut env);

    let first = env.begin();
    let second = env.begin();
    env.write(Some(first), &leaf(1, &[("a", "first")]));
    env.write(Some(second), &leaf(1, &[("a", "second")]));
    env.write(Some(first), &leaf(2, &[("m", "first")]));
    env.abort(first);
    env.flush_live();
    env.crash();

    let outcome = env.recover(no_checkpoint()).expect("recover");

    // Node 1 ends at the image from before either transaction.
    assert_eq!(outcome.stats.transactions_rolled_back, 2);
    assert_eq!(outcome.stats.records_undone, 3);
    assert_eq!(env.tree(), expected);
}
