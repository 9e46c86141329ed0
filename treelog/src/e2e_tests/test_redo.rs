//! Committed and non-transactional work is redone in log order.

use crate::e2e_tests::helpers::*;

#[test]
fn test_last_committed_writer_wins() {
    let mut env = TestEnv::simulated(40);
    for value in ["v1", "v2"] {
        let txn = env.begin();
        env.write(Some(txn), &leaf(1, &[("k", value)]));
        env.commit(txn);
    }
    let txn = env.begin();
    env.write(Some(txn), &leaf(1, &[("k", "v3")]));

    let outcome = env.recover(no_checkpoint()).expect("recover");

    assert_eq!(outcome.root, Some(1));
    assert_eq!(env.tree().get(&1), Some(&leaf(1, &[("k", "v2")])));
}

#[test]
fn test_non_transactional_records_are_redone() {
    let mut env = TestEnv::simulated(41);
    env.write(None, &leaf(1, &[("a", "1")]));
    env.write(None, &leaf(2, &[("b", "2")]));
    env.write(None, &internal(3, 1, &[1, 2]));

    let outcome = env.recover(no_checkpoint()).expect("recover");

    assert_eq!(outcome.root, Some(3));
    assert_eq!(outcome.stats.records_redone, 3);
    assert_eq!(outcome.stats.transactions_committed, 0);
}

#[test]
fn test_committed_delete_is_redone() {
    let mut env = TestEnv::simulated(42);
    env.commit_nodes(&[
        leaf(1, &[("a", "1")]),
        leaf(2, &[("m", "2")]),
        internal(3, 1, &[1, 2]),
    ]);
    env.flush_live();

    let txn = env.begin();
    env.write(Some(txn), &internal(3, 1, &[1]));
    env.delete(Some(txn), 2);
    env.commit(txn);

    let outcome = env.recover(no_checkpoint()).expect("recover");

    assert_eq!(outcome.root, Some(3));
    let tree = env.tree();
    assert_eq!(tree.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(tree.get(&3).map(Node::children), Some(vec![1]));
}

#[test]
fn test_uncommitted_and_committed_interleaved() {
    let mut env = TestEnv::simulated(43);
    let committed = env.begin();
    let unfinished = env.begin();
    env.write(Some(committed), &leaf(1, &[("a", "1")]));
    env.write(Some(unfinished), &leaf(5, &[("x", "1")]));
    env.write(Some(committed), &leaf(2, &[("b", "2")]));
    env.write(Some(committed), &internal(3, 1, &[1, 2]));
    env.commit(committed);

    let outcome = env.recover(no_checkpoint()).expect("recover");

    assert_eq!(outcome.root, Some(3));
    assert_eq!(outcome.stats.transactions_committed, 1);
    assert_eq!(outcome.stats.transactions_rolled_back, 1);
    assert!(!env.tree().contains_key(&5));
}
