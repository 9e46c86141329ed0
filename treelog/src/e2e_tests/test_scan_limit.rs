//! Bounding the backward search for a checkpoint.

use crate::e2e_tests::helpers::*;

/// One committed leaf, a checkpoint, then three more records.
fn log_with_checkpoint(env: &mut TestEnv<SimulatedStorage>) -> Lsn {
    env.commit_nodes(&[leaf(1, &[("a", "1")])]);
    let checkpoint = env.checkpoint(Some(1), None);
    let txn = env.begin();
    env.write(Some(txn), &leaf(2, &[("m", "2")]));
    env.write(Some(txn), &internal(3, 1, &[1, 2]));
    env.commit(txn);
    checkpoint
}

fn limited(records: u64) -> RecoveryConfig {
    RecoveryConfig {
        checkpoint_scan_limit: records,
        ..no_checkpoint()
    }
}

#[test]
fn test_limit_short_of_checkpoint_replays_whole_log() {
    let mut env = TestEnv::simulated(100);
    log_with_checkpoint(&mut env);

    let outcome = env.recover(limited(2)).expect("recover");

    assert_eq!(outcome.checkpoint_lsn, None);
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].phase, RecoveryPhase::LocatingCheckpoint);
    assert_eq!(outcome.root, Some(3));
    // The leaf written before the checkpoint is already on disk.
    assert_eq!(outcome.stats.records_redone, 2);
    assert_eq!(env.tree().len(), 3);
}

#[test]
fn test_limit_reaching_checkpoint_uses_it() {
    let mut env = TestEnv::simulated(101);
    let checkpoint = log_with_checkpoint(&mut env);

    for records in [4, 10] {
        let outcome = env.recover(limited(records)).expect("recover");
        assert_eq!(outcome.checkpoint_lsn, Some(checkpoint), "limit {records}");
        assert!(outcome.warnings.is_empty(), "limit {records}");
        assert_eq!(outcome.root, Some(3));
    }
}

#[test]
fn test_zero_means_unbounded() {
    let mut env = TestEnv::simulated(102);
    let checkpoint = log_with_checkpoint(&mut env);

    let outcome = env.recover(limited(0)).expect("recover");

    assert_eq!(outcome.checkpoint_lsn, Some(checkpoint));
    assert_eq!(outcome.stats.records_redone, 2);
}
