//! Checkpointing after recovery.
//!
//! A checkpoint records a stable point in the log so that the next recovery
//! only has to look at what was written after it.
//!
//! # Checkpoint Process
//!
//! 1. Flush all dirty nodes to disk
//! 2. Write checkpoint record to WAL
//! 3. Update superblock with checkpoint LSN
//! 4. fsync to ensure durability
//!
//! # Recovery
//!
//! The marker's `redo_start` is the log end at the time every dirty node had
//! been flushed. Recovery replays committed work from there and undoes
//! unfinished work back to the marker's first active position.

use tracing::debug;

use crate::storage::btree::NodeId;
use crate::storage::graph::NodeGraph;
use crate::storage::io::{Storage, StorageError};
use crate::storage::wal::{CheckpointMarker, LogRecordPayload, Lsn, WalError};

/// Result of a checkpoint operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointResult {
    /// LSN of the checkpoint record.
    pub checkpoint_lsn: Lsn,

    /// Position redo restarts from after this checkpoint.
    pub redo_start: Lsn,

    /// Number of dirty nodes that were written.
    pub nodes_flushed: u64,
}

/// Perform a checkpoint with no transaction in flight.
///
/// This function:
/// 1. Flushes the graph's dirty and removed nodes
/// 2. Writes a checkpoint record to the WAL
/// 3. Updates the superblock with checkpoint metadata
/// 4. Syncs to ensure durability
pub fn perform_checkpoint<S: Storage>(
    storage: &mut S,
    graph: &mut NodeGraph,
    root: Option<NodeId>,
) -> Result<CheckpointResult, CheckpointError> {
    // Step 1: Flush nodes so that nothing before redo_start needs replaying
    let flushed = graph.flush(storage)?;

    // Step 2: Write checkpoint record to WAL
    let (checkpoint_lsn, redo_start) = {
        let mut wal = storage.wal()?;
        let redo_start = wal.end();
        let marker = CheckpointMarker {
            root,
            redo_start,
            first_active: None,
        };
        let lsn = wal.append(None, LogRecordPayload::Checkpoint(marker))?;
        wal.sync()?;
        (lsn, redo_start)
    };
    storage.log_sync()?;

    // Step 3: Update superblock with checkpoint metadata
    storage.superblock_mut().last_checkpoint_lsn = Some(checkpoint_lsn);
    storage.write_superblock()?;

    // Step 4: Final sync to ensure durability
    storage.sync()?;

    debug!(
        checkpoint_lsn,
        nodes_flushed = flushed.nodes_written,
        "Checkpoint complete"
    );

    Ok(CheckpointResult {
        checkpoint_lsn,
        redo_start,
        nodes_flushed: flushed.nodes_written,
    })
}

/// Errors that can occur during checkpoint operations.
#[derive(Debug)]
pub enum CheckpointError {
    /// Storage error.
    Storage(StorageError),
    /// WAL error.
    Wal(WalError),
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "checkpoint storage error: {e}"),
            Self::Wal(e) => write!(f, "checkpoint WAL error: {e}"),
        }
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Wal(e) => Some(e),
        }
    }
}

impl From<StorageError> for CheckpointError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<WalError> for CheckpointError {
    fn from(e: WalError) -> Self {
        Self::Wal(e)
    }
}
