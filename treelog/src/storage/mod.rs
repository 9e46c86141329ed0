//! B-tree storage engine: on-disk layout and crash recovery.
//!
//! # File Format
//!
//! An environment is a page file plus a write-ahead log next to it:
//!
//! - Page 0: Superblock (root, checkpoint and recovery metadata)
//! - Page N: the node whose id is N, or a free page
//! - `<name>.log`: append-only sequence of log records
//!
//! # Recovery
//!
//! ```ignore
//! use storage::{EnvironmentFile, RecoveryController};
//!
//! let mut file = EnvironmentFile::open_or_create(path)?;
//! let outcome = RecoveryController::new(&mut file, config, guard).run()?;
//! println!("root: {:?}", outcome.root);
//! ```

pub mod apply;
pub mod btree;
pub mod checkpoint;
pub mod file;
pub mod graph;
pub mod io;
pub mod level_map;
pub mod page;
pub mod recovery;
pub mod superblock;
pub mod wal;

pub use apply::{ApplyError, ApplyOutcome, Applier};
pub use btree::{Node, NodeError, NodeId, decode_node, encode_node};
pub use checkpoint::{CheckpointError, CheckpointResult, perform_checkpoint};
pub use file::{EnvironmentFile, FileError};
pub use graph::NodeGraph;
pub use io::{Storage, StorageError};
pub use level_map::LevelOrderedNodeMap;
pub use page::{PAGE_SIZE, Page, PageError, PageHeader, PageId, PageType};
pub use recovery::{
    FatalRecoveryError, RecoveryController, RecoveryErrorKind, RecoveryOutcome, RecoveryPhase,
    RecoveryStats, RecoveryWarning,
};
pub use superblock::{Superblock, SuperblockError};
pub use wal::{LogRecord, LogRecordPayload, LogRecordType, Lsn, TxnId, Wal, WalError};
