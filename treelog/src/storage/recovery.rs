//! Crash recovery for the storage engine.
//!
//! Recovery rebuilds the tree from the nodes that reached the environment
//! file and the records in the write-ahead log.
//!
//! # Recovery Process
//!
//! 1. Scan the log backward for the most recent checkpoint marker
//! 2. Undo pass: scan backward from the log end to the undo floor, group
//!    records by transaction and undo every transaction that did not commit
//! 3. Redo pass: scan forward from the checkpoint's redo start and redo every
//!    committed or non-transactional record (last writer wins)
//! 4. Reconstruct pass: validate every touched or stored internal node
//!    bottom-up, level by level, so a parent is only checked once its
//!    children are final
//! 5. Finalize: pick the root, write dirty nodes, update the superblock and
//!    take a fresh checkpoint
//!
//! Every step is set-based, so a recovery that crashes part way is finished
//! by simply running it again at the next open.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use tracing::{debug, error, info, trace, warn};

use crate::config::RecoveryConfig;
use crate::environment::EnvironmentGuard;
use crate::storage::apply::{ApplyError, ApplyOutcome, Applier};
use crate::storage::btree::{Level, NO_NODE, NodeId};
use crate::storage::checkpoint::{CheckpointError, CheckpointResult, perform_checkpoint};
use crate::storage::graph::NodeGraph;
use crate::storage::io::{Storage, StorageError};
use crate::storage::level_map::LevelOrderedNodeMap;
use crate::storage::wal::{LogRecordPayload, Lsn, TxnId, WalError};

/// Phases of one recovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryPhase {
    LocatingCheckpoint,
    UndoPass,
    RedoPass,
    ReconstructPass,
    Finalize,
    Failed,
    Done,
}

impl RecoveryPhase {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Done)
    }
}

impl std::fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::LocatingCheckpoint => "locating checkpoint",
            Self::UndoPass => "undo pass",
            Self::RedoPass => "redo pass",
            Self::ReconstructPass => "reconstruct pass",
            Self::Finalize => "finalize",
            Self::Failed => "failed",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Counters collected during one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Log records read by the undo and redo passes.
    pub records_scanned: u64,
    /// Records whose undo changed the graph.
    pub records_undone: u64,
    /// Records whose redo changed the graph.
    pub records_redone: u64,
    /// Transactions with a commit record inside the undo window.
    pub transactions_committed: u64,
    /// Transactions that aborted or never finished.
    pub transactions_rolled_back: u64,
    /// Registered nodes whose child references were checked.
    pub nodes_validated: u64,
    /// Registered nodes that no longer existed when their level came up.
    pub nodes_retired: u64,
    /// Nodes written back during finalize.
    pub nodes_written: u64,
    /// Nodes deleted from storage during finalize.
    pub nodes_deleted: u64,
    /// Nodes discarded by partial recovery or orphan removal.
    pub nodes_excised: u64,
    /// Dangling child entries dropped by partial recovery.
    pub dangling_dropped: u64,
}

/// Something recovery worked around instead of failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryWarning {
    pub phase: RecoveryPhase,
    pub lsn: Option<Lsn>,
    pub message: String,
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Root of the recovered tree, `None` when it is empty.
    pub root: Option<NodeId>,
    /// Log end the run recovered through.
    pub recovered_through: Lsn,
    /// Checkpoint the run started from, if one was used.
    pub checkpoint_lsn: Option<Lsn>,
    /// Checkpoint taken after the run.
    pub post_recovery_checkpoint: Option<CheckpointResult>,
    pub stats: RecoveryStats,
    pub warnings: Vec<RecoveryWarning>,
}

/// Category of a fatal recovery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryErrorKind {
    /// A log record failed validation.
    CorruptLog,
    /// A record could not be undone or redone.
    Apply,
    /// A child reference does not resolve to a node one level below.
    DanglingChild,
    /// More than one parentless node at the top level.
    MultipleRoots,
    /// Loading or persisting state failed.
    Storage,
}

impl std::fmt::Display for RecoveryErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::CorruptLog => "corrupt log",
            Self::Apply => "apply failed",
            Self::DanglingChild => "dangling child",
            Self::MultipleRoots => "multiple roots",
            Self::Storage => "storage failure",
        };
        f.write_str(name)
    }
}

/// Recovery could not restore a consistent environment.
///
/// The environment must be closed and reopened; reopening runs recovery
/// again against the same log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalRecoveryError {
    pub kind: RecoveryErrorKind,
    /// Phase that was running when the failure happened.
    pub phase: RecoveryPhase,
    /// Offending log position, when there is one.
    pub lsn: Option<Lsn>,
    pub detail: String,
}

impl FatalRecoveryError {
    #[must_use]
    pub fn new(
        kind: RecoveryErrorKind,
        phase: RecoveryPhase,
        lsn: Option<Lsn>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            phase,
            lsn,
            detail: detail.into(),
        }
    }

    fn storage(phase: RecoveryPhase, e: &StorageError) -> Self {
        Self::new(RecoveryErrorKind::Storage, phase, None, e.to_string())
    }

    fn log(phase: RecoveryPhase, e: &WalError) -> Self {
        let kind = match e {
            WalError::Io(_) => RecoveryErrorKind::Storage,
            _ => RecoveryErrorKind::CorruptLog,
        };
        Self::new(kind, phase, e.offset(), e.to_string())
    }

    fn apply(phase: RecoveryPhase, e: &ApplyError) -> Self {
        Self::new(RecoveryErrorKind::Apply, phase, Some(e.lsn()), e.to_string())
    }
}

impl std::fmt::Display for FatalRecoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "recovery failed during {}", self.phase)?;
        if let Some(lsn) = self.lsn {
            write!(f, " at lsn {lsn}")?;
        }
        write!(f, ": {}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for FatalRecoveryError {}

/// How a transaction ended, as seen from the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Committed,
    Aborted,
    InFlight,
}

/// Everything the undo pass learned about one transaction.
#[derive(Debug)]
struct TransactionRecovery {
    disposition: Disposition,
    /// Structural records, most recent first.
    positions: Vec<Lsn>,
}

/// Runs the recovery phases against one storage handle.
pub struct RecoveryController<'a, S: Storage> {
    storage: &'a mut S,
    config: RecoveryConfig,
    guard: EnvironmentGuard,
    phase: RecoveryPhase,

    graph: NodeGraph,
    map: LevelOrderedNodeMap,

    log_end: Lsn,
    checkpoint_lsn: Option<Lsn>,
    redo_start: Lsn,
    undo_floor: Lsn,
    committed: HashSet<TxnId>,
    max_txn_id: TxnId,
    max_logged_node: NodeId,

    root: Option<NodeId>,
    post_recovery_checkpoint: Option<CheckpointResult>,
    stats: RecoveryStats,
    warnings: Vec<RecoveryWarning>,
}

impl<'a, S: Storage> RecoveryController<'a, S> {
    pub fn new(storage: &'a mut S, config: RecoveryConfig, guard: EnvironmentGuard) -> Self {
        Self {
            storage,
            config,
            guard,
            phase: RecoveryPhase::LocatingCheckpoint,
            graph: NodeGraph::new(),
            map: LevelOrderedNodeMap::new(),
            log_end: 0,
            checkpoint_lsn: None,
            redo_start: 0,
            undo_floor: 0,
            committed: HashSet::new(),
            max_txn_id: 0,
            max_logged_node: 0,
            root: None,
            post_recovery_checkpoint: None,
            stats: RecoveryStats::default(),
            warnings: Vec::new(),
        }
    }

    #[must_use]
    pub const fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    /// Run every phase to completion.
    ///
    /// On failure the guard is moved to `RecoveryFailed` before the error is
    /// returned.
    pub fn run(mut self) -> Result<RecoveryOutcome, FatalRecoveryError> {
        info!(config = ?self.config, "Starting recovery");

        while !self.phase.is_terminal() {
            match self.step() {
                Ok(next) => {
                    debug!(from = %self.phase, to = %next, "Recovery phase complete");
                    self.phase = next;
                }
                Err(err) => {
                    self.phase = RecoveryPhase::Failed;
                    error!(
                        kind = %err.kind,
                        phase = %err.phase,
                        lsn = ?err.lsn,
                        detail = %err.detail,
                        "Recovery failed"
                    );
                    if let Err(e) = self.guard.mark_failed(&err) {
                        warn!(error = %e, "Could not mark environment as failed");
                    }
                    return Err(err);
                }
            }
        }

        info!(
            root = ?self.root,
            recovered_through = self.log_end,
            warnings = self.warnings.len(),
            "Recovery complete"
        );
        Ok(RecoveryOutcome {
            root: self.root,
            recovered_through: self.log_end,
            checkpoint_lsn: self.checkpoint_lsn,
            post_recovery_checkpoint: self.post_recovery_checkpoint,
            stats: self.stats,
            warnings: self.warnings,
        })
    }

    fn step(&mut self) -> Result<RecoveryPhase, FatalRecoveryError> {
        match self.phase {
            RecoveryPhase::LocatingCheckpoint => self.locate_checkpoint(),
            RecoveryPhase::UndoPass => self.undo_pass(),
            RecoveryPhase::RedoPass => self.redo_pass(),
            RecoveryPhase::ReconstructPass => self.reconstruct_pass(),
            RecoveryPhase::Finalize => self.finalize(),
            RecoveryPhase::Failed | RecoveryPhase::Done => Ok(self.phase),
        }
    }

    fn warn(&mut self, lsn: Option<Lsn>, message: String) {
        surface(&mut self.warnings, self.phase, lsn, message);
    }

    // ========== Locating checkpoint ==========

    fn locate_checkpoint(&mut self) -> Result<RecoveryPhase, FatalRecoveryError> {
        let phase = self.phase;
        self.graph =
            NodeGraph::load(&mut *self.storage).map_err(|e| FatalRecoveryError::storage(phase, &e))?;
        // Stored internal nodes are validated even if no record touches them.
        for node in self.graph.nodes().filter(|node| !node.is_leaf()) {
            self.map.register(node.id(), node.level());
        }

        let mut wal = self
            .storage
            .wal()
            .map_err(|e| FatalRecoveryError::storage(phase, &e))?;
        self.log_end = wal.end();

        let limit = self.config.checkpoint_scan_limit;
        let mut inspected = 0u64;
        let mut found = None;
        let mut limit_hit = false;
        for record in wal.backward(self.log_end) {
            let record = record.map_err(|e| FatalRecoveryError::log(phase, &e))?;
            inspected += 1;
            if let LogRecordPayload::Checkpoint(marker) = record.payload {
                found = Some((record.lsn, marker));
                break;
            }
            if limit != 0 && inspected >= limit {
                limit_hit = true;
                break;
            }
        }
        drop(wal);

        match found {
            Some((lsn, marker)) => {
                if marker.redo_start > lsn {
                    return Err(FatalRecoveryError::new(
                        RecoveryErrorKind::CorruptLog,
                        phase,
                        Some(lsn),
                        format!(
                            "checkpoint redo start {} lies after the marker",
                            marker.redo_start
                        ),
                    ));
                }
                self.checkpoint_lsn = Some(lsn);
                self.redo_start = marker.redo_start;
                self.undo_floor = marker.undo_floor();
                info!(
                    checkpoint_lsn = lsn,
                    checkpoint_root = ?marker.root,
                    redo_start = self.redo_start,
                    undo_floor = self.undo_floor,
                    log_end = self.log_end,
                    "Found checkpoint"
                );
            }
            None => {
                if limit_hit {
                    self.warn(
                        None,
                        format!(
                            "no checkpoint within the last {limit} records, recovering the whole log"
                        ),
                    );
                }
                info!(log_end = self.log_end, nodes = self.graph.len(), "Recovering from the start of the log");
            }
        }

        Ok(RecoveryPhase::UndoPass)
    }

    // ========== Undo pass ==========

    fn undo_pass(&mut self) -> Result<RecoveryPhase, FatalRecoveryError> {
        let phase = self.phase;
        let partial = self.config.allow_partial_recovery;
        let mut transactions: HashMap<TxnId, TransactionRecovery> = HashMap::new();

        let mut wal = self
            .storage
            .wal()
            .map_err(|e| FatalRecoveryError::storage(phase, &e))?;

        for record in wal.backward(self.log_end) {
            let record = record.map_err(|e| FatalRecoveryError::log(phase, &e))?;
            if record.lsn < self.undo_floor {
                break;
            }
            self.stats.records_scanned += 1;
            if let Some(node_id) = record.node_id() {
                self.max_logged_node = self.max_logged_node.max(node_id);
            }

            let Some(txn_id) = record.txn_id else {
                continue;
            };
            self.max_txn_id = self.max_txn_id.max(txn_id);

            let disposition = match record.payload {
                LogRecordPayload::Commit => Disposition::Committed,
                LogRecordPayload::Abort => Disposition::Aborted,
                _ => Disposition::InFlight,
            };
            let txn = transactions
                .entry(txn_id)
                .or_insert(TransactionRecovery {
                    disposition,
                    positions: Vec::new(),
                });
            if record.is_structural() {
                txn.positions.push(record.lsn);
            }
        }

        let mut pending: Vec<Lsn> = transactions
            .values()
            .filter(|txn| txn.disposition != Disposition::Committed)
            .flat_map(|txn| txn.positions.iter().copied())
            .collect();
        pending.sort_unstable_by_key(|lsn| Reverse(*lsn));

        let mut applier = Applier::new(&mut self.graph, &mut self.map);
        for lsn in pending {
            let record = wal
                .read_at(lsn)
                .map_err(|e| FatalRecoveryError::log(phase, &e))?;
            match applier.apply_undo(&record) {
                Ok(ApplyOutcome::Applied) => self.stats.records_undone += 1,
                Ok(_) => {}
                Err(e) if partial => {
                    let removed = applier.excise(e.node_id(), record.lsn);
                    self.stats.nodes_excised += removed.len() as u64;
                    surface(
                        &mut self.warnings,
                        phase,
                        Some(record.lsn),
                        format!("{e}; excised {} node(s)", removed.len()),
                    );
                }
                Err(e) => return Err(FatalRecoveryError::apply(phase, &e)),
            }
        }
        drop(wal);

        for (txn_id, txn) in &transactions {
            if txn.disposition == Disposition::Committed {
                self.committed.insert(*txn_id);
                self.stats.transactions_committed += 1;
            } else {
                self.stats.transactions_rolled_back += 1;
                debug!(
                    txn_id,
                    disposition = ?txn.disposition,
                    records = txn.positions.len(),
                    "Rolled back transaction"
                );
            }
        }
        info!(
            committed = self.stats.transactions_committed,
            rolled_back = self.stats.transactions_rolled_back,
            records_undone = self.stats.records_undone,
            "Undo pass complete"
        );
        Ok(RecoveryPhase::RedoPass)
    }

    // ========== Redo pass ==========

    fn redo_pass(&mut self) -> Result<RecoveryPhase, FatalRecoveryError> {
        let phase = self.phase;
        let partial = self.config.allow_partial_recovery;

        let mut wal = self
            .storage
            .wal()
            .map_err(|e| FatalRecoveryError::storage(phase, &e))?;
        let mut applier = Applier::new(&mut self.graph, &mut self.map);

        for record in wal.forward(self.redo_start) {
            let record = record.map_err(|e| FatalRecoveryError::log(phase, &e))?;
            self.stats.records_scanned += 1;

            if let LogRecordPayload::Trace(message) = &record.payload {
                debug!(lsn = record.lsn, message = %message, "Trace record");
                continue;
            }
            if !record.is_structural() {
                continue;
            }
            if let Some(txn_id) = record.txn_id
                && !self.committed.contains(&txn_id)
            {
                trace!(lsn = record.lsn, txn_id, "Skipping uncommitted record");
                continue;
            }

            match applier.apply_redo(&record) {
                Ok(ApplyOutcome::Applied) => self.stats.records_redone += 1,
                Ok(_) => {}
                Err(e) if partial => {
                    let removed = applier.excise(e.node_id(), record.lsn);
                    self.stats.nodes_excised += removed.len() as u64;
                    surface(
                        &mut self.warnings,
                        phase,
                        Some(record.lsn),
                        format!("{e}; excised {} node(s)", removed.len()),
                    );
                }
                Err(e) => return Err(FatalRecoveryError::apply(phase, &e)),
            }
        }

        info!(
            redo_start = self.redo_start,
            records_redone = self.stats.records_redone,
            touched_nodes = self.map.len(),
            "Redo pass complete"
        );
        Ok(RecoveryPhase::ReconstructPass)
    }

    // ========== Reconstruct pass ==========

    fn reconstruct_pass(&mut self) -> Result<RecoveryPhase, FatalRecoveryError> {
        let map = std::mem::take(&mut self.map);

        for (level, node_ids) in map.into_ascending_levels() {
            trace!(level, nodes = node_ids.len(), "Validating level");
            for node_id in node_ids {
                let Some(node) = self.graph.get(node_id) else {
                    self.stats.nodes_retired += 1;
                    continue;
                };
                let node_level = node.level();
                for child in node.children() {
                    self.validate_child(node_id, node_level, child)?;
                }
                self.stats.nodes_validated += 1;
            }
        }

        info!(
            validated = self.stats.nodes_validated,
            retired = self.stats.nodes_retired,
            "Reconstruct pass complete"
        );
        Ok(RecoveryPhase::Finalize)
    }

    /// Check that `child` exists one level below `parent`.
    fn validate_child(
        &mut self,
        parent: NodeId,
        parent_level: Level,
        child: NodeId,
    ) -> Result<(), FatalRecoveryError> {
        let child_level = self.graph.level_of(child);
        let expected = parent_level.checked_sub(1);
        if child_level.is_some() && child_level == expected {
            return Ok(());
        }

        let problem = match child_level {
            None => format!("node {parent} at level {parent_level} refers to missing node {child}"),
            Some(level) => format!(
                "node {parent} at level {parent_level} refers to node {child} at level {level}"
            ),
        };
        let lsn = self.graph.last_lsn(parent);

        if !self.config.allow_partial_recovery {
            return Err(FatalRecoveryError::new(
                RecoveryErrorKind::DanglingChild,
                self.phase,
                lsn,
                problem,
            ));
        }

        let dropped = self.graph.drop_child(parent, child);
        self.stats.dangling_dropped += dropped as u64;
        self.warn(lsn, format!("{problem}; dropped the entry"));
        Ok(())
    }

    // ========== Finalize ==========

    fn finalize(&mut self) -> Result<RecoveryPhase, FatalRecoveryError> {
        let phase = self.phase;
        self.root = self.choose_root()?;

        let flushed = self
            .graph
            .flush(&mut *self.storage)
            .map_err(|e| FatalRecoveryError::storage(phase, &e))?;
        self.stats.nodes_written = flushed.nodes_written;
        self.stats.nodes_deleted = flushed.nodes_deleted;

        let max_node_id = self.graph.max_node_id().max(self.max_logged_node);
        let superblock = self.storage.superblock_mut();
        superblock.root_node = self.root.unwrap_or(NO_NODE);
        superblock.recovered_through = self.log_end;
        superblock.next_node_id = superblock.next_node_id.max(max_node_id + 1);
        superblock.next_txn_id = superblock.next_txn_id.max(self.max_txn_id + 1);
        self.storage
            .write_superblock()
            .and_then(|()| self.storage.sync())
            .map_err(|e| FatalRecoveryError::storage(phase, &e))?;

        if self.config.checkpoint_after_recovery {
            let result = perform_checkpoint(&mut *self.storage, &mut self.graph, self.root)
                .map_err(|e| checkpoint_failure(phase, &e))?;
            self.post_recovery_checkpoint = Some(result);
        }

        info!(
            root = ?self.root,
            nodes_written = self.stats.nodes_written,
            nodes_deleted = self.stats.nodes_deleted,
            "Finalize complete"
        );
        Ok(RecoveryPhase::Done)
    }

    /// The highest-level node nothing refers to.
    ///
    /// Any other parentless node makes the root ambiguous. Under partial
    /// recovery the ones below the root level are discarded instead.
    fn choose_root(&mut self) -> Result<Option<NodeId>, FatalRecoveryError> {
        let rootless = self.graph.rootless();
        let Some(top) = rootless
            .iter()
            .filter_map(|id| self.graph.level_of(*id))
            .max()
        else {
            if self.graph.is_empty() {
                return Ok(None);
            }
            return Err(FatalRecoveryError::new(
                RecoveryErrorKind::DanglingChild,
                self.phase,
                None,
                format!(
                    "all {} nodes are referenced by another node, no root can be chosen",
                    self.graph.len()
                ),
            ));
        };

        let (candidates, orphans): (Vec<NodeId>, Vec<NodeId>) = rootless
            .into_iter()
            .partition(|id| self.graph.level_of(*id) == Some(top));

        let discard_orphans = self.config.allow_partial_recovery;
        if candidates.len() > 1 || (!orphans.is_empty() && !discard_orphans) {
            let lsn = candidates
                .iter()
                .chain(&orphans)
                .filter_map(|id| self.graph.last_lsn(*id))
                .max();
            let detail = if candidates.len() > 1 {
                format!("nodes {candidates:?} at level {top} have no parent")
            } else {
                format!(
                    "nodes {orphans:?} have no parent and sit below root {:?} at level {top}",
                    candidates.first()
                )
            };
            return Err(FatalRecoveryError::new(
                RecoveryErrorKind::MultipleRoots,
                self.phase,
                lsn,
                detail,
            ));
        }

        for orphan in orphans {
            let lsn = self.graph.last_lsn(orphan).unwrap_or(self.log_end);
            let (removed, _) = self.graph.excise_subtree(orphan, lsn);
            if removed.is_empty() {
                continue;
            }
            self.stats.nodes_excised += removed.len() as u64;
            self.warn(
                Some(lsn),
                format!(
                    "node {orphan} has no parent and is below the root level, discarded {} node(s)",
                    removed.len()
                ),
            );
        }

        Ok(candidates.first().copied())
    }
}

fn surface(
    warnings: &mut Vec<RecoveryWarning>,
    phase: RecoveryPhase,
    lsn: Option<Lsn>,
    message: String,
) {
    warn!(phase = %phase, lsn = ?lsn, "{message}");
    warnings.push(RecoveryWarning {
        phase,
        lsn,
        message,
    });
}

fn checkpoint_failure(phase: RecoveryPhase, e: &CheckpointError) -> FatalRecoveryError {
    match e {
        CheckpointError::Storage(e) => FatalRecoveryError::storage(phase, e),
        CheckpointError::Wal(e) => {
            FatalRecoveryError::new(RecoveryErrorKind::Storage, phase, e.offset(), e.to_string())
        }
    }
}
