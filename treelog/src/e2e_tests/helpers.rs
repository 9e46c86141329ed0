//! Common helpers for end-to-end recovery tests.
//!
//! [`TestEnv`] plays the part of a running engine: it keeps the live image of
//! every node, writes log records with the right prior images, and can flush
//! or crash the storage underneath.

use std::collections::{BTreeMap, HashMap};

pub use crate::config::RecoveryConfig;
pub use crate::environment::{Environment, EnvironmentError, EnvironmentGuard, EnvironmentState};
pub use crate::simulation::{FaultConfig, SimulatedStorage};
pub use crate::storage::btree::{ChildRef, InternalNode, LeafEntry, LeafNode, Level, Node, NodeId};
pub use crate::storage::io::Storage;
pub use crate::storage::recovery::{
    FatalRecoveryError, RecoveryErrorKind, RecoveryOutcome, RecoveryPhase,
};
pub use crate::storage::wal::{CheckpointMarker, LogRecordPayload, Lsn, TxnId};
use crate::storage::btree::encode_node;

/// A leaf holding `entries`.
pub fn leaf(id: NodeId, entries: &[(&str, &str)]) -> Node {
    Node::Leaf(LeafNode::new(
        id,
        entries
            .iter()
            .map(|(k, v)| LeafEntry::new(k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect(),
    ))
}

/// An internal node pointing at `children`, keyed by child id.
pub fn internal(id: NodeId, level: Level, children: &[NodeId]) -> Node {
    Node::Internal(InternalNode::new(
        id,
        level,
        children
            .iter()
            .map(|child| ChildRef::new(child.to_be_bytes().to_vec(), *child))
            .collect(),
    ))
}

/// Recovery settings that leave the log exactly as the test wrote it.
pub fn no_checkpoint() -> RecoveryConfig {
    RecoveryConfig {
        checkpoint_after_recovery: false,
        ..RecoveryConfig::default()
    }
}

/// Recovery settings that excise damage instead of failing.
pub fn partial() -> RecoveryConfig {
    RecoveryConfig {
        allow_partial_recovery: true,
        ..no_checkpoint()
    }
}

/// Engine stand-in writing to storage `S`.
pub struct TestEnv<S: Storage> {
    pub storage: S,
    /// Live image of every node, as the running engine would see it.
    live: HashMap<NodeId, Node>,
    next_txn: TxnId,
}

impl TestEnv<SimulatedStorage> {
    pub fn simulated(seed: u64) -> Self {
        Self::new(SimulatedStorage::new(seed))
    }

    /// Lose everything that was not synced.
    pub fn crash(&mut self) {
        self.storage.crash();
    }
}

impl<S: Storage> TestEnv<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            live: HashMap::new(),
            next_txn: 1,
        }
    }

    /// Hand out a fresh transaction id.
    pub fn begin(&mut self) -> TxnId {
        let txn = self.next_txn;
        self.next_txn += 1;
        txn
    }

    /// Append a record and make it durable.
    #[allow(clippy::expect_used)]
    pub fn append(&mut self, txn: Option<TxnId>, payload: LogRecordPayload) -> Lsn {
        let lsn = self
            .storage
            .wal()
            .expect("open wal")
            .append(txn, payload)
            .expect("append");
        self.storage.log_sync().expect("log sync");
        lsn
    }

    /// Log a write of `node`, with the live image as prior.
    #[allow(clippy::expect_used)]
    pub fn write(&mut self, txn: Option<TxnId>, node: &Node) -> Lsn {
        let prior = self.live.insert(node.id(), node.clone());
        self.append(
            txn,
            LogRecordPayload::NodeWrite {
                node_id: node.id(),
                level: node.level(),
                image: encode_node(node).expect("encode"),
                prior: prior.map(|prior| encode_node(&prior).expect("encode")),
            },
        )
    }

    /// Log a delete of a live node.
    #[allow(clippy::expect_used)]
    pub fn delete(&mut self, txn: Option<TxnId>, node_id: NodeId) -> Lsn {
        let prior = self.live.remove(&node_id).expect("node is live");
        self.append(
            txn,
            LogRecordPayload::NodeDelete {
                node_id,
                level: prior.level(),
                prior: Some(encode_node(&prior).expect("encode")),
            },
        )
    }

    pub fn commit(&mut self, txn: TxnId) -> Lsn {
        self.append(Some(txn), LogRecordPayload::Commit)
    }

    pub fn abort(&mut self, txn: TxnId) -> Lsn {
        self.append(Some(txn), LogRecordPayload::Abort)
    }

    pub fn trace(&mut self, message: &str) -> Lsn {
        self.append(None, LogRecordPayload::Trace(message.to_string()))
    }

    /// Write the whole tree in one committed transaction.
    pub fn commit_nodes(&mut self, nodes: &[Node]) -> TxnId {
        let txn = self.begin();
        for node in nodes {
            self.write(Some(txn), node);
        }
        self.commit(txn);
        txn
    }

    /// Write every live image to storage and delete everything else, as a
    /// buffer pool evicting dirty pages would.
    #[allow(clippy::expect_used)]
    pub fn flush_live(&mut self) {
        for node_id in self.storage.node_ids().expect("node ids") {
            if !self.live.contains_key(&node_id) {
                self.storage.delete_node(node_id).expect("delete");
            }
        }
        for node in self.live.values() {
            self.storage.write_node(node).expect("write");
        }
        self.storage.sync().expect("sync");
    }

    /// Flush, then log a checkpoint marker.
    ///
    /// `first_active` is the first record of a transaction still running.
    #[allow(clippy::expect_used)]
    pub fn checkpoint(&mut self, root: Option<NodeId>, first_active: Option<Lsn>) -> Lsn {
        self.flush_live();
        let redo_start = self.storage.wal().expect("open wal").end();
        self.append(
            None,
            LogRecordPayload::Checkpoint(CheckpointMarker {
                root,
                redo_start,
                first_active,
            }),
        )
    }

    /// Run recovery the way opening the environment does.
    pub fn recover(&mut self, config: RecoveryConfig) -> Result<RecoveryOutcome, FatalRecoveryError> {
        let environment = Environment::open(&mut self.storage, &config)?;
        let outcome = environment.recovery().clone();
        environment.close();
        Ok(outcome)
    }

    /// Run recovery with a shared guard.
    pub fn recover_with_guard(
        &mut self,
        config: RecoveryConfig,
        guard: &EnvironmentGuard,
    ) -> Result<RecoveryOutcome, EnvironmentError> {
        let environment = Environment::open_with_guard(&mut self.storage, &config, guard.clone())?;
        Ok(environment.recovery().clone())
    }

    /// Every stored node, by id.
    #[allow(clippy::expect_used)]
    pub fn tree(&mut self) -> BTreeMap<NodeId, Node> {
        self.storage
            .load_nodes()
            .expect("load nodes")
            .into_iter()
            .map(|node| (node.id(), node))
            .collect()
    }

    /// Current log end.
    #[allow(clippy::expect_used)]
    pub fn log_end(&mut self) -> Lsn {
        self.storage.wal().expect("open wal").end()
    }
}
