//! In-memory node graph used while recovering.
//!
//! Holds every node of the environment, keyed by id, together with a
//! referrer index (child id to the set of nodes that point at it). The
//! referrer index answers "who is my parent" for root detection and lets a
//! deleted or relevelled node put its parents up for revalidation.
//!
//! Changes are tracked as a dirty set and a removed set and written back in
//! one [`NodeGraph::flush`].

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::storage::btree::{Level, Node, NodeId};
use crate::storage::io::{Storage, StorageError};
use crate::storage::wal::Lsn;

/// Counts from one [`NodeGraph::flush`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    pub nodes_written: u64,
    pub nodes_deleted: u64,
}

/// Node set under reconstruction.
#[derive(Debug, Default)]
pub struct NodeGraph {
    nodes: HashMap<NodeId, Node>,
    referrers: HashMap<NodeId, BTreeSet<NodeId>>,
    dirty: BTreeSet<NodeId>,
    removed: BTreeSet<NodeId>,
    last_lsn: HashMap<NodeId, Lsn>,
    max_node_id: NodeId,
}

impl NodeGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every stored node. Nothing starts out dirty.
    pub fn load<S: Storage>(storage: &mut S) -> Result<Self, StorageError> {
        let mut graph = Self::new();
        for node in storage.load_nodes()? {
            graph.insert_clean(node);
        }
        debug!(nodes = graph.len(), "Loaded node graph");
        Ok(graph)
    }

    fn insert_clean(&mut self, node: Node) {
        let node_id = node.id();
        self.link(&node);
        self.max_node_id = self.max_node_id.max(node_id);
        self.nodes.insert(node_id, node);
    }

    #[must_use]
    pub fn get(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    #[must_use]
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Existing nodes, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Level of an existing node.
    #[must_use]
    pub fn level_of(&self, node_id: NodeId) -> Option<Level> {
        self.nodes.get(&node_id).map(Node::level)
    }

    /// Existing nodes holding a child reference to `node_id`.
    #[must_use]
    pub fn referrers(&self, node_id: NodeId) -> Vec<NodeId> {
        self.referrers
            .get(&node_id)
            .map(|parents| parents.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Position of the last record applied to `node_id` in this run.
    #[must_use]
    pub fn last_lsn(&self, node_id: NodeId) -> Option<Lsn> {
        self.last_lsn.get(&node_id).copied()
    }

    /// Highest node id ever seen, present or removed.
    #[must_use]
    pub const fn max_node_id(&self) -> NodeId {
        self.max_node_id
    }

    /// Ids of existing nodes that no node refers to, ascending.
    #[must_use]
    pub fn rootless(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .keys()
            .copied()
            .filter(|id| self.referrers.get(id).is_none_or(BTreeSet::is_empty))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Replace (or create) a node. Returns the node it replaced.
    pub fn put(&mut self, node: Node, lsn: Lsn) -> Option<Node> {
        let node_id = node.id();
        let previous = self.nodes.remove(&node_id);
        if let Some(previous) = &previous {
            self.unlink(previous);
        }
        self.link(&node);
        self.nodes.insert(node_id, node);

        self.max_node_id = self.max_node_id.max(node_id);
        self.dirty.insert(node_id);
        self.removed.remove(&node_id);
        self.last_lsn.insert(node_id, lsn);
        previous
    }

    /// Remove a node. Returns it if it existed.
    pub fn remove(&mut self, node_id: NodeId, lsn: Lsn) -> Option<Node> {
        let previous = self.nodes.remove(&node_id)?;
        self.unlink(&previous);
        self.dirty.remove(&node_id);
        self.removed.insert(node_id);
        self.last_lsn.insert(node_id, lsn);
        Some(previous)
    }

    /// Drop every entry of `parent` that points at `child`.
    ///
    /// Returns the number of entries dropped.
    pub fn drop_child(&mut self, parent: NodeId, child: NodeId) -> usize {
        let Some(internal) = self
            .nodes
            .get_mut(&parent)
            .and_then(Node::as_internal_mut)
        else {
            return 0;
        };
        let dropped = internal.remove_child(child);
        if dropped > 0 {
            if let Some(parents) = self.referrers.get_mut(&child) {
                parents.remove(&parent);
                if parents.is_empty() {
                    self.referrers.remove(&child);
                }
            }
            self.dirty.insert(parent);
        }
        dropped
    }

    /// Remove `node_id` and every descendant no other node still points at,
    /// and drop the references its parents hold to it.
    ///
    /// Returns the removed ids and the parents that lost an entry.
    pub fn excise_subtree(&mut self, node_id: NodeId, lsn: Lsn) -> (Vec<NodeId>, Vec<NodeId>) {
        let parents = self.referrers(node_id);
        for parent in &parents {
            self.drop_child(*parent, node_id);
        }

        let mut removed = Vec::new();
        let mut pending = vec![node_id];
        while let Some(id) = pending.pop() {
            let Some(node) = self.remove(id, lsn) else {
                continue;
            };
            removed.push(id);
            for child in node.children() {
                if self.referrers.get(&child).is_none_or(BTreeSet::is_empty) {
                    pending.push(child);
                }
            }
        }
        (removed, parents)
    }

    /// Write dirty nodes and delete removed ones, then sync.
    pub fn flush<S: Storage>(&mut self, storage: &mut S) -> Result<FlushStats, StorageError> {
        let mut stats = FlushStats::default();

        for node_id in &self.dirty {
            if let Some(node) = self.nodes.get(node_id) {
                storage.write_node(node)?;
                stats.nodes_written += 1;
            }
        }
        for node_id in &self.removed {
            storage.delete_node(*node_id)?;
            stats.nodes_deleted += 1;
        }
        storage.sync()?;

        self.dirty.clear();
        self.removed.clear();
        Ok(stats)
    }

    /// True if a change has not been flushed yet.
    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        !self.dirty.is_empty() || !self.removed.is_empty()
    }

    #[must_use]
    pub fn is_dirty(&self, node_id: NodeId) -> bool {
        self.dirty.contains(&node_id)
    }

    fn link(&mut self, node: &Node) {
        for child in node.children() {
            self.referrers.entry(child).or_default().insert(node.id());
        }
    }

    fn unlink(&mut self, node: &Node) {
        for child in node.children() {
            if let Some(parents) = self.referrers.get_mut(&child) {
                parents.remove(&node.id());
                if parents.is_empty() {
                    self.referrers.remove(&child);
                }
            }
        }
    }
}
