//! Undo/redo application of single log records.
//!
//! Every record is applied as "node X now is image I" (or "node X is gone"),
//! never as a delta, so applying the same record twice leaves the graph as
//! the first application did. That is what lets a crashed recovery simply
//! run again.
//!
//! Besides changing the graph, the applier feeds the level-ordered node map:
//! a node is registered when it is created, moves to another level, or gets
//! a different child set. When a node is deleted or moves level, the nodes
//! pointing at it are registered too, because their child references need
//! another look.

use tracing::trace;

use crate::storage::btree::{Level, Node, NodeError, NodeId, decode_node};
use crate::storage::graph::NodeGraph;
use crate::storage::level_map::LevelOrderedNodeMap;
use crate::storage::wal::{LogRecord, LogRecordPayload, Lsn};

/// Result of applying one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The graph changed.
    Applied,
    /// The graph already held the target state.
    Unchanged,
    /// The record does not change nodes.
    Skipped,
}

/// Applies records to a node graph, registering touched nodes by level.
pub struct Applier<'a> {
    graph: &'a mut NodeGraph,
    map: &'a mut LevelOrderedNodeMap,
}

impl<'a> Applier<'a> {
    pub const fn new(graph: &'a mut NodeGraph, map: &'a mut LevelOrderedNodeMap) -> Self {
        Self { graph, map }
    }

    /// Re-execute a committed or non-transactional change.
    pub fn apply_redo(&mut self, record: &LogRecord) -> Result<ApplyOutcome, ApplyError> {
        let outcome = match &record.payload {
            LogRecordPayload::NodeWrite {
                node_id,
                level,
                image,
                ..
            } => self.set_node(record.lsn, *node_id, *level, Some(image))?,
            LogRecordPayload::NodeDelete { node_id, level, .. } => {
                self.set_node(record.lsn, *node_id, *level, None)?
            }
            _ => ApplyOutcome::Skipped,
        };
        trace!(lsn = record.lsn, ?outcome, "Redo");
        Ok(outcome)
    }

    /// Reverse a change made by an aborted or unfinished transaction.
    pub fn apply_undo(&mut self, record: &LogRecord) -> Result<ApplyOutcome, ApplyError> {
        let outcome = match &record.payload {
            LogRecordPayload::NodeWrite {
                node_id,
                level,
                prior,
                ..
            } => {
                // No prior image: the write created the node.
                let prior_level = match prior {
                    Some(image) => image_level(image).unwrap_or(*level),
                    None => *level,
                };
                self.set_node(record.lsn, *node_id, prior_level, prior.as_deref())?
            }
            LogRecordPayload::NodeDelete {
                node_id,
                level,
                prior,
            } => {
                let Some(image) = prior else {
                    return Err(ApplyError::MissingPrior {
                        lsn: record.lsn,
                        node_id: *node_id,
                    });
                };
                self.set_node(record.lsn, *node_id, *level, Some(image))?
            }
            _ => ApplyOutcome::Skipped,
        };
        trace!(lsn = record.lsn, ?outcome, "Undo");
        Ok(outcome)
    }

    /// Remove `node_id` and the descendants nothing else points at.
    ///
    /// Parents that lost an entry are queued for revalidation. Returns the
    /// removed ids.
    pub fn excise(&mut self, node_id: NodeId, lsn: Lsn) -> Vec<NodeId> {
        let (removed, parents) = self.graph.excise_subtree(node_id, lsn);
        for parent in parents {
            if let Some(level) = self.graph.level_of(parent) {
                self.map.register(parent, level);
            }
        }
        removed
    }

    /// Make `node_id` hold `image`, or remove it when `image` is `None`.
    fn set_node(
        &mut self,
        lsn: Lsn,
        node_id: NodeId,
        level: Level,
        image: Option<&[u8]>,
    ) -> Result<ApplyOutcome, ApplyError> {
        let Some(image) = image else {
            return Ok(self.remove_node(lsn, node_id));
        };

        let node = decode_node(image).map_err(|source| ApplyError::Decode {
            lsn,
            node_id,
            source,
        })?;
        if node.id() != node_id || node.level() != level {
            return Err(ApplyError::HeaderMismatch {
                lsn,
                node_id,
                level,
                image_id: node.id(),
                image_level: node.level(),
            });
        }

        if self.graph.get(node_id) == Some(&node) {
            return Ok(ApplyOutcome::Unchanged);
        }

        let children = node.children();
        match self.graph.put(node, lsn) {
            None => {
                self.map.register(node_id, level);
            }
            Some(previous) if previous.level() != level => {
                self.map.register(node_id, level);
                self.register_referrers(node_id);
            }
            Some(previous) if previous.children() != children => {
                self.map.register(node_id, level);
            }
            Some(_) => {}
        }
        Ok(ApplyOutcome::Applied)
    }

    fn remove_node(&mut self, lsn: Lsn, node_id: NodeId) -> ApplyOutcome {
        if self.graph.remove(node_id, lsn).is_none() {
            return ApplyOutcome::Unchanged;
        }
        self.register_referrers(node_id);
        ApplyOutcome::Applied
    }

    /// Queue every node pointing at `node_id` for revalidation.
    fn register_referrers(&mut self, node_id: NodeId) {
        for parent in self.graph.referrers(node_id) {
            if let Some(level) = self.graph.level_of(parent) {
                self.map.register(parent, level);
            }
        }
    }
}

/// Level stored in a node image, if the header is readable.
fn image_level(image: &[u8]) -> Option<Level> {
    decode_node(image).ok().as_ref().map(Node::level)
}

/// A record could not be applied.
#[derive(Debug)]
pub enum ApplyError {
    /// The record's image does not decode.
    Decode {
        lsn: Lsn,
        node_id: NodeId,
        source: NodeError,
    },
    /// The image names a different node or level than the record header.
    HeaderMismatch {
        lsn: Lsn,
        node_id: NodeId,
        level: Level,
        image_id: NodeId,
        image_level: Level,
    },
    /// A delete cannot be undone without the deleted image.
    MissingPrior { lsn: Lsn, node_id: NodeId },
}

impl ApplyError {
    #[must_use]
    pub const fn lsn(&self) -> Lsn {
        match self {
            Self::Decode { lsn, .. }
            | Self::HeaderMismatch { lsn, .. }
            | Self::MissingPrior { lsn, .. } => *lsn,
        }
    }

    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        match self {
            Self::Decode { node_id, .. }
            | Self::HeaderMismatch { node_id, .. }
            | Self::MissingPrior { node_id, .. } => *node_id,
        }
    }
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode {
                lsn,
                node_id,
                source,
            } => write!(f, "record {lsn}: image of node {node_id} is invalid: {source}"),
            Self::HeaderMismatch {
                lsn,
                node_id,
                level,
                image_id,
                image_level,
            } => write!(
                f,
                "record {lsn}: header names node {node_id} at level {level}, \
                 image holds node {image_id} at level {image_level}"
            ),
            Self::MissingPrior { lsn, node_id } => {
                write!(f, "record {lsn}: delete of node {node_id} has no prior image")
            }
        }
    }
}

impl std::error::Error for ApplyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode { source, .. } => Some(source),
            Self::HeaderMismatch { .. } | Self::MissingPrior { .. } => None,
        }
    }
}
