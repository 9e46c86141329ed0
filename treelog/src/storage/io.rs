//! The durable state recovery reads and rewrites.
//!
//! [`Storage`] covers node pages, the superblock and the log stream.
//! [`EnvironmentFile`](crate::storage::EnvironmentFile) implements it over
//! real files; [`SimulatedStorage`](crate::simulation::SimulatedStorage)
//! keeps everything in memory, decides when writes become durable, and can
//! fail or crash on demand.

use std::io::{Read, Seek, Write};

use crate::storage::btree::{Node, NodeError, NodeId};
use crate::storage::superblock::{Superblock, SuperblockError};
use crate::storage::wal::{Wal, WalError};

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// Superblock error.
    Superblock(SuperblockError),
    /// A node page could not be decoded.
    Node { node_id: NodeId, source: NodeError },
    /// WAL error.
    Wal(WalError),
    /// Injected fault for simulation.
    InjectedFault(String),
    /// Corruption detected.
    Corruption(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Superblock(e) => write!(f, "superblock error: {e}"),
            Self::Node { node_id, source } => write!(f, "node {node_id}: {source}"),
            Self::Wal(e) => write!(f, "WAL error: {e}"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Superblock(e) => Some(e),
            Self::Node { source, .. } => Some(source),
            Self::Wal(e) => Some(e),
            Self::InjectedFault(_) | Self::Corruption(_) => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<SuperblockError> for StorageError {
    fn from(e: SuperblockError) -> Self {
        Self::Superblock(e)
    }
}

impl From<WalError> for StorageError {
    fn from(e: WalError) -> Self {
        Self::Wal(e)
    }
}

/// Durable state of one environment.
///
/// Node and superblock writes become durable at the next `sync`; log
/// appends at the next `log_sync`. Until then a crash may drop them.
/// `read_node` always sees the latest write, durable or not.
pub trait Storage {
    /// Byte stream holding the log.
    type Log: Read + Write + Seek;

    /// Read a node. Returns `None` if no node is stored under `node_id`.
    fn read_node(&mut self, node_id: NodeId) -> Result<Option<Node>, StorageError>;

    /// Ids of every stored node, in ascending order.
    fn node_ids(&mut self) -> Result<Vec<NodeId>, StorageError>;

    /// Store a node under its own id, replacing any previous image.
    ///
    /// The write may be buffered until `sync` is called.
    fn write_node(&mut self, node: &Node) -> Result<(), StorageError>;

    /// Remove a node. Removing a missing node is not an error.
    fn delete_node(&mut self, node_id: NodeId) -> Result<(), StorageError>;

    /// Make node and superblock writes durable.
    fn sync(&mut self) -> Result<(), StorageError>;

    /// In-memory copy of the superblock.
    fn superblock(&self) -> &Superblock;

    /// Changes stay in memory until `write_superblock`.
    fn superblock_mut(&mut self) -> &mut Superblock;

    /// Persist the in-memory superblock at the next `sync`.
    fn write_superblock(&mut self) -> Result<(), StorageError>;

    /// The raw log stream.
    fn log(&mut self) -> &mut Self::Log;

    /// Make log appends durable.
    fn log_sync(&mut self) -> Result<(), StorageError>;

    /// Open the log for reading and appending.
    fn wal(&mut self) -> Result<Wal<'_, Self::Log>, StorageError> {
        Ok(Wal::open(self.log())?)
    }

    /// Read every stored node.
    fn load_nodes(&mut self) -> Result<Vec<Node>, StorageError> {
        let mut nodes = Vec::new();
        for node_id in self.node_ids()? {
            if let Some(node) = self.read_node(node_id)? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }
}

impl<S: Storage + ?Sized> Storage for &mut S {
    type Log = S::Log;

    fn read_node(&mut self, node_id: NodeId) -> Result<Option<Node>, StorageError> {
        (**self).read_node(node_id)
    }

    fn node_ids(&mut self) -> Result<Vec<NodeId>, StorageError> {
        (**self).node_ids()
    }

    fn write_node(&mut self, node: &Node) -> Result<(), StorageError> {
        (**self).write_node(node)
    }

    fn delete_node(&mut self, node_id: NodeId) -> Result<(), StorageError> {
        (**self).delete_node(node_id)
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        (**self).sync()
    }

    fn superblock(&self) -> &Superblock {
        (**self).superblock()
    }

    fn superblock_mut(&mut self) -> &mut Superblock {
        (**self).superblock_mut()
    }

    fn write_superblock(&mut self) -> Result<(), StorageError> {
        (**self).write_superblock()
    }

    fn log(&mut self) -> &mut Self::Log {
        (**self).log()
    }

    fn log_sync(&mut self) -> Result<(), StorageError> {
        (**self).log_sync()
    }
}
