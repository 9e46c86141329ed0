//! Simulated in-memory storage for deterministic testing.
//!
//! This module provides an in-memory implementation of the `Storage` trait
//! that separates what has been written from what is durable, so tests can
//! crash it at any point. It supports fault injection at various levels:
//! - Node read/write errors
//! - Byte-level corruption of node pages (bit flips)
//! - Sync failures
//! - A hard stop after a fixed number of node writes
//! - Direct damage to the log bytes

// Simulation code legitimately needs cloning for test data
#![allow(clippy::disallowed_methods)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::btree::{Node, NodeError, NodeId};
use crate::storage::io::{Storage, StorageError};
use crate::storage::page::{PAGE_SIZE, Page};
use crate::storage::superblock::Superblock;

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a node read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a node write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
    /// Probability of page corruption on read (0.0 - 1.0).
    pub corruption_rate: f64,
    /// Fail every node write after this many have succeeded.
    pub fail_after_node_writes: Option<u64>,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }

    /// Create a fault config with high fault rates (for extreme testing).
    #[must_use]
    pub const fn high_faults() -> Self {
        Self {
            read_error_rate: 0.05,
            write_error_rate: 0.05,
            sync_error_rate: 0.05,
            corruption_rate: 0.05,
            fail_after_node_writes: None,
        }
    }

    /// Succeed for `writes` node writes, then fail every later one.
    #[must_use]
    pub fn crash_after_node_writes(writes: u64) -> Self {
        Self {
            fail_after_node_writes: Some(writes),
            ..Self::default()
        }
    }
}

/// In-memory storage implementation for deterministic testing.
///
/// Node writes and superblock writes are staged until `sync`; log appends
/// are durable once `log_sync` runs. [`SimulatedStorage::crash`] throws away
/// everything that was not made durable.
///
/// # Thread Safety
///
/// This implementation is not thread-safe. Simulations run everything in a
/// single thread.
pub struct SimulatedStorage {
    /// Durable node pages.
    pages: BTreeMap<NodeId, Page>,
    /// Writes since the last sync. `None` marks a delete.
    staged: BTreeMap<NodeId, Option<Page>>,

    /// Working superblock.
    superblock: Superblock,
    /// Superblock written but not yet synced.
    staged_superblock: Option<Superblock>,
    /// Superblock as of the last sync.
    durable_superblock: Superblock,

    /// Log bytes, including the unsynced tail.
    log: Cursor<Vec<u8>>,
    /// Log length as of the last `log_sync`.
    durable_log_len: usize,

    /// Fault injection configuration.
    fault_config: FaultConfig,
    /// Random number generator for fault injection.
    rng: StdRng,

    /// Statistics for tracking.
    stats: SimulatedStorageStats,
}

/// Statistics about simulated storage operations.
#[derive(Debug, Default, Clone)]
pub struct SimulatedStorageStats {
    /// Number of node reads.
    pub reads: u64,
    /// Number of successful node writes.
    pub writes: u64,
    /// Number of node deletes.
    pub deletes: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of log syncs.
    pub log_syncs: u64,
    /// Number of crashes.
    pub crashes: u64,
    /// Number of injected read errors.
    pub injected_read_errors: u64,
    /// Number of injected write errors.
    pub injected_write_errors: u64,
    /// Number of injected sync errors.
    pub injected_sync_errors: u64,
    /// Number of corrupted pages returned.
    pub corrupted_reads: u64,
}

impl SimulatedStorage {
    /// Create a new simulated storage with the given seed.
    ///
    /// The seed ensures deterministic behavior - the same seed will
    /// produce the same sequence of faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, FaultConfig::default())
    }

    /// Create a new simulated storage with custom fault configuration.
    #[must_use]
    pub fn with_config(seed: u64, fault_config: FaultConfig) -> Self {
        let superblock = Superblock::new();
        Self {
            pages: BTreeMap::new(),
            staged: BTreeMap::new(),
            superblock,
            staged_superblock: None,
            durable_superblock: superblock,
            log: Cursor::new(Vec::new()),
            durable_log_len: 0,
            fault_config,
            rng: StdRng::seed_from_u64(seed),
            stats: SimulatedStorageStats::default(),
        }
    }

    /// Get the current statistics.
    #[must_use]
    pub const fn stats(&self) -> &SimulatedStorageStats {
        &self.stats
    }

    /// Update the fault configuration.
    pub fn set_fault_config(&mut self, config: FaultConfig) {
        self.fault_config = config;
    }

    /// Lose everything that was not synced, as a power failure would.
    ///
    /// The stats survive so tests can inspect what happened before.
    pub fn crash(&mut self) {
        self.stats.crashes += 1;
        self.staged.clear();
        self.staged_superblock = None;
        self.superblock = self.durable_superblock;
        self.log.get_mut().truncate(self.durable_log_len);
        self.log.set_position(0);
    }

    /// Current log length in bytes, synced or not.
    #[must_use]
    pub fn log_len(&self) -> u64 {
        self.log.get_ref().len() as u64
    }

    /// Flip every bit of the log byte at `offset`.
    ///
    /// Returns false when `offset` is past the end of the log.
    pub fn corrupt_log_byte(&mut self, offset: u64) -> bool {
        let Ok(offset) = usize::try_from(offset) else {
            return false;
        };
        match self.log.get_mut().get_mut(offset) {
            Some(byte) => {
                *byte = !*byte;
                true
            }
            None => false,
        }
    }

    /// Cut the log down to `len` bytes, durably.
    pub fn truncate_log(&mut self, len: u64) {
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        self.log.get_mut().truncate(len);
        self.durable_log_len = self.durable_log_len.min(self.log.get_ref().len());
        self.log.set_position(0);
    }

    /// Ids of durable nodes, ignoring staged writes.
    #[must_use]
    pub fn durable_node_ids(&self) -> Vec<NodeId> {
        self.pages.keys().copied().collect()
    }

    /// Check if a fault should be injected based on the given rate.
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }

    /// Corrupt a page by flipping random bits.
    fn corrupt_page(&mut self, page: &mut Page) {
        // Flip 1-8 random bits
        let num_flips = self.rng.random_range(1..=8);
        for _ in 0..num_flips {
            let byte_offset = self.rng.random_range(0..PAGE_SIZE);
            let bit = self.rng.random_range(0..8u8);
            let bytes = page.as_bytes_mut();
            bytes[byte_offset] ^= 1 << bit;
        }
    }

    /// Latest page for `node_id`, staged or durable.
    fn current_page(&self, node_id: NodeId) -> Option<&Page> {
        match self.staged.get(&node_id) {
            Some(staged) => staged.as_ref(),
            None => self.pages.get(&node_id),
        }
    }
}

impl Storage for SimulatedStorage {
    type Log = Cursor<Vec<u8>>;

    fn read_node(&mut self, node_id: NodeId) -> Result<Option<Node>, StorageError> {
        self.stats.reads += 1;

        // Check for injected read error
        if self.should_inject_fault(self.fault_config.read_error_rate) {
            self.stats.injected_read_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated read error".to_string(),
            ));
        }

        let Some(mut page) = self.current_page(node_id).cloned() else {
            return Ok(None);
        };

        // Check for corruption
        if self.should_inject_fault(self.fault_config.corruption_rate) {
            self.stats.corrupted_reads += 1;
            self.corrupt_page(&mut page);
        }

        let node = Node::from_page(&page).map_err(|source| StorageError::Node { node_id, source })?;
        match node {
            Some(node) if node.id() != node_id => Err(StorageError::Node {
                node_id,
                source: NodeError::InvalidId,
            }),
            other => Ok(other),
        }
    }

    fn node_ids(&mut self) -> Result<Vec<NodeId>, StorageError> {
        let mut ids: BTreeSet<NodeId> = self.pages.keys().copied().collect();
        for (node_id, staged) in &self.staged {
            if staged.is_some() {
                ids.insert(*node_id);
            } else {
                ids.remove(node_id);
            }
        }
        Ok(ids.into_iter().collect())
    }

    fn write_node(&mut self, node: &Node) -> Result<(), StorageError> {
        if let Some(limit) = self.fault_config.fail_after_node_writes
            && self.stats.writes >= limit
        {
            self.stats.injected_write_errors += 1;
            return Err(StorageError::InjectedFault(format!(
                "simulated crash after {limit} node writes"
            )));
        }

        // Check for injected write error
        if self.should_inject_fault(self.fault_config.write_error_rate) {
            self.stats.injected_write_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated write error".to_string(),
            ));
        }

        let mut page = Page::new();
        node.write_to_page(&mut page)
            .map_err(|source| StorageError::Node {
                node_id: node.id(),
                source,
            })?;
        self.staged.insert(node.id(), Some(page));
        self.stats.writes += 1;
        Ok(())
    }

    fn delete_node(&mut self, node_id: NodeId) -> Result<(), StorageError> {
        self.stats.deletes += 1;
        self.staged.insert(node_id, None);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.stats.syncs += 1;

        // Check for injected sync error
        if self.should_inject_fault(self.fault_config.sync_error_rate) {
            self.stats.injected_sync_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated sync error".to_string(),
            ));
        }

        for (node_id, staged) in std::mem::take(&mut self.staged) {
            match staged {
                Some(page) => {
                    self.pages.insert(node_id, page);
                }
                None => {
                    self.pages.remove(&node_id);
                }
            }
        }
        if let Some(superblock) = self.staged_superblock.take() {
            self.durable_superblock = superblock;
        }
        Ok(())
    }

    fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    fn superblock_mut(&mut self) -> &mut Superblock {
        &mut self.superblock
    }

    fn write_superblock(&mut self) -> Result<(), StorageError> {
        // Round-trip through the page format like a real write would.
        let superblock = Superblock::from_page(&self.superblock.to_page())?;
        self.staged_superblock = Some(superblock);
        Ok(())
    }

    fn log(&mut self) -> &mut Self::Log {
        &mut self.log
    }

    fn log_sync(&mut self) -> Result<(), StorageError> {
        self.stats.log_syncs += 1;

        if self.should_inject_fault(self.fault_config.sync_error_rate) {
            self.stats.injected_sync_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated log sync error".to_string(),
            ));
        }

        self.durable_log_len = self.log.get_ref().len();
        Ok(())
    }
}
