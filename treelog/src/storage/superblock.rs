//! Page 0 of the environment file.
//!
//! Records where the tree starts, how far the log has been recovered, and the
//! id high-water marks that keep new nodes and transactions from reusing ids.
//! The fields are covered by their own CRC so a torn write of page 0 is
//! detected on open instead of being trusted.

// PAGE_SIZE is a compile-time constant that fits in u32.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::btree::{NO_NODE, NodeId};
use crate::storage::page::{PAGE_SIZE, Page};
use crate::storage::wal::{Lsn, TxnId};

/// Magic number identifying a treelog environment file: "TREELOG1"
pub const MAGIC: [u8; 8] = *b"TREELOG1";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Page size as u32 for storage in superblock.
const PAGE_SIZE_U32: u32 = PAGE_SIZE as u32;

/// Stored in place of a checkpoint position when none was taken.
const NO_CHECKPOINT: u64 = u64::MAX;

/// Superblock field offsets.
mod offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 8;
    pub const PAGE_SIZE: usize = 12;
    pub const TOTAL_PAGE_COUNT: usize = 16;
    pub const ROOT_NODE: usize = 24;
    pub const LAST_CHECKPOINT_LSN: usize = 32;
    pub const RECOVERED_THROUGH: usize = 40;
    pub const NEXT_NODE_ID: usize = 48;
    pub const NEXT_TXN_ID: usize = 56;
    /// CRC32 over bytes `0..CHECKSUM`.
    pub const CHECKSUM: usize = 64;
    // 68-8191: reserved
}

/// The superblock contains all metadata about the environment file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Format version number.
    pub format_version: u32,
    /// Page size in bytes (should always be `PAGE_SIZE`).
    pub page_size: u32,
    /// Total number of pages in the file.
    pub total_page_count: u64,
    /// Root node of the tree (`NO_NODE` for an empty tree).
    pub root_node: NodeId,
    /// Position of the last checkpoint marker.
    pub last_checkpoint_lsn: Option<Lsn>,
    /// Log end at the last successful recovery.
    pub recovered_through: Lsn,
    /// Lowest node id never handed out.
    pub next_node_id: NodeId,
    /// Lowest transaction id never handed out.
    pub next_txn_id: TxnId,
}

impl Superblock {
    /// Create a new superblock with default values for a fresh environment.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            page_size: PAGE_SIZE_U32,
            total_page_count: 1,
            root_node: NO_NODE,
            last_checkpoint_lsn: None,
            recovered_through: 0,
            next_node_id: 1,
            next_txn_id: 1,
        }
    }

    /// Root node, if the tree is not empty.
    #[must_use]
    pub const fn root(&self) -> Option<NodeId> {
        if self.root_node == NO_NODE {
            None
        } else {
            Some(self.root_node)
        }
    }

    /// Serialize the superblock to a page.
    #[must_use]
    pub fn to_page(&self) -> Page {
        let mut page = Page::new();

        page.write_bytes(offsets::MAGIC, &MAGIC);
        page.write_u32(offsets::FORMAT_VERSION, self.format_version);
        page.write_u32(offsets::PAGE_SIZE, self.page_size);
        page.write_u64(offsets::TOTAL_PAGE_COUNT, self.total_page_count);
        page.write_u64(offsets::ROOT_NODE, self.root_node);
        page.write_u64(
            offsets::LAST_CHECKPOINT_LSN,
            self.last_checkpoint_lsn.unwrap_or(NO_CHECKPOINT),
        );
        page.write_u64(offsets::RECOVERED_THROUGH, self.recovered_through);
        page.write_u64(offsets::NEXT_NODE_ID, self.next_node_id);
        page.write_u64(offsets::NEXT_TXN_ID, self.next_txn_id);
        page.write_u32(offsets::CHECKSUM, checksum(&page));

        page
    }

    /// Deserialize a superblock from a page.
    pub fn from_page(page: &Page) -> Result<Self, SuperblockError> {
        // Validate magic number
        let mut magic = [0u8; 8];
        magic.copy_from_slice(page.read_bytes(offsets::MAGIC, 8));
        if magic != MAGIC {
            return Err(SuperblockError::InvalidMagic(magic));
        }

        let stored = page.read_u32(offsets::CHECKSUM);
        let computed = checksum(page);
        if stored != computed {
            return Err(SuperblockError::ChecksumMismatch { stored, computed });
        }

        let format_version = page.read_u32(offsets::FORMAT_VERSION);
        if format_version != FORMAT_VERSION {
            return Err(SuperblockError::UnsupportedVersion(format_version));
        }

        let page_size = page.read_u32(offsets::PAGE_SIZE);
        if page_size != PAGE_SIZE_U32 {
            return Err(SuperblockError::InvalidPageSize(page_size));
        }

        let last_checkpoint_lsn = page.read_u64(offsets::LAST_CHECKPOINT_LSN);

        Ok(Self {
            format_version,
            page_size,
            total_page_count: page.read_u64(offsets::TOTAL_PAGE_COUNT),
            root_node: page.read_u64(offsets::ROOT_NODE),
            last_checkpoint_lsn: (last_checkpoint_lsn != NO_CHECKPOINT)
                .then_some(last_checkpoint_lsn),
            recovered_through: page.read_u64(offsets::RECOVERED_THROUGH),
            next_node_id: page.read_u64(offsets::NEXT_NODE_ID),
            next_txn_id: page.read_u64(offsets::NEXT_TXN_ID),
        })
    }
}

impl Default for Superblock {
    fn default() -> Self {
        Self::new()
    }
}

fn checksum(page: &Page) -> u32 {
    crc32fast::hash(page.read_bytes(0, offsets::CHECKSUM))
}

/// Errors that can occur when reading a superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuperblockError {
    /// Page 0 is not a treelog superblock.
    InvalidMagic([u8; 8]),
    /// Torn or damaged superblock write.
    ChecksumMismatch { stored: u32, computed: u32 },
    UnsupportedVersion(u32),
    /// Written with a different page size.
    InvalidPageSize(u32),
}

impl std::fmt::Display for SuperblockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic(magic) => {
                write!(
                    f,
                    "invalid magic number: {:?}",
                    String::from_utf8_lossy(magic)
                )
            }
            Self::ChecksumMismatch { stored, computed } => write!(
                f,
                "superblock checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            ),
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::InvalidPageSize(s) => write!(f, "invalid page size: {s}"),
        }
    }
}

impl std::error::Error for SuperblockError {}
