//! B-tree node types and serialization.
//!
//! Every node has a stable identity and a level. Level 0 is the leaf level:
//! leaves store key-value entries. Nodes above it are internal nodes that
//! store `(boundary key, child id)` pairs, and every child of a level-k node
//! is a node of level k-1.
//!
//! # Node Image Format
//!
//! The same image is carried inside log records and stored in node pages:
//! ```text
//! +---------+---------------------------------------------+
//! | 0       | node_type (1 byte, 0 = internal, 1 = leaf)  |
//! | 1-8     | node id (8 bytes)                           |
//! | 9-12    | level (4 bytes, always 0 for leaves)        |
//! | 13-16   | entry count (4 bytes)                       |
//! | 17-N    | entries                                     |
//! +---------+---------------------------------------------+
//! internal entry: key_len (2) | key | child id (8)
//! leaf entry:     key_len (2) | key | value_len (4) | value
//! ```

// Entry counts and key lengths are bounded by MAX_IMAGE_SIZE.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{Page, PageError, PageHeader, PageType};

/// Stable identity of a node. Also the page number that stores it.
pub type NodeId = u64;

/// Distance from the leaf layer.
pub type Level = u32;

/// A variable-length key.
pub type Key = Vec<u8>;

/// Node id 0 never names a node; page 0 is the superblock.
pub const NO_NODE: NodeId = 0;

/// Level of every leaf.
pub const LEAF_LEVEL: Level = 0;

/// Maximum key length (stored as u16).
pub const MAX_KEY_SIZE: usize = 1024;

/// Fixed image header size: type (1) + id (8) + level (4) + count (4).
const IMAGE_HEADER_SIZE: usize = 17;

/// Largest image that fits into one node page.
pub const MAX_IMAGE_SIZE: usize = PageHeader::CAPACITY;

/// Node type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    Internal = 0,
    Leaf = 1,
}

impl TryFrom<u8> for NodeType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Internal),
            1 => Ok(Self::Leaf),
            _ => Err(value),
        }
    }
}

/// A `(boundary key, child)` pair of an internal node.
///
/// The child holds keys >= `key` and < the next entry's key. The first
/// entry's key is conventionally empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRef {
    pub key: Key,
    pub child: NodeId,
}

impl ChildRef {
    #[must_use]
    pub fn new(key: impl Into<Key>, child: NodeId) -> Self {
        Self {
            key: key.into(),
            child,
        }
    }
}

/// An internal (non-leaf) B-tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode {
    pub id: NodeId,
    /// Always >= 1.
    pub level: Level,
    /// Child references in key order.
    pub entries: Vec<ChildRef>,
}

impl InternalNode {
    /// Create an internal node from its child references.
    #[must_use]
    pub const fn new(id: NodeId, level: Level, entries: Vec<ChildRef>) -> Self {
        Self { id, level, entries }
    }

    /// Iterate the child ids in key order.
    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.iter().map(|entry| entry.child)
    }

    /// Remove every entry pointing at `child`. Returns how many were removed.
    pub fn remove_child(&mut self, child: NodeId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.child != child);
        before - self.entries.len()
    }
}

/// A key-value entry in a leaf node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Key,
    pub value: Vec<u8>,
}

impl LeafEntry {
    #[must_use]
    pub fn new(key: impl Into<Key>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A leaf B-tree node. Always at level 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNode {
    pub id: NodeId,
    /// Entries in key order.
    pub entries: Vec<LeafEntry>,
}

impl LeafNode {
    #[must_use]
    pub const fn new(id: NodeId, entries: Vec<LeafEntry>) -> Self {
        Self { id, entries }
    }

    /// Look up the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.value.as_slice())
    }
}

/// A decoded node image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Internal(InternalNode),
    Leaf(LeafNode),
}

impl Node {
    #[must_use]
    pub const fn id(&self) -> NodeId {
        match self {
            Self::Internal(node) => node.id,
            Self::Leaf(node) => node.id,
        }
    }

    #[must_use]
    pub const fn level(&self) -> Level {
        match self {
            Self::Internal(node) => node.level,
            Self::Leaf(_) => LEAF_LEVEL,
        }
    }

    #[must_use]
    pub const fn node_type(&self) -> NodeType {
        match self {
            Self::Internal(_) => NodeType::Internal,
            Self::Leaf(_) => NodeType::Leaf,
        }
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    /// Child ids in key order. Empty for leaves.
    #[must_use]
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            Self::Internal(node) => node.children().collect(),
            Self::Leaf(_) => Vec::new(),
        }
    }

    #[must_use]
    pub const fn as_internal(&self) -> Option<&InternalNode> {
        match self {
            Self::Internal(node) => Some(node),
            Self::Leaf(_) => None,
        }
    }

    #[must_use]
    pub const fn as_leaf(&self) -> Option<&LeafNode> {
        match self {
            Self::Leaf(node) => Some(node),
            Self::Internal(_) => None,
        }
    }

    pub const fn as_internal_mut(&mut self) -> Option<&mut InternalNode> {
        match self {
            Self::Internal(node) => Some(node),
            Self::Leaf(_) => None,
        }
    }

    /// Serialize this node to its image bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, NodeError> {
        encode_node(self)
    }

    /// Deserialize a node from image bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NodeError> {
        decode_node(bytes)
    }

    /// Write this node into a page, sealing the page checksum.
    pub fn write_to_page(&self, page: &mut Page) -> Result<(), NodeError> {
        let image = encode_node(self)?;
        if image.len() > MAX_IMAGE_SIZE {
            return Err(NodeError::ImageTooLarge(image.len()));
        }

        let page_type = match self {
            Self::Internal(_) => PageType::Internal,
            Self::Leaf(_) => PageType::Leaf,
        };
        PageHeader::new(page_type, image.len() as u32).write_to(page);
        page.write_bytes(PageHeader::SIZE, &image);
        page.seal();
        Ok(())
    }

    /// Read a node from a page.
    ///
    /// Returns `Ok(None)` for free pages.
    pub fn from_page(page: &Page) -> Result<Option<Self>, NodeError> {
        let header = PageHeader::read_from(page)?;
        let expected_type = match header.page_type {
            PageType::Free => return Ok(None),
            PageType::Superblock => return Err(NodeError::WrongPageType(header.page_type)),
            PageType::Internal => NodeType::Internal,
            PageType::Leaf => NodeType::Leaf,
        };
        page.verify_checksum()?;

        let node = decode_node(page.payload(&header))?;
        if node.node_type() != expected_type {
            return Err(NodeError::WrongPageType(header.page_type));
        }
        Ok(Some(node))
    }
}

impl From<InternalNode> for Node {
    fn from(node: InternalNode) -> Self {
        Self::Internal(node)
    }
}

impl From<LeafNode> for Node {
    fn from(node: LeafNode) -> Self {
        Self::Leaf(node)
    }
}

/// Serialize a node to its image bytes.
///
/// Fails with [`NodeError::KeyTooLarge`] rather than truncating the stored
/// key length.
pub fn encode_node(node: &Node) -> Result<Vec<u8>, NodeError> {
    let mut bytes = Vec::with_capacity(IMAGE_HEADER_SIZE + 64);
    bytes.push(node.node_type() as u8);
    bytes.extend_from_slice(&node.id().to_le_bytes());
    bytes.extend_from_slice(&node.level().to_le_bytes());

    match node {
        Node::Internal(internal) => {
            bytes.extend_from_slice(&(internal.entries.len() as u32).to_le_bytes());
            for entry in &internal.entries {
                bytes.extend_from_slice(&key_len(&entry.key)?.to_le_bytes());
                bytes.extend_from_slice(&entry.key);
                bytes.extend_from_slice(&entry.child.to_le_bytes());
            }
        }
        Node::Leaf(leaf) => {
            bytes.extend_from_slice(&(leaf.entries.len() as u32).to_le_bytes());
            for entry in &leaf.entries {
                bytes.extend_from_slice(&key_len(&entry.key)?.to_le_bytes());
                bytes.extend_from_slice(&entry.key);
                bytes.extend_from_slice(&(entry.value.len() as u32).to_le_bytes());
                bytes.extend_from_slice(&entry.value);
            }
        }
    }

    Ok(bytes)
}

fn key_len(key: &[u8]) -> Result<u16, NodeError> {
    if key.len() > MAX_KEY_SIZE {
        return Err(NodeError::KeyTooLarge(key.len()));
    }
    Ok(key.len() as u16)
}

/// Deserialize a node image.
///
/// Rejects images whose level disagrees with their type, that reference
/// node 0, that reference themselves, or that carry trailing bytes.
pub fn decode_node(bytes: &[u8]) -> Result<Node, NodeError> {
    let mut reader = ImageReader::new(bytes);

    let node_type = NodeType::try_from(reader.u8()?).map_err(NodeError::InvalidNodeType)?;
    let id = reader.u64()?;
    if id == NO_NODE {
        return Err(NodeError::InvalidId);
    }
    let level = reader.u32()?;
    let count = reader.u32()? as usize;

    let node = match node_type {
        NodeType::Internal => {
            if level == LEAF_LEVEL {
                return Err(NodeError::LevelMismatch { node_type, level });
            }
            let mut entries = Vec::with_capacity(count.min(MAX_IMAGE_SIZE));
            for _ in 0..count {
                let key = reader.key()?;
                let child = reader.u64()?;
                if child == NO_NODE || child == id {
                    return Err(NodeError::InvalidChild { node: id, child });
                }
                entries.push(ChildRef { key, child });
            }
            Node::Internal(InternalNode { id, level, entries })
        }
        NodeType::Leaf => {
            if level != LEAF_LEVEL {
                return Err(NodeError::LevelMismatch { node_type, level });
            }
            let mut entries = Vec::with_capacity(count.min(MAX_IMAGE_SIZE));
            for _ in 0..count {
                let key = reader.key()?;
                let value_len = reader.u32()? as usize;
                let value = reader.take(value_len)?.to_vec();
                entries.push(LeafEntry { key, value });
            }
            Node::Leaf(LeafNode { id, entries })
        }
    };

    if reader.remaining() != 0 {
        return Err(NodeError::TrailingBytes(reader.remaining()));
    }
    Ok(node)
}

/// Bounds-checked little-endian reader over an image.
struct ImageReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ImageReader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    const fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], NodeError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(NodeError::Truncated)?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], NodeError> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn u8(&mut self) -> Result<u8, NodeError> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, NodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, NodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn key(&mut self) -> Result<Key, NodeError> {
        let len = u16::from_le_bytes(self.array()?) as usize;
        if len > MAX_KEY_SIZE {
            return Err(NodeError::KeyTooLarge(len));
        }
        Ok(self.take(len)?.to_vec())
    }
}

/// Errors that can occur when working with B-tree nodes.
#[derive(Debug)]
pub enum NodeError {
    /// Image ended before all declared fields were read.
    Truncated,
    /// Invalid node type byte.
    InvalidNodeType(u8),
    /// Node id 0 is reserved.
    InvalidId,
    /// Level does not match the node type.
    LevelMismatch { node_type: NodeType, level: Level },
    /// Child reference to node 0 or to the node itself.
    InvalidChild { node: NodeId, child: NodeId },
    /// Key longer than `MAX_KEY_SIZE`.
    KeyTooLarge(usize),
    /// Bytes left over after the last entry.
    TrailingBytes(usize),
    /// Image does not fit in a page.
    ImageTooLarge(usize),
    /// Page does not hold a node.
    WrongPageType(PageType),
    /// Page header or checksum error.
    Page(PageError),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "node image truncated"),
            Self::InvalidNodeType(t) => write!(f, "invalid node type: 0x{t:02x}"),
            Self::InvalidId => write!(f, "node id 0 is reserved"),
            Self::LevelMismatch { node_type, level } => {
                write!(f, "{node_type:?} node cannot have level {level}")
            }
            Self::InvalidChild { node, child } => {
                write!(f, "node {node} has invalid child reference {child}")
            }
            Self::KeyTooLarge(len) => {
                write!(f, "key too large: {len} bytes (max {MAX_KEY_SIZE})")
            }
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after node image"),
            Self::ImageTooLarge(len) => {
                write!(f, "node image too large: {len} bytes (max {MAX_IMAGE_SIZE})")
            }
            Self::WrongPageType(t) => write!(f, "page of type {t:?} does not hold a node"),
            Self::Page(e) => write!(f, "node page error: {e}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Page(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PageError> for NodeError {
    fn from(e: PageError) -> Self {
        Self::Page(e)
    }
}
