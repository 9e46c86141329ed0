//! B-tree node model.
//!
//! Recovery never searches the tree. It only needs to know what a node is:
//! its identity, its level, and which nodes it points to. This module defines
//! the node types and the image codec shared by log records and node pages.

mod node;

pub use node::{
    ChildRef, InternalNode, Key, LEAF_LEVEL, LeafEntry, LeafNode, Level, MAX_IMAGE_SIZE,
    MAX_KEY_SIZE, NO_NODE, Node, NodeError, NodeId, NodeType, decode_node, encode_node,
};
