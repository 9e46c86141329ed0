//! Level-ordered node map.
//!
//! Records which nodes a recovery run touched, bucketed by tree level. The
//! reconstruction pass drains it from level 0 upward, so every child is
//! settled before the parent that points at it is validated. A tree's level
//! is a valid topological key, which makes this a replacement for a
//! dependency graph sort.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::storage::btree::{Level, NodeId};

/// Map from tree level to the set of node ids changed at that level.
///
/// A node id appears under at most one level. Registering it again under a
/// different level moves it, so the latest registration wins.
#[derive(Debug, Default)]
pub struct LevelOrderedNodeMap {
    by_level: BTreeMap<Level, BTreeSet<NodeId>>,
    level_of: HashMap<NodeId, Level>,
}

impl LevelOrderedNodeMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node_id` lives at `level`.
    ///
    /// Returns the level it was previously registered under, if that differs.
    pub fn register(&mut self, node_id: NodeId, level: Level) -> Option<Level> {
        let previous = self.level_of.insert(node_id, level);
        match previous {
            Some(old) if old == level => return None,
            Some(old) => {
                if let Some(set) = self.by_level.get_mut(&old) {
                    set.remove(&node_id);
                    if set.is_empty() {
                        self.by_level.remove(&old);
                    }
                }
            }
            None => {}
        }
        self.by_level.entry(level).or_default().insert(node_id);
        previous
    }

    /// Level `node_id` is registered under.
    #[must_use]
    pub fn level_of(&self, node_id: NodeId) -> Option<Level> {
        self.level_of.get(&node_id).copied()
    }

    #[must_use]
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.level_of.contains_key(&node_id)
    }

    /// Number of registered nodes across all levels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.level_of.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.level_of.is_empty()
    }

    /// Borrowing view of `(level, nodes)` in strictly ascending level order.
    pub fn iter(&self) -> impl Iterator<Item = (Level, &BTreeSet<NodeId>)> {
        self.by_level.iter().map(|(level, nodes)| (*level, nodes))
    }

    /// Consume the map, yielding `(level, nodes)` in strictly ascending
    /// level order.
    #[must_use]
    pub fn into_ascending_levels(self) -> AscendingLevels {
        AscendingLevels {
            inner: self.by_level.into_iter(),
        }
    }
}

impl IntoIterator for LevelOrderedNodeMap {
    type Item = (Level, BTreeSet<NodeId>);
    type IntoIter = AscendingLevels;

    fn into_iter(self) -> Self::IntoIter {
        self.into_ascending_levels()
    }
}

/// Single-pass ascending drain of a [`LevelOrderedNodeMap`].
pub struct AscendingLevels {
    inner: std::collections::btree_map::IntoIter<Level, BTreeSet<NodeId>>,
}

impl Iterator for AscendingLevels {
    type Item = (Level, BTreeSet<NodeId>);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
