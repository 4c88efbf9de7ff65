//! Immutable node records and the sibling ordering rule.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use crate::id::NodeId;

/// One inserted character, exactly as it was created.
///
/// The record never changes after creation. The buffer keeps the mutable
/// parts (current parent, tombstone flag) in its own index, so a node
/// received over the wire and the local copy of the same edit are
/// interchangeable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrdtNode {
    id: NodeId,
    /// Node this character was typed after (ROOT for the document start).
    origin: NodeId,
    counter: u32,
    value: char,
}

impl CrdtNode {
    pub fn new(id: NodeId, origin: NodeId, counter: u32, value: char) -> Self {
        Self {
            id,
            origin,
            counter,
            value,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn origin(&self) -> &NodeId {
        &self.origin
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn value(&self) -> char {
        self.value
    }

    pub fn site(&self) -> &str {
        &self.id.site
    }

    pub fn clock(&self) -> u64 {
        self.id.clock
    }

    /// Ordering key among the children of `origin`.
    pub fn sibling_key(&self) -> SiblingKey {
        SiblingKey {
            counter: self.counter,
            site: self.id.site.clone(),
            clock: self.id.clock,
        }
    }
}

impl PartialEq for CrdtNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CrdtNode {}

impl Hash for CrdtNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Position of a node among the children of one parent.
///
/// Higher counters come first (the most recent insert at a position sits
/// closest to its parent), then sites ascending. The final clock
/// comparison is descending: it only separates a node re-created by
/// undo/redo from the tombstone it replaces, and the new node must come
/// first so that it lands before the tombstone's relocated children.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiblingKey {
    pub counter: u32,
    pub site: String,
    pub clock: u64,
}

impl Ord for SiblingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .counter
            .cmp(&self.counter)
            .then_with(|| self.site.cmp(&other.site))
            .then_with(|| other.clock.cmp(&self.clock))
    }
}

impl PartialOrd for SiblingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sort key of a node under its *current* parent.
///
/// A freshly integrated node has a single-element key. Deleting a node
/// prefixes its children's keys with its own key as they move up a level,
/// so they keep occupying the slot of the deleted subtree. Keys compare
/// lexicographically and a prefix sorts before its extensions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Placement(Vec<SiblingKey>);

impl Placement {
    pub(crate) fn single(key: SiblingKey) -> Self {
        Self(vec![key])
    }

    /// Key of a child moving up from under `self`'s owner.
    pub(crate) fn nest(&self, child: &Placement) -> Self {
        let mut keys = Vec::with_capacity(self.0.len() + child.0.len());
        keys.extend(self.0.iter().cloned());
        keys.extend(child.0.iter().cloned());
        Self(keys)
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.0.len()
    }
}
