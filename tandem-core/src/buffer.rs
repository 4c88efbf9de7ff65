//! The replicated character tree.
//!
//! ```text
//!            ROOT
//!           /    \
//!          H      Y        children ordered by SiblingKey
//!          |      |        (counter desc, site asc, clock desc)
//!          i      o
//!
//!  pre-order, skipping tombstones  →  "HiYo"
//! ```
//!
//! Every mutation goes through `integrate` (new node) or `tombstone`
//! (delete). Both keep the per-node state and the sorted child lists in
//! step. A delete removes every comment whose anchored run contains the
//! deleted character at that moment.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::comment::Comment;
use crate::error::CrdtError;
use crate::history::{History, NodeRecord, Operation, DEFAULT_UNDO_DEPTH};
use crate::id::NodeId;
use crate::node::{CrdtNode, Placement};
use crate::splice::Splice;

/// Nodes and tombstones exchanged between replicas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Inserted nodes, every node after its origin when both are present.
    pub nodes: Vec<CrdtNode>,
    /// Ids of deleted nodes.
    pub tombstones: Vec<NodeId>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.tombstones.is_empty()
    }

    pub fn extend(&mut self, other: Delta) {
        self.nodes.extend(other.nodes);
        self.tombstones.extend(other.tombstones);
    }
}

/// What a merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Nodes integrated into the tree, including parked nodes released by
    /// the arrival of their origin.
    pub adopted: usize,
    /// Nodes still waiting for their origin after the merge.
    pub pending: usize,
    /// Nodes this merge tombstoned.
    pub tombstoned: Vec<NodeId>,
    /// Comments invalidated by those tombstones.
    pub removed_comments: Vec<String>,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.adopted > 0 || !self.tombstoned.is_empty()
    }
}

/// What a single delete did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub record: NodeRecord,
    /// Former children, now attached to the deleted node's parent.
    pub reparented: Vec<NodeId>,
    pub removed_comments: Vec<String>,
}

/// A local change, ready to broadcast.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalEdit {
    pub delta: Delta,
    pub removed_comments: Vec<String>,
}

impl LocalEdit {
    pub fn is_empty(&self) -> bool {
        self.delta.is_empty() && self.removed_comments.is_empty()
    }
}

#[derive(Debug, Clone)]
struct NodeState {
    node: CrdtNode,
    /// Current parent. Starts as the origin and moves up on deletions.
    parent: NodeId,
    placement: Placement,
    tombstone: bool,
}

/// One replica of the document.
///
/// Not synchronized internally: wrap it in a mutex when inserts and
/// merges can come from different tasks.
#[derive(Debug, Clone)]
pub struct CrdtBuffer {
    site: String,
    clock: u64,
    nodes: HashMap<NodeId, NodeState>,
    /// Current children of every node, in sibling order.
    children: HashMap<NodeId, Vec<NodeId>>,
    /// Sibling counters taken under each origin.
    counters: HashMap<NodeId, BTreeSet<u32>>,
    /// Integration order. A node always follows its origin.
    order: Vec<NodeId>,
    live: usize,
    /// Remote nodes whose origin has not arrived, keyed by that origin.
    pending: HashMap<NodeId, Vec<CrdtNode>>,
    pending_ids: HashSet<NodeId>,
    /// Remote tombstones that arrived before their node.
    early_tombstones: HashSet<NodeId>,
    comments: HashMap<String, Comment>,
    history: History,
}

impl CrdtBuffer {
    /// Create an empty replica for `site`.
    ///
    /// `site` must be non-empty and unique among the replicas of a
    /// document.
    pub fn new(site: impl Into<String>) -> Self {
        Self::with_undo_depth(site, DEFAULT_UNDO_DEPTH)
    }

    pub fn with_undo_depth(site: impl Into<String>, undo_depth: usize) -> Self {
        let site = site.into();
        debug_assert!(!site.is_empty(), "the empty site is reserved for ROOT");
        Self {
            site,
            clock: 0,
            nodes: HashMap::new(),
            children: HashMap::new(),
            counters: HashMap::new(),
            order: Vec::new(),
            live: 0,
            pending: HashMap::new(),
            pending_ids: HashSet::new(),
            early_tombstones: HashSet::new(),
            comments: HashMap::new(),
            history: History::new(undo_depth),
        }
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Switch to a new site id, e.g. after `clear` when the old
    /// identities may still live on other replicas.
    pub fn reset_site(&mut self, site: impl Into<String>) {
        self.site = site.into();
        self.clock = self
            .nodes
            .keys()
            .filter(|id| id.site == self.site)
            .map(|id| id.clock)
            .max()
            .unwrap_or(0);
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Total nodes held, tombstones included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.nodes.len() - self.live
    }

    /// Remote nodes parked until their origin arrives.
    pub fn pending_count(&self) -> usize {
        self.pending_ids.len()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &NodeId) -> Option<&CrdtNode> {
        self.nodes.get(id).map(|s| &s.node)
    }

    /// `None` when the node is unknown.
    pub fn is_tombstoned(&self, id: &NodeId) -> Option<bool> {
        self.nodes.get(id).map(|s| s.tombstone)
    }

    pub fn parent_of(&self, id: &NodeId) -> Option<&NodeId> {
        self.nodes.get(id).map(|s| &s.parent)
    }

    /// All integrated nodes in integration order.
    pub fn nodes(&self) -> impl Iterator<Item = &CrdtNode> + '_ {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id).map(|s| &s.node))
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    // ── Local edits ────────────────────────────────────────────────

    /// Insert `value` right after `parent` and record it for undo.
    ///
    /// The sibling counter is the smallest one not yet used under
    /// `parent`, which puts the new character directly after it. An
    /// unknown `parent` falls back to ROOT.
    pub fn insert(&mut self, value: char, parent: &NodeId) -> NodeId {
        let origin = self.resolve_parent(parent);
        let counter = self.next_counter(&origin);
        let id = self.create(value, origin.clone(), counter);
        self.history.push(Operation::Insert(NodeRecord {
            node_id: id.clone(),
            origin,
            counter,
            value,
        }));
        id
    }

    /// Insert with a caller-chosen counter. Not recorded for undo.
    ///
    /// Used to re-create a deleted character at its old sibling position;
    /// it still gets a fresh clock.
    pub fn insert_with_counter(&mut self, value: char, parent: &NodeId, counter: u32) -> NodeId {
        let origin = self.resolve_parent(parent);
        self.create(value, origin, counter)
    }

    /// Delete `(site, clock)` and record it for undo.
    ///
    /// Unknown or already deleted nodes are ignored: a remote delete can
    /// overtake the insert it refers to.
    pub fn delete(&mut self, site: &str, clock: u64) -> Option<DeleteOutcome> {
        let id = NodeId::new(site, clock);
        match self.tombstone(&id) {
            Some(outcome) => {
                self.history.push(Operation::Delete(outcome.record.clone()));
                Some(outcome)
            }
            None => {
                log::debug!("Ignoring delete of unknown or deleted node {id}");
                None
            }
        }
    }

    pub fn delete_id(&mut self, id: &NodeId) -> Option<DeleteOutcome> {
        self.delete(&id.site, id.clock)
    }

    /// Apply an editor splice: delete the replaced run, then insert the
    /// new characters as a chain after the character before `start`.
    pub fn apply_splice(&mut self, splice: &Splice, new_text: &str) -> LocalEdit {
        let mut edit = LocalEdit::default();

        let doomed = self.live_ids_in(splice.start, splice.old_end);
        let mut records = Vec::with_capacity(doomed.len());
        for id in doomed {
            if let Some(outcome) = self.tombstone(&id) {
                edit.delta.tombstones.push(id);
                edit.removed_comments.extend(outcome.removed_comments);
                records.push(outcome.record);
            }
        }
        match records.len() {
            0 => {}
            1 => {
                if let Some(record) = records.pop() {
                    self.history.push(Operation::Delete(record));
                }
            }
            _ => self.history.push(Operation::BulkDelete(records)),
        }

        let mut parent = match splice.start {
            0 => NodeId::root(),
            start => self.node_id_at(start - 1),
        };
        for value in splice.inserted(new_text) {
            let id = self.insert(value, &parent);
            if let Some(node) = self.node(&id) {
                edit.delta.nodes.push(node.clone());
            }
            parent = id;
        }

        edit
    }

    /// Diff the current text against `new_text` and apply the change.
    pub fn apply_text(&mut self, new_text: &str) -> Option<LocalEdit> {
        let splice = Splice::between(&self.document(), new_text)?;
        Some(self.apply_splice(&splice, new_text))
    }

    /// Replace the whole document with `text`, as fresh single-character
    /// inserts. Returns the new state. Not recorded for undo.
    pub fn replace_text(&mut self, text: &str) -> Delta {
        self.clear();
        let mut parent = NodeId::root();
        for value in text.chars() {
            parent = self.create(value, parent, 0);
        }
        self.snapshot()
    }

    /// Drop every node, comment and undo entry and reset the clock.
    pub fn clear(&mut self) {
        self.clock = 0;
        self.nodes.clear();
        self.children.clear();
        self.counters.clear();
        self.order.clear();
        self.live = 0;
        self.pending.clear();
        self.pending_ids.clear();
        self.early_tombstones.clear();
        self.comments.clear();
        self.history.clear();
    }

    // ── Undo / redo ────────────────────────────────────────────────

    pub fn undo(&mut self) -> Option<LocalEdit> {
        let op = self.history.pop_undo()?;
        let mut edit = LocalEdit::default();
        let inverse = match op {
            Operation::Insert(record) => {
                self.retract(&record, &mut edit);
                Operation::Insert(record)
            }
            Operation::Delete(record) => Operation::Delete(self.restore(record, &mut edit)),
            Operation::BulkDelete(records) => {
                // Later deletes may have been reparented onto earlier ones,
                // so bring them back newest first.
                let mut restored: Vec<NodeRecord> = records
                    .into_iter()
                    .rev()
                    .map(|record| self.restore(record, &mut edit))
                    .collect();
                restored.reverse();
                Operation::BulkDelete(restored)
            }
        };
        self.history.push_redo(inverse);
        Some(edit)
    }

    pub fn redo(&mut self) -> Option<LocalEdit> {
        let op = self.history.pop_redo()?;
        let mut edit = LocalEdit::default();
        let inverse = match op {
            Operation::Insert(record) => Operation::Insert(self.restore(record, &mut edit)),
            Operation::Delete(record) => {
                self.retract(&record, &mut edit);
                Operation::Delete(record)
            }
            Operation::BulkDelete(records) => {
                for record in &records {
                    self.retract(record, &mut edit);
                }
                Operation::BulkDelete(records)
            }
        };
        self.history.push_undo(inverse);
        Some(edit)
    }

    fn retract(&mut self, record: &NodeRecord, edit: &mut LocalEdit) {
        if let Some(outcome) = self.tombstone(&record.node_id) {
            edit.delta.tombstones.push(record.node_id.clone());
            edit.removed_comments.extend(outcome.removed_comments);
        }
    }

    fn restore(&mut self, record: NodeRecord, edit: &mut LocalEdit) -> NodeRecord {
        let node_id = self.insert_with_counter(record.value, &record.origin, record.counter);
        if let Some(node) = self.node(&node_id) {
            edit.delta.nodes.push(node.clone());
        }
        NodeRecord { node_id, ..record }
    }

    // ── Replication ────────────────────────────────────────────────

    /// Union a remote delta into this replica.
    ///
    /// Idempotent, commutative and associative. Tombstones only ever get
    /// added. Nodes whose origin is unknown are parked until it arrives;
    /// tombstones for unknown nodes are remembered and applied on arrival.
    pub fn merge(&mut self, delta: &Delta) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for node in &delta.nodes {
            let id = node.id();
            if id.site.is_empty() {
                log::warn!("Dropping node {id} with the reserved ROOT site");
                continue;
            }
            if self.nodes.contains_key(id) || self.pending_ids.contains(id) {
                continue;
            }
            let origin = node.origin();
            if origin.is_root() || self.nodes.contains_key(origin) {
                outcome.adopted += self.integrate(node.clone());
            } else {
                log::debug!("Parking {id} until its origin {origin} arrives");
                self.pending_ids.insert(id.clone());
                self.pending
                    .entry(origin.clone())
                    .or_default()
                    .push(node.clone());
            }
        }

        for id in &delta.tombstones {
            if self.nodes.contains_key(id) {
                if let Some(deleted) = self.tombstone(id) {
                    outcome.tombstoned.push(id.clone());
                    outcome.removed_comments.extend(deleted.removed_comments);
                }
            } else if !id.is_root() {
                self.early_tombstones.insert(id.clone());
            }
        }

        outcome.pending = self.pending_ids.len();
        outcome
    }

    /// Full state: every node (origins first) and every tombstone.
    pub fn snapshot(&self) -> Delta {
        let mut delta = Delta {
            nodes: self.nodes().cloned().collect(),
            tombstones: self
                .order
                .iter()
                .filter(|id| self.nodes.get(*id).is_some_and(|s| s.tombstone))
                .cloned()
                .collect(),
        };
        delta
            .nodes
            .extend(self.pending.values().flatten().cloned());
        delta
            .tombstones
            .extend(self.early_tombstones.iter().cloned());
        delta
    }

    /// Delta carrying the given local nodes and tombstones.
    pub fn delta_for(&self, inserted: &[NodeId], deleted: &[NodeId]) -> Delta {
        Delta {
            nodes: inserted
                .iter()
                .filter_map(|id| self.node(id).cloned())
                .collect(),
            tombstones: deleted.to_vec(),
        }
    }

    // ── Linear view ────────────────────────────────────────────────

    /// The visible text.
    ///
    /// Walks every node including tombstones, so the cost grows with the
    /// whole edit history rather than the document length.
    pub fn document(&self) -> String {
        let mut text = String::with_capacity(self.live);
        self.walk(|state| {
            if !state.tombstone {
                text.push(state.node.value());
            }
            true
        });
        text
    }

    /// Id of the visible character at `position`, or ROOT when out of
    /// range.
    pub fn node_id_at(&self, position: usize) -> NodeId {
        let mut seen = 0;
        let mut found = None;
        self.walk(|state| {
            if state.tombstone {
                return true;
            }
            if seen == position {
                found = Some(state.node.id().clone());
                return false;
            }
            seen += 1;
            true
        });
        found.unwrap_or_else(NodeId::root)
    }

    /// Visible offset of `id`, if it is live.
    pub fn position_of(&self, id: &NodeId) -> Option<usize> {
        let mut seen = 0;
        let mut found = None;
        self.walk(|state| {
            if state.tombstone {
                return true;
            }
            if state.node.id() == id {
                found = Some(seen);
                return false;
            }
            seen += 1;
            true
        });
        found
    }

    /// Ids of the visible characters, in document order.
    pub fn live_ids(&self) -> Vec<NodeId> {
        self.live_ids_in(0, usize::MAX)
    }

    fn live_ids_in(&self, start: usize, end: usize) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut seen = 0;
        if start >= end {
            return ids;
        }
        self.walk(|state| {
            if state.tombstone {
                return true;
            }
            if seen >= start {
                ids.push(state.node.id().clone());
            }
            seen += 1;
            seen < end
        });
        ids
    }

    /// Pre-order over the current tree, tombstones included. `visit`
    /// returns `false` to stop early.
    fn walk(&self, mut visit: impl FnMut(&NodeState) -> bool) {
        let mut stack: Vec<&NodeId> = Vec::new();
        if let Some(top) = self.children.get(&NodeId::root()) {
            stack.extend(top.iter().rev());
        }
        while let Some(id) = stack.pop() {
            let Some(state) = self.nodes.get(id) else {
                continue;
            };
            if !visit(state) {
                return;
            }
            if let Some(kids) = self.children.get(id) {
                stack.extend(kids.iter().rev());
            }
        }
    }

    /// Every parent chain ends at ROOT within `node_count` steps.
    pub fn check_acyclic(&self) -> bool {
        self.nodes.keys().all(|start| {
            let mut current = start;
            for _ in 0..=self.nodes.len() {
                match self.nodes.get(current) {
                    Some(state) if state.parent.is_root() => return true,
                    Some(state) => current = &state.parent,
                    None => return false,
                }
            }
            false
        })
    }

    // ── Comments ───────────────────────────────────────────────────

    /// Attach a comment to the visible range `start..end`.
    pub fn add_comment(
        &mut self,
        author_id: &str,
        author_color: &str,
        content: &str,
        start: usize,
        end: usize,
    ) -> Result<Comment, CrdtError> {
        let len = self.len();
        let invalid = CrdtError::InvalidCommentRange { start, end, len };
        if start >= end || end > len {
            return Err(invalid);
        }
        let covered = self.live_ids_in(start, end);
        let (Some(first), Some(last)) = (covered.first(), covered.last()) else {
            return Err(invalid);
        };
        let comment = Comment::new(
            author_id,
            author_color,
            content,
            first.clone(),
            last.clone(),
            start,
            end,
        );
        self.install_comment(comment.clone());
        Ok(comment)
    }

    /// Install a comment created by another participant.
    ///
    /// Returns `false` when it is already present or an anchor end is not
    /// visible here.
    pub fn add_existing_comment(&mut self, mut comment: Comment) -> bool {
        if self.comments.contains_key(comment.comment_id()) {
            return false;
        }
        let start = self.position_of(comment.start_node());
        let end = self.position_of(comment.end_node());
        match (start, end) {
            (Some(start), Some(end)) if start <= end => {
                comment.update_positions(start, end + 1);
                self.install_comment(comment);
                true
            }
            _ => {
                log::debug!(
                    "Ignoring comment {} with unresolvable anchors",
                    comment.comment_id()
                );
                false
            }
        }
    }

    pub fn remove_comment(&mut self, comment_id: &str) -> Result<Comment, CrdtError> {
        let comment = self
            .comments
            .remove(comment_id)
            .ok_or_else(|| CrdtError::UnknownComment(comment_id.to_string()))?;
        Ok(comment)
    }

    pub fn comment(&self, comment_id: &str) -> Option<&Comment> {
        self.comments.get(comment_id)
    }

    /// Comments ordered by start offset.
    pub fn comments(&self) -> Vec<&Comment> {
        let mut comments: Vec<&Comment> = self.comments.values().collect();
        comments.sort_by(|a, b| {
            a.start_offset()
                .cmp(&b.start_offset())
                .then_with(|| a.comment_id().cmp(b.comment_id()))
        });
        comments
    }

    /// Recompute every comment's offsets from its anchors.
    pub fn refresh_comment_positions(&mut self) {
        let positions: HashMap<NodeId, usize> = self
            .live_ids()
            .into_iter()
            .enumerate()
            .map(|(pos, id)| (id, pos))
            .collect();
        for comment in self.comments.values_mut() {
            let start = positions.get(comment.start_node());
            let end = positions.get(comment.end_node());
            if let (Some(&start), Some(&end)) = (start, end) {
                comment.update_positions(start, end + 1);
            }
        }
    }

    fn install_comment(&mut self, comment: Comment) {
        self.comments.insert(comment.comment_id().to_string(), comment);
    }

    /// Comments whose run, from start anchor to end anchor in the current
    /// document, contains the live node `id`.
    ///
    /// Resolved against the document at the time of the call, so a
    /// character inserted inside a run after the comment was installed is
    /// covered too.
    fn comments_covering(&self, id: &NodeId) -> Vec<String> {
        if self.comments.is_empty() {
            return Vec::new();
        }
        let positions: HashMap<NodeId, usize> = self
            .live_ids()
            .into_iter()
            .enumerate()
            .map(|(pos, id)| (id, pos))
            .collect();
        let Some(&pos) = positions.get(id) else {
            return Vec::new();
        };
        let mut covering: Vec<String> = self
            .comments
            .values()
            .filter(|comment| {
                match (
                    positions.get(comment.start_node()),
                    positions.get(comment.end_node()),
                ) {
                    (Some(&start), Some(&end)) => start <= pos && pos <= end,
                    _ => false,
                }
            })
            .map(|comment| comment.comment_id().to_string())
            .collect();
        covering.sort();
        covering
    }

    // ── Tree maintenance ───────────────────────────────────────────

    fn resolve_parent(&self, parent: &NodeId) -> NodeId {
        if parent.is_root() || self.nodes.contains_key(parent) {
            parent.clone()
        } else {
            log::warn!("Unknown parent {parent}, inserting at document start");
            NodeId::root()
        }
    }

    fn next_counter(&self, origin: &NodeId) -> u32 {
        match self.counters.get(origin) {
            Some(taken) => (0..).find(|c| !taken.contains(c)).unwrap_or(u32::MAX),
            None => 0,
        }
    }

    fn create(&mut self, value: char, origin: NodeId, counter: u32) -> NodeId {
        self.clock += 1;
        let id = NodeId::new(self.site.clone(), self.clock);
        self.integrate(CrdtNode::new(id.clone(), origin, counter, value));
        id
    }

    /// Integrate a node whose origin is present, then anything that was
    /// waiting on it. Returns how many nodes were integrated.
    fn integrate(&mut self, node: CrdtNode) -> usize {
        let mut ready = vec![node];
        let mut integrated = 0;
        while let Some(node) = ready.pop() {
            let id = node.id().clone();
            self.place(node);
            integrated += 1;

            if self.early_tombstones.remove(&id) {
                self.tombstone(&id);
            }
            if let Some(waiting) = self.pending.remove(&id) {
                for node in waiting {
                    self.pending_ids.remove(node.id());
                    ready.push(node);
                }
            }
        }
        integrated
    }

    fn place(&mut self, node: CrdtNode) {
        let key = Placement::single(node.sibling_key());
        // A deleted origin has already handed its children to its own
        // parent; follow them so arrival order does not matter.
        let (parent, placement) = match self.nodes.get(node.origin()) {
            Some(origin) if origin.tombstone => {
                (origin.parent.clone(), origin.placement.nest(&key))
            }
            _ => (node.origin().clone(), key),
        };

        self.counters
            .entry(node.origin().clone())
            .or_default()
            .insert(node.counter());
        if node.site() == self.site {
            self.clock = self.clock.max(node.clock());
        }

        let id = node.id().clone();
        self.nodes.insert(
            id.clone(),
            NodeState {
                node,
                parent,
                placement,
                tombstone: false,
            },
        );
        self.order.push(id.clone());
        self.live += 1;
        self.attach(id);
    }

    /// Insert `id` into its current parent's child list.
    fn attach(&mut self, id: NodeId) {
        let nodes = &self.nodes;
        let Some(state) = nodes.get(&id) else {
            return;
        };
        let siblings = self.children.entry(state.parent.clone()).or_default();
        let pos = siblings
            .binary_search_by(|sibling| {
                nodes
                    .get(sibling)
                    .map_or(Ordering::Less, |s| s.placement.cmp(&state.placement))
            })
            .unwrap_or_else(|pos| pos);
        siblings.insert(pos, id);
    }

    /// Mark a node deleted and hand its children to its parent.
    fn tombstone(&mut self, id: &NodeId) -> Option<DeleteOutcome> {
        if self.nodes.get(id).map_or(true, |state| state.tombstone) {
            return None;
        }
        let covering = self.comments_covering(id);
        let state = self.nodes.get_mut(id)?;
        state.tombstone = true;
        let parent = state.parent.clone();
        let placement = state.placement.clone();
        let record = NodeRecord {
            node_id: id.clone(),
            origin: state.node.origin().clone(),
            counter: state.node.counter(),
            value: state.node.value(),
        };
        self.live -= 1;

        let moved = self.children.remove(id).unwrap_or_default();
        for child in &moved {
            if let Some(child_state) = self.nodes.get_mut(child) {
                child_state.parent = parent.clone();
                child_state.placement = placement.nest(&child_state.placement);
            }
            self.attach(child.clone());
        }

        let removed_comments = covering
            .into_iter()
            .filter(|comment_id| self.remove_comment(comment_id).is_ok())
            .collect();
        Some(DeleteOutcome {
            record,
            reparented: moved,
            removed_comments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn type_text(buffer: &mut CrdtBuffer, parent: &NodeId, text: &str) -> Vec<NodeId> {
        let mut parent = parent.clone();
        let mut ids = Vec::new();
        for c in text.chars() {
            parent = buffer.insert(c, &parent);
            ids.push(parent.clone());
        }
        ids
    }

    fn exchange(a: &mut CrdtBuffer, b: &mut CrdtBuffer) {
        let sa = a.snapshot();
        let sb = b.snapshot();
        a.merge(&sb);
        b.merge(&sa);
    }

    #[test]
    fn test_insert_chain_builds_text() {
        let mut buffer = CrdtBuffer::new("site1");
        type_text(&mut buffer, &NodeId::root(), "Hello");
        assert_eq!(buffer.document(), "Hello");
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.clock(), 5);
    }

    #[test]
    fn test_insert_returns_sequential_ids() {
        let mut buffer = CrdtBuffer::new("s");
        let a = buffer.insert('a', &NodeId::root());
        let b = buffer.insert('b', &a);
        assert_eq!(a, NodeId::new("s", 1));
        assert_eq!(b, NodeId::new("s", 2));
    }

    #[test]
    fn test_insert_at_same_parent_lands_right_after_it() {
        let mut buffer = CrdtBuffer::new("s");
        let ids = type_text(&mut buffer, &NodeId::root(), "ac");
        // Typing 'b' after 'a' must land between 'a' and 'c'.
        buffer.insert('b', &ids[0]);
        assert_eq!(buffer.document(), "abc");
        assert_eq!(buffer.node(&NodeId::new("s", 3)).unwrap().counter(), 1);
    }

    #[test]
    fn test_counter_is_smallest_unused() {
        let mut buffer = CrdtBuffer::new("s");
        let root = NodeId::root();
        buffer.insert_with_counter('x', &root, 0);
        buffer.insert_with_counter('y', &root, 2);
        let id = buffer.insert('z', &root);
        assert_eq!(buffer.node(&id).unwrap().counter(), 1);
    }

    #[test]
    fn test_unknown_parent_falls_back_to_root() {
        let mut buffer = CrdtBuffer::new("s");
        let id = buffer.insert('x', &NodeId::new("ghost", 9));
        assert_eq!(buffer.parent_of(&id), Some(&NodeId::root()));
        assert_eq!(buffer.document(), "x");
    }

    #[test]
    fn test_delete_middle_character_and_sync_peer() {
        let mut a = CrdtBuffer::new("a");
        let ids = type_text(&mut a, &NodeId::root(), "Hello");
        let mut b = CrdtBuffer::new("b");
        b.merge(&a.snapshot());
        assert_eq!(b.document(), "Hello");

        let first_l = &ids[2];
        let outcome = a.delete(&first_l.site, first_l.clock).unwrap();
        assert_eq!(outcome.reparented, vec![ids[3].clone()]);
        assert_eq!(a.document(), "Helo");
        assert_eq!(b.document(), "Hello");

        b.merge(&a.snapshot());
        assert_eq!(b.document(), "Helo");
    }

    #[test]
    fn test_delete_unknown_is_noop() {
        let mut buffer = CrdtBuffer::new("s");
        type_text(&mut buffer, &NodeId::root(), "ab");
        assert!(buffer.delete("nobody", 1).is_none());
        assert!(buffer.delete("s", 99).is_none());
        assert_eq!(buffer.document(), "ab");
        assert_eq!(buffer.history().undo_len(), 2);
    }

    #[test]
    fn test_delete_twice_is_noop() {
        let mut buffer = CrdtBuffer::new("s");
        let ids = type_text(&mut buffer, &NodeId::root(), "ab");
        assert!(buffer.delete_id(&ids[0]).is_some());
        assert!(buffer.delete_id(&ids[0]).is_none());
        assert_eq!(buffer.tombstone_count(), 1);
    }

    #[test]
    fn test_reparent_moves_children_to_grandparent() {
        let mut buffer = CrdtBuffer::new("s");
        let ids = type_text(&mut buffer, &NodeId::root(), "abc");
        buffer.delete_id(&ids[1]);
        assert_eq!(buffer.parent_of(&ids[2]), Some(&ids[0]));
        assert_eq!(buffer.document(), "ac");
        assert!(buffer.check_acyclic());
    }

    #[test]
    fn test_reparent_preserves_order_on_counter_collision() {
        // Under P: X (counter 0) and Y (counter 1, so Y comes first).
        // X has two children with counters 0 and 1. Moving them up must not
        // let the counter-1 child jump ahead of Y.
        let mut buffer = CrdtBuffer::new("s");
        let p = buffer.insert('P', &NodeId::root());
        let x = buffer.insert('X', &p);
        let y = buffer.insert('Y', &p);
        let c0 = buffer.insert('c', &x);
        let c1 = buffer.insert('d', &x);
        assert_eq!(buffer.node(&y).unwrap().counter(), 1);
        assert_eq!(buffer.node(&c1).unwrap().counter(), 1);
        let before = buffer.document();
        assert_eq!(before, "PYXdc");

        buffer.delete_id(&x);
        assert_eq!(buffer.document(), "PYdc");
        assert_eq!(buffer.parent_of(&c0), Some(&p));
        assert_eq!(buffer.parent_of(&c1), Some(&p));
        assert!(buffer.check_acyclic());
    }

    #[test]
    fn test_deep_delete_chain_stays_connected() {
        let mut buffer = CrdtBuffer::new("s");
        let ids = type_text(&mut buffer, &NodeId::root(), "abcdefgh");
        for id in ids.iter().step_by(2) {
            buffer.delete_id(id);
        }
        assert_eq!(buffer.document(), "bdfh");
        // Delete in the opposite direction too.
        for id in ids.iter().skip(1).step_by(2).rev() {
            buffer.delete_id(id);
        }
        assert_eq!(buffer.document(), "");
        assert!(buffer.check_acyclic());
        assert_eq!(buffer.tombstone_count(), 8);
    }

    #[test]
    fn test_concurrent_roots_interleave_by_site() {
        let mut a = CrdtBuffer::new("a");
        let mut b = CrdtBuffer::new("b");
        type_text(&mut a, &NodeId::root(), "Hi");
        type_text(&mut b, &NodeId::root(), "Yo");
        assert_eq!(a.document(), "Hi");

        exchange(&mut a, &mut b);
        assert_eq!(a.document(), "HiYo");
        assert_eq!(b.document(), "HiYo");
    }

    #[test]
    fn test_sibling_determinism_regardless_of_merge_order() {
        let mut base = CrdtBuffer::new("base");
        let anchor = base.insert('_', &NodeId::root());

        let mut a = CrdtBuffer::new("a");
        let mut b = CrdtBuffer::new("b");
        a.merge(&base.snapshot());
        b.merge(&base.snapshot());
        let na = a.insert('A', &anchor);
        let nb = b.insert('B', &anchor);
        let da = a.delta_for(&[na], &[]);
        let db = b.delta_for(&[nb], &[]);

        let mut left = CrdtBuffer::new("l");
        left.merge(&base.snapshot());
        left.merge(&da);
        left.merge(&db);

        let mut right = CrdtBuffer::new("r");
        right.merge(&db);
        right.merge(&base.snapshot());
        right.merge(&da);

        assert_eq!(left.document(), "_AB");
        assert_eq!(right.document(), left.document());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut a = CrdtBuffer::new("a");
        let ids = type_text(&mut a, &NodeId::root(), "abc");
        a.delete_id(&ids[1]);
        let snapshot = a.snapshot();

        let mut b = CrdtBuffer::new("b");
        let first = b.merge(&snapshot);
        assert_eq!(first.adopted, 3);
        assert_eq!(first.tombstoned, vec![ids[1].clone()]);
        let text = b.document();
        let nodes = b.node_count();

        let second = b.merge(&snapshot);
        assert!(!second.changed());
        assert_eq!(b.document(), text);
        assert_eq!(b.node_count(), nodes);
    }

    #[test]
    fn test_merge_never_untombstones() {
        let mut a = CrdtBuffer::new("a");
        let ids = type_text(&mut a, &NodeId::root(), "xy");
        let stale = a.snapshot();
        a.delete_id(&ids[0]);

        a.merge(&stale);
        assert_eq!(a.is_tombstoned(&ids[0]), Some(true));
        assert_eq!(a.document(), "y");
    }

    #[test]
    fn test_merge_parks_nodes_until_origin_arrives() {
        let mut a = CrdtBuffer::new("a");
        let ids = type_text(&mut a, &NodeId::root(), "abc");
        let first = a.delta_for(&ids[..1], &[]);
        let rest = a.delta_for(&ids[1..], &[]);

        let mut b = CrdtBuffer::new("b");
        let outcome = b.merge(&rest);
        assert_eq!(outcome.adopted, 0);
        assert_eq!(outcome.pending, 2);
        assert_eq!(b.document(), "");

        let outcome = b.merge(&first);
        assert_eq!(outcome.adopted, 3);
        assert_eq!(outcome.pending, 0);
        assert_eq!(b.document(), "abc");
    }

    #[test]
    fn test_tombstone_before_insert_is_applied_on_arrival() {
        let mut a = CrdtBuffer::new("a");
        let ids = type_text(&mut a, &NodeId::root(), "ab");
        let inserts = a.delta_for(&ids, &[]);
        a.delete_id(&ids[0]);
        let deletes = a.delta_for(&[], &ids[..1]);

        let mut b = CrdtBuffer::new("b");
        let outcome = b.merge(&deletes);
        assert!(outcome.tombstoned.is_empty());
        b.merge(&inserts);
        assert_eq!(b.document(), "b");
        assert_eq!(b.document(), a.document());
    }

    #[test]
    fn test_insert_under_concurrently_deleted_parent_converges() {
        let mut a = CrdtBuffer::new("a");
        let ids = type_text(&mut a, &NodeId::root(), "PXY");
        let mut b = CrdtBuffer::new("b");
        b.merge(&a.snapshot());

        // a deletes X while b types after X.
        a.delete_id(&ids[1]);
        b.insert('!', &ids[1]);

        exchange(&mut a, &mut b);
        assert_eq!(a.document(), "P!Y");
        assert_eq!(b.document(), a.document());
        assert!(a.check_acyclic());
        assert!(b.check_acyclic());
    }

    #[test]
    fn test_merge_rejects_root_site_nodes() {
        let mut buffer = CrdtBuffer::new("s");
        let forged = Delta {
            nodes: vec![CrdtNode::new(NodeId::new("", 5), NodeId::root(), 0, '!')],
            tombstones: vec![NodeId::root()],
        };
        let outcome = buffer.merge(&forged);
        assert_eq!(outcome.adopted, 0);
        assert_eq!(buffer.document(), "");
    }

    #[test]
    fn test_merge_own_site_advances_clock() {
        let mut a = CrdtBuffer::new("a");
        type_text(&mut a, &NodeId::root(), "abc");
        let mut restored = CrdtBuffer::new("a");
        restored.merge(&a.snapshot());
        assert_eq!(restored.clock(), 3);
        let id = restored.insert('d', &NodeId::root());
        assert_eq!(id.clock, 4);
    }

    #[test]
    fn test_node_id_at_out_of_range_is_root() {
        let mut buffer = CrdtBuffer::new("s");
        assert!(buffer.node_id_at(0).is_root());
        let ids = type_text(&mut buffer, &NodeId::root(), "ab");
        assert_eq!(buffer.node_id_at(1), ids[1]);
        assert!(buffer.node_id_at(2).is_root());
        buffer.delete_id(&ids[0]);
        assert_eq!(buffer.node_id_at(0), ids[1]);
        assert_eq!(buffer.position_of(&ids[1]), Some(0));
        assert_eq!(buffer.position_of(&ids[0]), None);
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut buffer = CrdtBuffer::new("s");
        type_text(&mut buffer, &NodeId::root(), "abc");
        buffer.add_comment("u", "#fff", "note", 0, 2).unwrap();
        buffer.clear();
        assert_eq!(buffer.document(), "");
        assert_eq!(buffer.clock(), 0);
        assert_eq!(buffer.node_count(), 0);
        assert!(buffer.comments().is_empty());
        assert!(!buffer.history().can_undo());
    }

    #[test]
    fn test_reset_site_never_reuses_clocks() {
        let mut buffer = CrdtBuffer::new("s");
        type_text(&mut buffer, &NodeId::root(), "ab");
        buffer.reset_site("s");
        assert_eq!(buffer.clock(), 2);
        buffer.reset_site("s#1");
        assert_eq!(buffer.clock(), 0);
        assert_eq!(buffer.site(), "s#1");
    }

    #[test]
    fn test_replace_text() {
        let mut buffer = CrdtBuffer::new("s");
        type_text(&mut buffer, &NodeId::root(), "old");
        let delta = buffer.replace_text("new text");
        assert_eq!(buffer.document(), "new text");
        assert_eq!(delta.nodes.len(), 8);
        assert!(delta.tombstones.is_empty());
        assert!(!buffer.history().can_undo());
    }

    #[test]
    fn test_apply_text_splice() {
        let mut a = CrdtBuffer::new("a");
        let mut b = CrdtBuffer::new("b");

        let edit = a.apply_text("the cat sat").unwrap();
        b.merge(&edit.delta);

        let edit = a.apply_text("the dog sat").unwrap();
        assert_eq!(edit.delta.tombstones.len(), 3);
        assert_eq!(edit.delta.nodes.len(), 3);
        b.merge(&edit.delta);

        assert_eq!(a.document(), "the dog sat");
        assert_eq!(b.document(), "the dog sat");
        assert!(a.apply_text("the dog sat").is_none());
    }

    #[test]
    fn test_undo_redo_insert_roundtrip() {
        let mut buffer = CrdtBuffer::new("s");
        buffer.insert('a', &NodeId::root());
        let after_insert = buffer.document();

        let undo = buffer.undo().unwrap();
        assert_eq!(buffer.document(), "");
        assert_eq!(undo.delta.tombstones.len(), 1);

        let redo = buffer.redo().unwrap();
        assert_eq!(buffer.document(), after_insert);
        assert_eq!(redo.delta.nodes.len(), 1);

        // The redone character is a new node; undo must remove that one.
        buffer.undo().unwrap();
        assert_eq!(buffer.document(), "");
    }

    #[test]
    fn test_undo_delete_restores_position() {
        let mut buffer = CrdtBuffer::new("s");
        let ids = type_text(&mut buffer, &NodeId::root(), "Hello");
        buffer.delete_id(&ids[1]);
        assert_eq!(buffer.document(), "Hllo");

        let edit = buffer.undo().unwrap();
        assert_eq!(buffer.document(), "Hello");
        assert_eq!(edit.delta.nodes.len(), 1);
        assert_ne!(edit.delta.nodes[0].id(), &ids[1]);
        assert_eq!(edit.delta.nodes[0].counter(), 0);

        buffer.redo().unwrap();
        assert_eq!(buffer.document(), "Hllo");
    }

    #[test]
    fn test_undo_bulk_delete() {
        let mut buffer = CrdtBuffer::new("s");
        buffer.apply_text("Xab Y").unwrap();
        let edit = buffer.apply_text("X Y").unwrap();
        assert_eq!(edit.delta.tombstones.len(), 2);

        // One undo brings back both characters.
        buffer.undo().unwrap();
        assert_eq!(buffer.document(), "Xab Y");
        buffer.redo().unwrap();
        assert_eq!(buffer.document(), "X Y");
        buffer.undo().unwrap();
        assert_eq!(buffer.document(), "Xab Y");
    }

    #[test]
    fn test_undo_is_bounded() {
        let mut buffer = CrdtBuffer::new("s");
        type_text(&mut buffer, &NodeId::root(), "abcde");
        assert!(buffer.undo().is_some());
        assert!(buffer.undo().is_some());
        assert!(buffer.undo().is_some());
        assert!(buffer.undo().is_none());
        assert_eq!(buffer.document(), "ab");
    }

    #[test]
    fn test_new_edit_clears_redo() {
        let mut buffer = CrdtBuffer::new("s");
        let a = buffer.insert('a', &NodeId::root());
        buffer.insert('b', &a);
        buffer.undo().unwrap();
        assert!(buffer.history().can_redo());
        buffer.insert('c', &a);
        assert!(buffer.redo().is_none());
        assert_eq!(buffer.document(), "ac");
    }

    #[test]
    fn test_undo_replicates_to_peer() {
        let mut a = CrdtBuffer::new("a");
        let mut b = CrdtBuffer::new("b");
        let edit = a.apply_text("abc").unwrap();
        b.merge(&edit.delta);
        let edit = a.apply_text("ac").unwrap();
        b.merge(&edit.delta);
        assert_eq!(b.document(), "ac");

        let edit = a.undo().unwrap();
        b.merge(&edit.delta);
        assert_eq!(a.document(), "abc");
        assert_eq!(b.document(), "abc");
    }

    #[test]
    fn test_comment_range_validation() {
        let mut buffer = CrdtBuffer::new("s");
        type_text(&mut buffer, &NodeId::root(), "abc");
        assert_eq!(
            buffer.add_comment("u", "#fff", "x", 2, 2),
            Err(CrdtError::InvalidCommentRange { start: 2, end: 2, len: 3 })
        );
        assert!(buffer.add_comment("u", "#fff", "x", 1, 4).is_err());
        let comment = buffer.add_comment("u", "#fff", "x", 1, 3).unwrap();
        assert_eq!(comment.start_node(), &NodeId::new("s", 2));
        assert_eq!(comment.end_node(), &NodeId::new("s", 3));
    }

    #[test]
    fn test_deleting_anchored_node_removes_comment() {
        let mut buffer = CrdtBuffer::new("s");
        let ids = type_text(&mut buffer, &NodeId::root(), "abcd");
        let comment = buffer.add_comment("u", "#fff", "x", 1, 3).unwrap();

        let outcome = buffer.delete_id(&ids[3]).unwrap();
        assert!(outcome.removed_comments.is_empty());

        // 'b' sits inside the range.
        let outcome = buffer.delete_id(&ids[1]).unwrap();
        assert_eq!(outcome.removed_comments, vec![comment.comment_id().to_string()]);
        assert!(buffer.comments().is_empty());
    }

    #[test]
    fn test_remote_comment_and_removal_by_merge() {
        let mut a = CrdtBuffer::new("a");
        let ids = type_text(&mut a, &NodeId::root(), "hello");
        let mut b = CrdtBuffer::new("b");
        b.merge(&a.snapshot());

        let comment = a.add_comment("alice", "#FF5733", "greeting", 0, 5).unwrap();
        assert!(b.add_existing_comment(comment.clone()));
        assert!(!b.add_existing_comment(comment.clone()));
        assert_eq!(b.comments().len(), 1);

        a.delete_id(&ids[2]);
        let outcome = b.merge(&a.snapshot());
        assert_eq!(outcome.removed_comments, vec![comment.comment_id().to_string()]);
        assert!(b.comment(comment.comment_id()).is_none());
    }

    #[test]
    fn test_deleting_concurrent_insert_inside_run_removes_comment() {
        let mut alice = CrdtBuffer::new("alice");
        alice.apply_text("abc").unwrap();
        let mut bob = CrdtBuffer::new("bob");
        bob.merge(&alice.snapshot());

        // Bob types X before the comment reaches him; Alice sees it later.
        let x = bob.apply_text("aXbc").unwrap();
        let comment = alice.add_comment("alice", "#FF5733", "run", 0, 3).unwrap();
        assert!(bob.add_existing_comment(comment.clone()));
        alice.merge(&x.delta);
        assert_eq!(alice.document(), "aXbc");

        let edit = bob.apply_text("abc").unwrap();
        assert_eq!(edit.removed_comments, vec![comment.comment_id().to_string()]);
        let outcome = alice.merge(&edit.delta);
        assert_eq!(outcome.removed_comments, vec![comment.comment_id().to_string()]);
        assert!(alice.comments().is_empty());
        assert!(bob.comments().is_empty());
    }

    #[test]
    fn test_deleting_outside_run_keeps_comment() {
        let mut buffer = CrdtBuffer::new("s");
        buffer.apply_text("abcde").unwrap();
        buffer.add_comment("u", "#fff", "x", 1, 3).unwrap();
        let edit = buffer.apply_text("bcd").unwrap();
        assert!(edit.removed_comments.is_empty());
        assert_eq!(buffer.comments().len(), 1);
    }

    #[test]
    fn test_comment_positions_follow_text() {
        let mut buffer = CrdtBuffer::new("s");
        buffer.apply_text("world").unwrap();
        let comment = buffer.add_comment("u", "#fff", "x", 0, 5).unwrap();
        buffer.apply_text("hello world").unwrap();
        buffer.refresh_comment_positions();
        let moved = buffer.comment(comment.comment_id()).unwrap();
        assert_eq!((moved.start_offset(), moved.end_offset()), (6, 11));
    }

    #[test]
    fn test_remove_unknown_comment() {
        let mut buffer = CrdtBuffer::new("s");
        assert_eq!(
            buffer.remove_comment("nope"),
            Err(CrdtError::UnknownComment("nope".into()))
        );
    }
}
