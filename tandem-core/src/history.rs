//! Local undo/redo log.
//!
//! The log is private to one editing participant and is never
//! synchronized. Undoing or redoing mutates the tree like any local edit
//! and the resulting delta has to be broadcast by the caller.

use std::collections::VecDeque;

use crate::id::NodeId;

/// Default number of undoable operations kept.
pub const DEFAULT_UNDO_DEPTH: usize = 3;

/// Everything needed to re-create a character at the same tree position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    /// Current incarnation of the character. Updated every time undo or
    /// redo re-creates it under a fresh clock.
    pub node_id: NodeId,
    pub origin: NodeId,
    pub counter: u32,
    pub value: char,
}

/// A reversible edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Insert(NodeRecord),
    Delete(NodeRecord),
    /// Deletes applied as a unit, in the order they were made.
    BulkDelete(Vec<NodeRecord>),
}

/// Bounded linear undo history.
#[derive(Debug, Clone)]
pub struct History {
    undo: VecDeque<Operation>,
    redo: Vec<Operation>,
    max_depth: usize,
}

impl History {
    pub fn new(max_depth: usize) -> Self {
        Self {
            undo: VecDeque::with_capacity(max_depth),
            redo: Vec::new(),
            max_depth,
        }
    }

    /// Record a fresh local edit. Clears the redo stack.
    pub fn push(&mut self, op: Operation) {
        self.redo.clear();
        self.push_undo(op);
    }

    pub(crate) fn push_undo(&mut self, op: Operation) {
        if self.max_depth == 0 {
            return;
        }
        self.undo.push_back(op);
        while self.undo.len() > self.max_depth {
            self.undo.pop_front();
        }
    }

    pub(crate) fn pop_undo(&mut self) -> Option<Operation> {
        self.undo.pop_back()
    }

    pub(crate) fn push_redo(&mut self, op: Operation) {
        self.redo.push(op);
    }

    pub(crate) fn pop_redo(&mut self) -> Option<Operation> {
        self.redo.pop()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_UNDO_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(clock: u64) -> Operation {
        Operation::Insert(NodeRecord {
            node_id: NodeId::new("s", clock),
            origin: NodeId::root(),
            counter: 0,
            value: 'x',
        })
    }

    #[test]
    fn test_push_evicts_oldest() {
        let mut history = History::new(3);
        for clock in 1..=5 {
            history.push(insert(clock));
        }
        assert_eq!(history.undo_len(), 3);
        assert_eq!(history.pop_undo(), Some(insert(5)));
        assert_eq!(history.pop_undo(), Some(insert(4)));
        assert_eq!(history.pop_undo(), Some(insert(3)));
        assert_eq!(history.pop_undo(), None);
    }

    #[test]
    fn test_push_clears_redo() {
        let mut history = History::default();
        history.push(insert(1));
        let op = history.pop_undo().unwrap();
        history.push_redo(op);
        assert!(history.can_redo());

        history.push(insert(2));
        assert!(!history.can_redo());
    }

    #[test]
    fn test_zero_depth_records_nothing() {
        let mut history = History::new(0);
        history.push(insert(1));
        assert!(!history.can_undo());
    }
}
