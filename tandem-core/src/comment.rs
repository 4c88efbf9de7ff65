//! Comments anchored to node identities.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::id::NodeId;

/// A comment on a run of characters.
///
/// The anchor is the pair of node ids at either end of the commented run,
/// so the comment follows its text through concurrent edits. Offsets are
/// a rendering hint only and are refreshed from the anchors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    comment_id: String,
    author_id: String,
    author_color: String,
    content: String,
    start_node: NodeId,
    end_node: NodeId,
    start_offset: usize,
    /// Exclusive.
    end_offset: usize,
    /// Milliseconds since the Unix epoch.
    timestamp: u64,
}

impl Comment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        author_id: impl Into<String>,
        author_color: impl Into<String>,
        content: impl Into<String>,
        start_node: NodeId,
        end_node: NodeId,
        start_offset: usize,
        end_offset: usize,
    ) -> Self {
        Self {
            comment_id: Uuid::new_v4().to_string(),
            author_id: author_id.into(),
            author_color: author_color.into(),
            content: content.into(),
            start_node,
            end_node,
            start_offset,
            end_offset,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        }
    }

    pub fn comment_id(&self) -> &str {
        &self.comment_id
    }

    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    pub fn author_color(&self) -> &str {
        &self.author_color
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn start_node(&self) -> &NodeId {
        &self.start_node
    }

    pub fn end_node(&self) -> &NodeId {
        &self.end_node
    }

    pub fn start_offset(&self) -> usize {
        self.start_offset
    }

    pub fn end_offset(&self) -> usize {
        self.end_offset
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn update_positions(&mut self, start_offset: usize, end_offset: usize) {
        self.start_offset = start_offset;
        self.end_offset = end_offset;
    }

    /// Whether `node` is one of the two anchor ends.
    pub fn is_attached_to(&self, node: &NodeId) -> bool {
        &self.start_node == node || &self.end_node == node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comment_ids_are_unique() {
        let a = Comment::new("u", "#fff", "one", NodeId::new("s", 1), NodeId::new("s", 2), 0, 2);
        let b = Comment::new("u", "#fff", "two", NodeId::new("s", 1), NodeId::new("s", 2), 0, 2);
        assert_ne!(a.comment_id(), b.comment_id());
        assert!(a.timestamp() > 0);
    }

    #[test]
    fn test_attachment_and_positions() {
        let mut c = Comment::new("u", "#fff", "hi", NodeId::new("s", 1), NodeId::new("s", 3), 1, 4);
        assert!(c.is_attached_to(&NodeId::new("s", 1)));
        assert!(c.is_attached_to(&NodeId::new("s", 3)));
        assert!(!c.is_attached_to(&NodeId::new("s", 2)));

        c.update_positions(0, 3);
        assert_eq!((c.start_offset(), c.end_offset()), (0, 3));
    }
}
