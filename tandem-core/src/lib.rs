//! Replicated plain-text document.
//!
//! A causal tree of single characters: every character remembers the
//! character it was typed after, siblings are ordered deterministically and
//! deletions leave tombstones. Any two replicas that have merged the same
//! set of nodes and tombstones show the same text.

pub mod buffer;
pub mod comment;
pub mod error;
pub mod history;
pub mod id;
pub mod node;
pub mod splice;

pub use buffer::{CrdtBuffer, Delta, DeleteOutcome, LocalEdit, MergeOutcome};
pub use comment::Comment;
pub use error::CrdtError;
pub use history::{History, NodeRecord, Operation, DEFAULT_UNDO_DEPTH};
pub use id::{IdParseError, NodeId};
pub use node::{CrdtNode, SiblingKey};
pub use splice::Splice;
