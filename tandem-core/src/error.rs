use thiserror::Error;

use crate::id::IdParseError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrdtError {
    #[error("invalid comment range {start}..{end} for document of length {len}")]
    InvalidCommentRange { start: usize, end: usize, len: usize },

    #[error("malformed node id: {0}")]
    MalformedId(#[from] IdParseError),

    #[error("comment not found: {0}")]
    UnknownComment(String),
}
