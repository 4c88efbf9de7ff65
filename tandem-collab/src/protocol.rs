//! Binary protocol for session synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ session   │ clock    │ payload  │
//! │ 1 byte   │ string    │ string    │ varint   │ variable │
//! └──────────┴───────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! The payload is itself bincode, one struct per message type. An empty
//! `peer_id` marks a message originated by the server.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tandem_core::{Comment, Delta};

use crate::session::Role;

/// Cursor offset announcing that a participant left.
pub const CURSOR_LEFT: i64 = -1;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First message of a connection: the raw join code
    Join = 1,
    /// Inserted nodes and tombstones
    Delta = 2,
    /// Caret offset of one participant
    Cursor = 3,
    /// Participant came online or went offline
    Presence = 4,
    /// Late joiner asking for the current document
    DocumentRequest = 5,
    /// Current document, addressed to one requester
    DocumentResponse = 6,
    CommentAdded = 7,
    CommentRemoved = 8,
    Ping = 9,
    Pong = 10,
}

/// Payload of [`MessageType::Join`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub code: String,
}

/// Payload of [`MessageType::Cursor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorUpdate {
    pub participant_id: String,
    /// Character offset, or [`CURSOR_LEFT`].
    pub offset: i64,
    pub color: String,
}

impl CursorUpdate {
    pub fn new(participant_id: impl Into<String>, offset: usize, color: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            offset: i64::try_from(offset).unwrap_or(i64::MAX),
            color: color.into(),
        }
    }

    pub fn left(participant_id: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            offset: CURSOR_LEFT,
            color: color.into(),
        }
    }

    pub fn has_left(&self) -> bool {
        self.offset < 0
    }

    /// The offset, unless the participant left.
    pub fn position(&self) -> Option<usize> {
        usize::try_from(self.offset).ok()
    }
}

/// Payload of [`MessageType::Presence`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub participant_id: String,
    pub role: Role,
    pub color: String,
    pub online: bool,
}

/// Payload of [`MessageType::DocumentRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRequest {
    pub requester_id: String,
}

/// Payload of [`MessageType::DocumentResponse`].
///
/// `snapshot` carries node identities so the requester can merge instead
/// of replaying `full_text` under fresh ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentResponse {
    pub requester_id: String,
    pub full_text: String,
    pub snapshot: Option<Delta>,
    pub comments: Vec<Comment>,
}

/// Payload of [`MessageType::CommentRemoved`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRemoved {
    pub comment_id: String,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: String,
    /// Canonical session key; empty before the join completes.
    pub session: String,
    /// Sender's logical clock, informational only
    pub clock: u64,
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).unwrap_or_else(|e| {
        log::error!("Failed to encode payload: {e}");
        Vec::new()
    })
}

impl SyncMessage {
    fn new(
        msg_type: MessageType,
        peer_id: &str,
        session: &str,
        clock: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            msg_type,
            peer_id: peer_id.to_string(),
            session: session.to_string(),
            clock,
            payload,
        }
    }

    /// Create a join request.
    pub fn join(peer_id: &str, code: &str) -> Self {
        let payload = encode_payload(&JoinRequest {
            code: code.to_string(),
        });
        Self::new(MessageType::Join, peer_id, "", 0, payload)
    }

    /// Create a delta update message.
    pub fn delta(peer_id: &str, session: &str, clock: u64, delta: &Delta) -> Self {
        Self::new(MessageType::Delta, peer_id, session, clock, encode_payload(delta))
    }

    pub fn cursor(peer_id: &str, session: &str, update: &CursorUpdate) -> Self {
        Self::new(MessageType::Cursor, peer_id, session, 0, encode_payload(update))
    }

    pub fn presence(peer_id: &str, session: &str, update: &PresenceUpdate) -> Self {
        Self::new(MessageType::Presence, peer_id, session, 0, encode_payload(update))
    }

    pub fn document_request(peer_id: &str, session: &str) -> Self {
        let payload = encode_payload(&DocumentRequest {
            requester_id: peer_id.to_string(),
        });
        Self::new(MessageType::DocumentRequest, peer_id, session, 0, payload)
    }

    pub fn document_response(peer_id: &str, session: &str, response: &DocumentResponse) -> Self {
        Self::new(
            MessageType::DocumentResponse,
            peer_id,
            session,
            0,
            encode_payload(response),
        )
    }

    pub fn comment_added(peer_id: &str, session: &str, comment: &Comment) -> Self {
        Self::new(MessageType::CommentAdded, peer_id, session, 0, encode_payload(comment))
    }

    pub fn comment_removed(peer_id: &str, session: &str, comment_id: &str) -> Self {
        let payload = encode_payload(&CommentRemoved {
            comment_id: comment_id.to_string(),
        });
        Self::new(MessageType::CommentRemoved, peer_id, session, 0, payload)
    }

    pub fn ping(peer_id: &str) -> Self {
        Self::new(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    pub fn pong(peer_id: &str) -> Self {
        Self::new(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    /// Whether the server produced this message.
    pub fn from_server(&self) -> bool {
        self.peer_id.is_empty()
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    fn payload_as<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                actual: self.msg_type,
            });
        }
        let (value, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }

    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        self.payload_as(MessageType::Join)
    }

    /// Parse a delta payload. A malformed node id fails the whole message.
    pub fn delta_payload(&self) -> Result<Delta, ProtocolError> {
        self.payload_as(MessageType::Delta)
    }

    pub fn cursor_update(&self) -> Result<CursorUpdate, ProtocolError> {
        self.payload_as(MessageType::Cursor)
    }

    pub fn presence_update(&self) -> Result<PresenceUpdate, ProtocolError> {
        self.payload_as(MessageType::Presence)
    }

    pub fn document_request_payload(&self) -> Result<DocumentRequest, ProtocolError> {
        self.payload_as(MessageType::DocumentRequest)
    }

    pub fn document_response_payload(&self) -> Result<DocumentResponse, ProtocolError> {
        self.payload_as(MessageType::DocumentResponse)
    }

    pub fn comment(&self) -> Result<Comment, ProtocolError> {
        self.payload_as(MessageType::CommentAdded)
    }

    pub fn comment_removed_payload(&self) -> Result<CommentRemoved, ProtocolError> {
        self.payload_as(MessageType::CommentRemoved)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type: expected {expected:?}, got {actual:?}")]
    InvalidMessageType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
    #[error("Participant has not joined a session")]
    NotJoined,
    #[error("Session is read-only for this participant")]
    ReadOnly,
    #[error("Session {0} is full")]
    SessionFull(String),
}
