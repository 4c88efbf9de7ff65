//! # tandem-collab: Sessions, fan-out and transport for shared text
//!
//! Participants join a session with a short code, edit a local
//! [`tandem_core::CrdtBuffer`] replica and exchange deltas through a
//! WebSocket server.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐                     ┌─────────────┐
//! │ EditorSession │                     │ SyncServer  │
//! │ (replica)     │                     │ (central)   │
//! └──────┬────────┘                     └──────┬──────┘
//!        │ Outbound                            │
//!        ▼            WebSocket                ▼
//! ┌─────────────┐ ◄─────────────────► ┌─────────────┐
//! │ SyncClient  │    Binary Proto     │ Broadcaster │
//! │ (per user)  │                     │ per session │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                             ┌──────────────┼──────────────┐
//!                             ▼              ▼              ▼
//!                       SharedBuffer   BroadcastGroup  UserRegistry
//!                       (authority)    (fan-out)       (roles, colors)
//! ```
//!
//! ## Modules
//!
//! - [`session`]: Join codes, session keys and roles
//! - [`registry`]: Participant roster and color assignment
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`shared`]: Mutex-guarded replica
//! - [`broadcast`]: Session fan-out and the `Broadcaster` service
//! - [`presence`]: Remote cursors and the cursor heartbeat
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client with offline queue
//! - [`editor`]: Participant-side session glue

pub mod session;
pub mod registry;
pub mod protocol;
pub mod shared;
pub mod broadcast;
pub mod presence;
pub mod server;
pub mod client;
pub mod editor;

// Re-exports for convenience
pub use session::{parse_code, Role, SessionKey};
pub use registry::{UserRegistry, FALLBACK_COLOR, PALETTE};
pub use protocol::{
    CursorUpdate, DocumentRequest, DocumentResponse, MessageType, PresenceUpdate,
    ProtocolError, SyncMessage, CURSOR_LEFT,
};
pub use shared::SharedBuffer;
pub use broadcast::{
    BroadcastGroup, BroadcastStats, Broadcaster, Joined, ParticipantInfo, Session, Subscription,
};
pub use presence::{spawn_cursor_heartbeat, PresenceRoom, RemoteCursor, CURSOR_HEARTBEAT};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use editor::{EditorConfig, EditorSession, Outbound, SessionError};
