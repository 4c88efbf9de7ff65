//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Delta send/receive
//! - Cursor, comment and document-state messages
//! - Offline queue for disconnected edits

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use tandem_core::{Comment, Delta};

use crate::presence::spawn_cursor_heartbeat;
use crate::protocol::{
    CursorUpdate, DocumentResponse, MessageType, PresenceUpdate, ProtocolError, SyncMessage,
};
use crate::session::{parse_code, Role, SessionKey};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Nodes and tombstones from another participant
    RemoteDelta {
        peer_id: String,
        clock: u64,
        delta: Delta,
    },
    Cursor(CursorUpdate),
    Presence(PresenceUpdate),
    /// Someone joined late and wants the current document
    DocumentRequested { requester_id: String },
    DocumentState(DocumentResponse),
    CommentAdded(Comment),
    CommentRemoved { comment_id: String },
    Pong,
}

impl SyncEvent {
    /// Turn an incoming message into an event. `Ok(None)` for messages a
    /// client has no use for.
    pub fn from_message(msg: SyncMessage) -> Result<Option<Self>, ProtocolError> {
        let event = match msg.msg_type {
            MessageType::Delta => SyncEvent::RemoteDelta {
                delta: msg.delta_payload()?,
                peer_id: msg.peer_id,
                clock: msg.clock,
            },
            MessageType::Cursor => SyncEvent::Cursor(msg.cursor_update()?),
            MessageType::Presence => SyncEvent::Presence(msg.presence_update()?),
            MessageType::DocumentRequest => SyncEvent::DocumentRequested {
                requester_id: msg.document_request_payload()?.requester_id,
            },
            MessageType::DocumentResponse => {
                SyncEvent::DocumentState(msg.document_response_payload()?)
            }
            MessageType::CommentAdded => SyncEvent::CommentAdded(msg.comment()?),
            MessageType::CommentRemoved => SyncEvent::CommentRemoved {
                comment_id: msg.comment_removed_payload()?.comment_id,
            },
            MessageType::Pong => SyncEvent::Pong,
            MessageType::Join | MessageType::Ping => return Ok(None),
        };
        Ok(Some(event))
    }
}

/// Edits made while disconnected, replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<QueuedDelta>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedDelta {
    clock: u64,
    delta: Delta,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a delta. Returns `false` when the queue is full.
    pub fn enqueue(&mut self, clock: u64, delta: Delta) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedDelta { clock, delta });
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Delta)> {
        self.queue.drain(..).map(|d| (d.clock, d.delta)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Nodes and tombstones waiting in the queue.
    pub fn total_entries(&self) -> usize {
        self.queue
            .iter()
            .map(|d| d.delta.nodes.len() + d.delta.tombstones.len())
            .sum()
    }
}

/// The sync client.
///
/// One participant's connection to one session.
pub struct SyncClient {
    participant_id: String,
    /// Join code as typed, suffix included
    code: String,
    session: SessionKey,
    role: Role,
    state: Arc<RwLock<ConnectionState>>,
    /// Outgoing message counter
    clock: Arc<RwLock<u64>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    /// Encoded frames for the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
    server_url: String,
}

impl SyncClient {
    pub fn new(
        participant_id: impl Into<String>,
        code: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let code = code.into();
        let (session, role) = parse_code(&code);
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            participant_id: participant_id.into(),
            code,
            session,
            role,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(RwLock::new(0)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the session and replay queued edits.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        let join = SyncMessage::join(&self.participant_id, &self.code).encode()?;
        out_tx
            .send(join)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued deltas", queued.len());
        }
        for (clock, delta) in queued {
            let msg =
                SyncMessage::delta(&self.participant_id, self.session.as_str(), clock, &delta);
            out_tx
                .send(msg.encode()?)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }

        self.outgoing_tx = Some(out_tx);
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let participant_id = self.participant_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(sync_msg) => sync_msg,
                            Err(e) => {
                                log::warn!("Dropping undecodable message: {e}");
                                continue;
                            }
                        };
                        // Skip our own messages
                        if sync_msg.peer_id == participant_id {
                            continue;
                        }
                        match SyncEvent::from_message(sync_msg) {
                            Ok(Some(event)) => {
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => log::warn!("Dropping malformed message: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. Later deltas go to the offline queue.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected && self.outgoing_tx.is_some()
    }

    /// Send a delta, or queue it while disconnected.
    pub async fn send_delta(&self, delta: &Delta) -> Result<(), ProtocolError> {
        if !self.role.can_edit() {
            return Err(ProtocolError::ReadOnly);
        }
        let current_clock = {
            let mut clock = self.clock.write().await;
            *clock += 1;
            *clock
        };

        if !self.is_connected().await {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(current_clock, delta.clone()) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        let msg = SyncMessage::delta(
            &self.participant_id,
            self.session.as_str(),
            current_clock,
            delta,
        );
        self.send(&msg).await
    }

    /// Send a cursor update. Dropped silently while offline.
    pub async fn send_cursor(&self, update: &CursorUpdate) -> Result<(), ProtocolError> {
        if !self.is_connected().await {
            return Ok(());
        }
        self.send(&SyncMessage::cursor(&self.participant_id, self.session.as_str(), update))
            .await
    }

    /// Ask for the current document after joining.
    pub async fn request_document(&self) -> Result<(), ProtocolError> {
        self.send(&SyncMessage::document_request(&self.participant_id, self.session.as_str()))
            .await
    }

    /// Answer another participant's document request.
    pub async fn send_document_state(
        &self,
        response: &DocumentResponse,
    ) -> Result<(), ProtocolError> {
        self.send(&SyncMessage::document_response(
            &self.participant_id,
            self.session.as_str(),
            response,
        ))
        .await
    }

    pub async fn send_comment(&self, comment: &Comment) -> Result<(), ProtocolError> {
        if !self.role.can_edit() {
            return Err(ProtocolError::ReadOnly);
        }
        self.send(&SyncMessage::comment_added(&self.participant_id, self.session.as_str(), comment))
            .await
    }

    pub async fn send_comment_removed(&self, comment_id: &str) -> Result<(), ProtocolError> {
        if !self.role.can_edit() {
            return Err(ProtocolError::ReadOnly);
        }
        self.send(&SyncMessage::comment_removed(
            &self.participant_id,
            self.session.as_str(),
            comment_id,
        ))
        .await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(&SyncMessage::ping(&self.participant_id)).await
    }

    /// Re-send the latest value of `cursor` every `period` while connected.
    ///
    /// Returns `None` when not connected.
    pub fn spawn_cursor_heartbeat(
        &self,
        period: Duration,
        cursor: watch::Receiver<Option<CursorUpdate>>,
    ) -> Option<JoinHandle<()>> {
        let tx = self.outgoing_tx.clone()?;
        let peer_id = self.participant_id.clone();
        let session = self.session.to_string();
        Some(spawn_cursor_heartbeat(period, cursor, move |update| {
            let msg = SyncMessage::cursor(&peer_id, &session, &update);
            match msg.encode() {
                Ok(encoded) => match tx.try_send(encoded) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                },
                Err(e) => {
                    log::warn!("Failed to encode heartbeat cursor: {e}");
                    true
                }
            }
        }))
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn clock(&self) -> u64 {
        *self.clock.read().await
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}
