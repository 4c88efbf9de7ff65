//! WebSocket sync server with session-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Session (key) ── CrdtBuffer replica ── BroadcastGroup
//! Client B ──┘                                               │
//!                                               ┌────────────┼───────────┐
//!                                               ▼            ▼           ▼
//!                                            Client A     Client B    Client C
//! ```
//!
//! The first message of every connection must be a `Join` carrying the raw
//! session code. The server answers with the current roster, then routes
//! each message through the [`Broadcaster`]. Edits from viewers and
//! malformed messages are logged and dropped; the connection stays up.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{Broadcaster, Joined};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::session::SessionKey;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum participants per session
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per session
    pub broadcast_capacity: usize,
    /// Answer document requests from the session replica instead of
    /// asking the other participants
    pub serve_document_state: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            serve_document_state: true,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Malformed, unauthorised or read-only violations
    pub rejected_messages: u64,
    pub active_sessions: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    broadcaster: Arc<Broadcaster>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let broadcaster = Arc::new(Broadcaster::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        Self {
            config,
            broadcaster,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let broadcaster = self.broadcaster.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, broadcaster, stats, config).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        broadcaster: Arc<Broadcaster>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let handshake =
            Self::handshake(&mut ws_sender, &mut ws_receiver, addr, &broadcaster, &stats).await;
        let result = match handshake {
            Ok(Some(joined)) => {
                let participant = joined.info.participant_id.clone();
                let key = joined.session.key().clone();
                let connection = joined.subscription.connection;
                let served = Self::serve_participant(
                    &mut ws_sender,
                    &mut ws_receiver,
                    addr,
                    joined,
                    &broadcaster,
                    &stats,
                    &config,
                )
                .await;
                broadcaster
                    .leave_connection(&participant, &key, connection)
                    .await;
                served
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_sessions = broadcaster.session_count().await;
        }
        let _ = ws_sender.close().await;
        result
    }

    /// Wait for the `Join`. Returns `None` when the connection closed or
    /// the join was refused.
    async fn handshake(
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        addr: SocketAddr,
        broadcaster: &Broadcaster,
        stats: &RwLock<ServerStats>,
    ) -> Result<Option<Joined>, BoxError> {
        while let Some(msg) = ws_receiver.next().await {
            let data = match msg? {
                Message::Binary(data) => data,
                Message::Ping(data) => {
                    ws_sender.send(Message::Pong(data)).await?;
                    continue;
                }
                Message::Close(_) => return Ok(None),
                _ => continue,
            };
            let sync_msg = match SyncMessage::decode(&data) {
                Ok(sync_msg) => sync_msg,
                Err(e) => {
                    log::warn!("Failed to decode message from {addr}: {e}");
                    stats.write().await.rejected_messages += 1;
                    continue;
                }
            };

            match sync_msg.msg_type {
                MessageType::Join => {}
                MessageType::Ping => {
                    ws_sender
                        .send(Message::Binary(SyncMessage::pong("").encode()?.into()))
                        .await?;
                    continue;
                }
                other => {
                    log::warn!("Dropping {other:?} from {addr} before join");
                    stats.write().await.rejected_messages += 1;
                    continue;
                }
            }

            let code = match sync_msg.join_request() {
                Ok(request) => request.code,
                Err(e) => {
                    log::warn!("Malformed join from {addr}: {e}");
                    stats.write().await.rejected_messages += 1;
                    continue;
                }
            };
            if sync_msg.peer_id.is_empty() {
                log::warn!("Join from {addr} without participant id");
                stats.write().await.rejected_messages += 1;
                continue;
            }

            let joined = match broadcaster.join(&sync_msg.peer_id, &code).await {
                Ok(joined) => joined,
                Err(e) => {
                    log::warn!("Refusing {} from {addr}: {e}", sync_msg.peer_id);
                    return Ok(None);
                }
            };

            // Roster, self included, so the newcomer learns its own role
            // and color.
            let key = joined.session.key();
            for member in broadcaster.roster(key).await {
                let msg = SyncMessage::presence("", key.as_str(), &member.presence(true));
                ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
            }
            stats.write().await.active_sessions = broadcaster.session_count().await;
            return Ok(Some(joined));
        }
        Ok(None)
    }

    async fn serve_participant(
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        addr: SocketAddr,
        joined: Joined,
        broadcaster: &Broadcaster,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
    ) -> Result<(), BoxError> {
        let Joined {
            session,
            info,
            mut subscription,
        } = joined;
        let participant = info.participant_id;
        let key = session.key().clone();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let routed = match SyncMessage::decode(&data) {
                                Ok(sync_msg) => {
                                    route(broadcaster, config, &participant, &key, sync_msg).await
                                }
                                Err(e) => Err(e),
                            };
                            match routed {
                                Ok(Some(reply)) => {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    log::warn!("Dropping message from {participant} ({addr}): {e}");
                                    stats.write().await.rejected_messages += 1;
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Session fan-out
                frame = subscription.fanout.recv() => {
                    match frame {
                        Ok(data) => {
                            // Don't echo back to sender
                            if let Ok(sync_msg) = SyncMessage::decode(&data) {
                                if sync_msg.peer_id == participant {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!(
                                "Participant {participant} lagged by {n} messages, resending document"
                            );
                            let state = broadcaster.document_state(&key, &participant).await?;
                            let msg = SyncMessage::document_response("", key.as_str(), &state);
                            ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                // Messages addressed to this participant only
                frame = subscription.direct.recv() => {
                    match frame {
                        Some(data) => ws_sender.send(Message::Binary(data.to_vec().into())).await?,
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }
}

/// Route one message from a joined participant.
///
/// The sender identity is the joined participant, never the envelope's
/// `peer_id`. Returns a reply for the sender alone, if any.
pub async fn route(
    broadcaster: &Broadcaster,
    config: &ServerConfig,
    participant: &str,
    key: &SessionKey,
    msg: SyncMessage,
) -> Result<Option<SyncMessage>, ProtocolError> {
    if !msg.session.is_empty() && msg.session != key.as_str() {
        log::debug!("Message from {participant} names session {}, routing to {key}", msg.session);
    }

    match msg.msg_type {
        MessageType::Join => {
            log::debug!("Ignoring repeated join from {participant}");
        }
        MessageType::Delta => {
            let delta = msg.delta_payload()?;
            broadcaster.publish_delta(key, participant, msg.clock, &delta).await?;
        }
        MessageType::Cursor => {
            let mut update = msg.cursor_update()?;
            update.participant_id = participant.to_string();
            broadcaster.broadcast_cursor(key, participant, &update).await?;
        }
        MessageType::Presence => {
            let mut update = msg.presence_update()?;
            update.participant_id = participant.to_string();
            update.role = broadcaster.user_role(participant).await;
            update.color = broadcaster.user_color(participant).await;
            broadcaster.broadcast_presence(key, participant, &update).await?;
        }
        MessageType::DocumentRequest => {
            // Nobody else to ask: the replica is all there is.
            let alone = match broadcaster.session(key).await {
                Some(session) => session.group().peer_count().await <= 1,
                None => true,
            };
            if config.serve_document_state || alone {
                let state = broadcaster.document_state(key, participant).await?;
                log::debug!(
                    "Serving {} characters of {key} to {participant}",
                    state.full_text.chars().count()
                );
                return Ok(Some(SyncMessage::document_response("", key.as_str(), &state)));
            }
            broadcaster.request_document_state(key, participant).await?;
        }
        MessageType::DocumentResponse => {
            let response = msg.document_response_payload()?;
            if !broadcaster.send_document_state(key, participant, &response).await? {
                log::debug!("Document response for {} not delivered", response.requester_id);
            }
        }
        MessageType::CommentAdded => {
            let comment = msg.comment()?;
            broadcaster.broadcast_comment(key, participant, &comment).await?;
        }
        MessageType::CommentRemoved => {
            let removed = msg.comment_removed_payload()?;
            broadcaster
                .broadcast_comment_removed(key, participant, &removed.comment_id)
                .await?;
        }
        MessageType::Ping => return Ok(Some(SyncMessage::pong(""))),
        MessageType::Pong => {}
    }
    Ok(None)
}
