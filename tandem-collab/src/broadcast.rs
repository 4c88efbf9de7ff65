//! Session-scoped fan-out.
//!
//! Each session owns one tokio broadcast channel shared by all its
//! participants plus one bounded mpsc channel per participant for
//! unicast replies. Frames are pre-encoded [`SyncMessage`]s.
//!
//! [`Broadcaster`] is the service object in front of the sessions: it
//! creates a session on first join, evicts it on last leave, and keeps the
//! participant registry in step.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};

use tandem_core::{Comment, CrdtBuffer, Delta, MergeOutcome};

use crate::protocol::{
    CursorUpdate, DocumentResponse, PresenceUpdate, ProtocolError, SyncMessage,
};
use crate::registry::UserRegistry;
use crate::session::{parse_code, Role, SessionKey};
use crate::shared::SharedBuffer;

/// One encoded message, shared by every receiver.
pub type Frame = Arc<Vec<u8>>;

/// Site id of the replicas kept by the broadcaster.
pub const SERVER_SITE: &str = "server";

/// Participant identity with display metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub participant_id: String,
    pub role: Role,
    pub color: String,
}

impl ParticipantInfo {
    pub fn presence(&self, online: bool) -> PresenceUpdate {
        PresenceUpdate {
            participant_id: self.participant_id.clone(),
            role: self.role,
            color: self.color.clone(),
            online,
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub direct_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters, read via [`BroadcastGroup::stats`].
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    direct_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            direct_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Receiving ends handed to a participant on join.
#[derive(Debug)]
pub struct Subscription {
    /// Everything fanned out to the session, own messages included.
    pub fanout: broadcast::Receiver<Frame>,
    /// Messages addressed to this participant only.
    pub direct: mpsc::Receiver<Frame>,
    /// Identifies this connection among rejoins under the same id.
    pub connection: u64,
}

struct PeerEntry {
    info: ParticipantInfo,
    direct: mpsc::Sender<Frame>,
    connection: u64,
}

/// Fan-out group for a single session.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    peers: RwLock<HashMap<String, PeerEntry>>,
    /// Channel capacity, per receiver
    capacity: usize,
    next_connection: AtomicU64,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` bounds how far a slow participant may lag before it
    /// starts missing fan-out frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            next_connection: AtomicU64::new(1),
            stats: AtomicBroadcastStats::new(),
        }
    }

    /// Add a participant, replacing any previous entry with the same id.
    ///
    /// The replaced connection loses its direct channel; its later
    /// [`remove_connection`](Self::remove_connection) is a no-op.
    pub async fn add_peer(&self, info: ParticipantInfo) -> Subscription {
        let (direct_tx, direct_rx) = mpsc::channel(self.capacity.max(1));
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut peers = self.peers.write().await;
        let replaced = peers.insert(
            info.participant_id.clone(),
            PeerEntry {
                info,
                direct: direct_tx,
                connection,
            },
        );
        if let Some(old) = replaced {
            log::info!(
                "Connection {connection} replaces connection {} of {}",
                old.connection,
                old.info.participant_id
            );
        }
        Subscription {
            fanout: self.sender.subscribe(),
            direct: direct_rx,
            connection,
        }
    }

    pub async fn remove_peer(&self, participant_id: &str) -> Option<ParticipantInfo> {
        let mut peers = self.peers.write().await;
        peers.remove(participant_id).map(|entry| entry.info)
    }

    /// Remove `participant_id` only while `connection` is still its
    /// current connection.
    pub async fn remove_connection(
        &self,
        participant_id: &str,
        connection: u64,
    ) -> Option<ParticipantInfo> {
        let mut peers = self.peers.write().await;
        match peers.get(participant_id) {
            Some(entry) if entry.connection == connection => {
                peers.remove(participant_id).map(|entry| entry.info)
            }
            _ => None,
        }
    }

    /// Send to every participant, the sender included. Filtering own
    /// messages is the receiver's job.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes. Lock-free.
    pub fn broadcast_raw(&self, frame: Frame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Deliver to one participant. Returns `false` when it is unknown or
    /// its queue is full.
    pub async fn send_to(
        &self,
        participant_id: &str,
        msg: &SyncMessage,
    ) -> Result<bool, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        let direct = {
            let peers = self.peers.read().await;
            match peers.get(participant_id) {
                Some(entry) => entry.direct.clone(),
                None => return Ok(false),
            }
        };
        match direct.try_send(frame) {
            Ok(()) => {
                self.stats.direct_sent.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) => {
                log::warn!("Dropping direct message to {participant_id}: {e}");
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<ParticipantInfo> {
        let peers = self.peers.read().await;
        let mut infos: Vec<ParticipantInfo> = peers.values().map(|e| e.info.clone()).collect();
        infos.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        infos
    }

    pub async fn has_peer(&self, participant_id: &str) -> bool {
        self.peers.read().await.contains_key(participant_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            direct_sent: self.stats.direct_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw fan-out receiver, without registering a participant.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }
}

/// A live session: its fan-out group and the authoritative replica.
pub struct Session {
    key: SessionKey,
    group: BroadcastGroup,
    buffer: SharedBuffer,
}

impl Session {
    fn new(key: SessionKey, capacity: usize) -> Self {
        Self {
            key,
            group: BroadcastGroup::new(capacity),
            buffer: SharedBuffer::new(CrdtBuffer::new(SERVER_SITE)),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn group(&self) -> &BroadcastGroup {
        &self.group
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }
}

/// Result of a successful join.
pub struct Joined {
    pub session: Arc<Session>,
    pub info: ParticipantInfo,
    pub subscription: Subscription,
}

/// Maps session keys to live sessions and tracks participants.
pub struct Broadcaster {
    sessions: RwLock<HashMap<SessionKey, Arc<Session>>>,
    registry: RwLock<UserRegistry>,
    capacity: usize,
    max_peers_per_session: usize,
}

impl Broadcaster {
    pub fn new(capacity: usize, max_peers_per_session: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            registry: RwLock::new(UserRegistry::new()),
            capacity,
            max_peers_per_session,
        }
    }

    /// Join the session named by `code`, creating it if needed, and tell
    /// the other participants.
    ///
    /// Lookup, the seat check and registration happen under the session
    /// map's write lock, the same lock eviction takes, so a joiner never
    /// lands in a session that is being evicted.
    pub async fn join(&self, participant_id: &str, code: &str) -> Result<Joined, ProtocolError> {
        let (key, role) = parse_code(code);
        let (session, info, subscription) = {
            let mut sessions = self.sessions.write().await;
            let session = match sessions.get(&key) {
                Some(session) => session.clone(),
                None => {
                    log::info!("Session {key} created");
                    let session = Arc::new(Session::new(key.clone(), self.capacity));
                    sessions.insert(key.clone(), session.clone());
                    session
                }
            };

            if !session.group.has_peer(participant_id).await
                && session.group.peer_count().await >= self.max_peers_per_session
            {
                if session.group.peer_count().await == 0 {
                    sessions.remove(&key);
                }
                return Err(ProtocolError::SessionFull(key.to_string()));
            }

            let color = self
                .registry
                .write()
                .await
                .register_user(participant_id, &key, role);
            let info = ParticipantInfo {
                participant_id: participant_id.to_string(),
                role,
                color,
            };
            let subscription = session.group.add_peer(info.clone()).await;
            (session, info, subscription)
        };

        let announce = SyncMessage::presence(participant_id, key.as_str(), &info.presence(true));
        session.group.broadcast(&announce)?;

        log::info!(
            "Participant {participant_id} joined session {key} as {role} ({})",
            info.color
        );
        Ok(Joined {
            session,
            info,
            subscription,
        })
    }

    /// Leave `key`. Announces the departure and evicts the session when
    /// it becomes empty. Returns whether the participant was present.
    pub async fn leave(&self, participant_id: &str, key: &SessionKey) -> bool {
        self.depart(participant_id, key, None).await
    }

    /// Leave `key` on behalf of one connection. Does nothing when the
    /// participant has since rejoined on another connection.
    pub async fn leave_connection(
        &self,
        participant_id: &str,
        key: &SessionKey,
        connection: u64,
    ) -> bool {
        self.depart(participant_id, key, Some(connection)).await
    }

    async fn depart(
        &self,
        participant_id: &str,
        key: &SessionKey,
        connection: Option<u64>,
    ) -> bool {
        let Some(session) = self.session(key).await else {
            return false;
        };
        let removed = match connection {
            Some(connection) => {
                session
                    .group
                    .remove_connection(participant_id, connection)
                    .await
            }
            None => session.group.remove_peer(participant_id).await,
        };
        let Some(info) = removed else {
            log::debug!("{participant_id} has no current connection to {key}");
            return false;
        };
        self.registry
            .write()
            .await
            .unregister_user_from_session(participant_id, key);

        let gone = CursorUpdate::left(participant_id, info.color.as_str());
        let messages = [
            SyncMessage::cursor(participant_id, key.as_str(), &gone),
            SyncMessage::presence(participant_id, key.as_str(), &info.presence(false)),
        ];
        for msg in &messages {
            if let Err(e) = session.group.broadcast(msg) {
                log::warn!("Failed to announce departure of {participant_id}: {e}");
            }
        }
        log::info!("Participant {participant_id} left session {key}");

        self.remove_if_empty(key).await;
        true
    }

    /// Merge a participant's delta into the session replica and fan it out,
    /// followed by a removal notice for every comment the delta deleted.
    pub async fn publish_delta(
        &self,
        key: &SessionKey,
        sender: &str,
        clock: u64,
        delta: &Delta,
    ) -> Result<MergeOutcome, ProtocolError> {
        let session = self.editable_session(key, sender).await?;
        let outcome = session.buffer.merge(delta).await;
        log::debug!(
            "Delta from {sender} in {key}: {} adopted, {} tombstoned, {} pending",
            outcome.adopted,
            outcome.tombstoned.len(),
            outcome.pending
        );
        session
            .group
            .broadcast(&SyncMessage::delta(sender, key.as_str(), clock, delta))?;
        for comment_id in &outcome.removed_comments {
            log::debug!("Comment {comment_id} in {key} removed by delta from {sender}");
            session
                .group
                .broadcast(&SyncMessage::comment_removed(sender, key.as_str(), comment_id))?;
        }
        Ok(outcome)
    }

    pub async fn broadcast_cursor(
        &self,
        key: &SessionKey,
        sender: &str,
        update: &CursorUpdate,
    ) -> Result<usize, ProtocolError> {
        let session = self.joined_session(key, sender).await?;
        log::trace!("Cursor of {} at {} in {key}", update.participant_id, update.offset);
        session
            .group
            .broadcast(&SyncMessage::cursor(sender, key.as_str(), update))
    }

    pub async fn broadcast_presence(
        &self,
        key: &SessionKey,
        sender: &str,
        update: &PresenceUpdate,
    ) -> Result<usize, ProtocolError> {
        let session = self.joined_session(key, sender).await?;
        session
            .group
            .broadcast(&SyncMessage::presence(sender, key.as_str(), update))
    }

    /// Ask the other participants for the current document.
    pub async fn request_document_state(
        &self,
        key: &SessionKey,
        requester: &str,
    ) -> Result<usize, ProtocolError> {
        let session = self.joined_session(key, requester).await?;
        session
            .group
            .broadcast(&SyncMessage::document_request(requester, key.as_str()))
    }

    /// Current document of `key` as held by the session replica.
    pub async fn document_state(
        &self,
        key: &SessionKey,
        requester: &str,
    ) -> Result<DocumentResponse, ProtocolError> {
        let session = self.session(key).await.ok_or(ProtocolError::NotJoined)?;
        let buffer = session.buffer.lock().await;
        Ok(DocumentResponse {
            requester_id: requester.to_string(),
            full_text: buffer.document(),
            snapshot: Some(buffer.snapshot()),
            comments: buffer.comments().into_iter().cloned().collect(),
        })
    }

    /// Deliver a document response to its requester only.
    pub async fn send_document_state(
        &self,
        key: &SessionKey,
        sender: &str,
        response: &DocumentResponse,
    ) -> Result<bool, ProtocolError> {
        let session = self.session(key).await.ok_or(ProtocolError::NotJoined)?;
        let msg = SyncMessage::document_response(sender, key.as_str(), response);
        session.group.send_to(&response.requester_id, &msg).await
    }

    pub async fn broadcast_comment(
        &self,
        key: &SessionKey,
        sender: &str,
        comment: &Comment,
    ) -> Result<usize, ProtocolError> {
        let session = self.editable_session(key, sender).await?;
        if !session.buffer.lock().await.add_existing_comment(comment.clone()) {
            log::debug!("Comment {} not anchored in session replica", comment.comment_id());
        }
        session
            .group
            .broadcast(&SyncMessage::comment_added(sender, key.as_str(), comment))
    }

    pub async fn broadcast_comment_removed(
        &self,
        key: &SessionKey,
        sender: &str,
        comment_id: &str,
    ) -> Result<usize, ProtocolError> {
        let session = self.editable_session(key, sender).await?;
        // Already gone when a delete removed it first.
        let _ = session.buffer.lock().await.remove_comment(comment_id);
        session
            .group
            .broadcast(&SyncMessage::comment_removed(sender, key.as_str(), comment_id))
    }

    pub async fn session(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.read().await.get(key).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn active_sessions(&self) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self.sessions.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Participants of `key` in join order.
    pub async fn roster(&self, key: &SessionKey) -> Vec<ParticipantInfo> {
        let registry = self.registry.read().await;
        registry
            .users_in_session(key)
            .into_iter()
            .map(|id| ParticipantInfo {
                role: registry.user_role(&id),
                color: registry.user_color(&id),
                participant_id: id,
            })
            .collect()
    }

    pub async fn user_color(&self, participant_id: &str) -> String {
        self.registry.read().await.user_color(participant_id)
    }

    pub async fn user_role(&self, participant_id: &str) -> Role {
        self.registry.read().await.user_role(participant_id)
    }

    async fn remove_if_empty(&self, key: &SessionKey) -> bool {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(key) {
            if session.group.peer_count().await == 0 {
                sessions.remove(key);
                log::info!("Session {key} removed (empty)");
                return true;
            }
        }
        false
    }

    async fn joined_session(
        &self,
        key: &SessionKey,
        participant_id: &str,
    ) -> Result<Arc<Session>, ProtocolError> {
        let member = self.registry.read().await.session_of(participant_id) == Some(key);
        if !member {
            return Err(ProtocolError::NotJoined);
        }
        self.session(key).await.ok_or(ProtocolError::NotJoined)
    }

    async fn editable_session(
        &self,
        key: &SessionKey,
        participant_id: &str,
    ) -> Result<Arc<Session>, ProtocolError> {
        let session = self.joined_session(key, participant_id).await?;
        if !self.user_role(participant_id).await.can_edit() {
            log::warn!("Rejecting edit from viewer {participant_id} in {key}");
            return Err(ProtocolError::ReadOnly);
        }
        Ok(session)
    }
}
