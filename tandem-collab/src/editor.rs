//! Participant-side session: a local replica driven by text edits and
//! remote events.
//!
//! `EditorSession` never touches the network. Local operations return the
//! values to send, and [`Outbound::send`] hands them to a [`SyncClient`].

use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use tandem_core::{Comment, CrdtBuffer, CrdtError, Delta, LocalEdit, DEFAULT_UNDO_DEPTH};

use crate::client::{SyncClient, SyncEvent};
use crate::presence::{PresenceRoom, CURSOR_HEARTBEAT};
use crate::protocol::{CursorUpdate, DocumentResponse, ProtocolError};
use crate::registry::FALLBACK_COLOR;
use crate::session::{parse_code, Role, SessionKey};
use crate::shared::SharedBuffer;

/// Editor-side settings.
#[derive(Debug, Clone)]
pub struct EditorConfig {
    /// Undoable operations kept per participant
    pub undo_depth: usize,
    /// How often the local caret is re-announced
    pub cursor_heartbeat: Duration,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            undo_depth: DEFAULT_UNDO_DEPTH,
            cursor_heartbeat: CURSOR_HEARTBEAT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session is read-only for this participant")]
    ReadOnly,
    #[error(transparent)]
    Crdt(#[from] CrdtError),
}

/// Something the local participant has to tell the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Delta(Delta),
    Cursor(CursorUpdate),
    Comment(Comment),
    CommentRemoved(String),
    RequestDocument,
    DocumentState(DocumentResponse),
}

impl Outbound {
    /// Messages announcing a local edit: the delta, then every comment
    /// the edit removed.
    pub fn from_edit(edit: LocalEdit) -> Vec<Outbound> {
        let mut out = Vec::with_capacity(1 + edit.removed_comments.len());
        if !edit.delta.is_empty() {
            out.push(Outbound::Delta(edit.delta));
        }
        out.extend(edit.removed_comments.into_iter().map(Outbound::CommentRemoved));
        out
    }

    pub async fn send(&self, client: &SyncClient) -> Result<(), ProtocolError> {
        match self {
            Outbound::Delta(delta) => client.send_delta(delta).await,
            Outbound::Cursor(update) => client.send_cursor(update).await,
            Outbound::Comment(comment) => client.send_comment(comment).await,
            Outbound::CommentRemoved(id) => client.send_comment_removed(id).await,
            Outbound::RequestDocument => client.request_document().await,
            Outbound::DocumentState(response) => client.send_document_state(response).await,
        }
    }
}

/// One participant's view of a session.
pub struct EditorSession {
    participant_id: String,
    key: SessionKey,
    role: Role,
    color: String,
    buffer: SharedBuffer,
    presence: PresenceRoom,
    config: EditorConfig,
    cursor_tx: watch::Sender<Option<CursorUpdate>>,
    /// Bumped on every text-replay catch-up; part of the site id so
    /// replayed nodes never reuse an earlier identity.
    generation: u32,
    synced: bool,
}

impl EditorSession {
    pub fn new(participant_id: impl Into<String>, code: &str, config: EditorConfig) -> Self {
        let participant_id = participant_id.into();
        let (key, role) = parse_code(code);
        let buffer = CrdtBuffer::with_undo_depth(participant_id.clone(), config.undo_depth);
        let (cursor_tx, _) = watch::channel(None);
        Self {
            presence: PresenceRoom::new(participant_id.clone(), FALLBACK_COLOR),
            participant_id,
            key,
            role,
            color: FALLBACK_COLOR.to_string(),
            buffer: SharedBuffer::new(buffer),
            config,
            cursor_tx,
            generation: 0,
            synced: false,
        }
    }

    fn ensure_editor(&self) -> Result<(), SessionError> {
        if self.role.can_edit() {
            Ok(())
        } else {
            Err(SessionError::ReadOnly)
        }
    }

    /// Replace the local text with `new_text`. Returns the delta and the
    /// removed comments to announce, or `None` when nothing changed.
    pub async fn edit(&mut self, new_text: &str) -> Result<Option<LocalEdit>, SessionError> {
        self.ensure_editor()?;
        let mut buffer = self.buffer.lock().await;
        let edit = buffer.apply_text(new_text);
        buffer.refresh_comment_positions();
        self.presence.clamp_to(buffer.len());
        Ok(edit.filter(|e| !e.is_empty()))
    }

    pub async fn undo(&mut self) -> Result<Option<LocalEdit>, SessionError> {
        self.ensure_editor()?;
        let mut buffer = self.buffer.lock().await;
        let edit = buffer.undo();
        buffer.refresh_comment_positions();
        self.presence.clamp_to(buffer.len());
        Ok(edit.filter(|e| !e.is_empty()))
    }

    pub async fn redo(&mut self) -> Result<Option<LocalEdit>, SessionError> {
        self.ensure_editor()?;
        let mut buffer = self.buffer.lock().await;
        let edit = buffer.redo();
        buffer.refresh_comment_positions();
        self.presence.clamp_to(buffer.len());
        Ok(edit.filter(|e| !e.is_empty()))
    }

    /// Comment on the visible range `start..end`.
    pub async fn add_comment(
        &mut self,
        content: &str,
        start: usize,
        end: usize,
    ) -> Result<Comment, SessionError> {
        self.ensure_editor()?;
        let comment = self
            .buffer
            .lock()
            .await
            .add_comment(&self.participant_id, &self.color, content, start, end)?;
        Ok(comment)
    }

    pub async fn remove_comment(&mut self, comment_id: &str) -> Result<Comment, SessionError> {
        self.ensure_editor()?;
        Ok(self.buffer.lock().await.remove_comment(comment_id)?)
    }

    /// Move the local caret, clamped to the document. Returns the update
    /// to send when it moved.
    pub async fn move_cursor(&mut self, offset: usize) -> Option<CursorUpdate> {
        let offset = offset.min(self.buffer.len().await);
        let update = self.presence.update_local_cursor(offset)?;
        self.cursor_tx.send_replace(Some(update.clone()));
        Some(update)
    }

    /// Feed for [`SyncClient::spawn_cursor_heartbeat`].
    pub fn cursor_feed(&self) -> watch::Receiver<Option<CursorUpdate>> {
        self.cursor_tx.subscribe()
    }

    /// The cursor update announcing our departure.
    pub fn leave(&mut self) -> CursorUpdate {
        self.cursor_tx.send_replace(None);
        self.presence.leave()
    }

    /// Apply an event from the session. Returns what to send in reply.
    pub async fn handle_event(&mut self, event: SyncEvent) -> Option<Outbound> {
        match event {
            SyncEvent::Connected => return Some(Outbound::RequestDocument),
            SyncEvent::Disconnected => {
                log::info!("{} disconnected from {}", self.participant_id, self.key);
            }
            SyncEvent::RemoteDelta { peer_id, delta, .. } => {
                let mut buffer = self.buffer.lock().await;
                let outcome = buffer.merge(&delta);
                if outcome.changed() {
                    buffer.refresh_comment_positions();
                    self.presence.clamp_to(buffer.len());
                }
                log::debug!(
                    "Merged delta from {peer_id}: {} adopted, {} pending",
                    outcome.adopted,
                    outcome.pending
                );
            }
            SyncEvent::Cursor(update) => {
                self.presence.handle_cursor(&update);
            }
            SyncEvent::Presence(update) => {
                if update.participant_id == self.participant_id {
                    self.role = update.role;
                    self.color.clone_from(&update.color);
                    self.presence.set_local_color(update.color);
                } else {
                    self.presence.handle_presence(&update);
                }
            }
            SyncEvent::DocumentRequested { requester_id } => {
                if requester_id != self.participant_id && self.synced {
                    return Some(Outbound::DocumentState(self.document_state(&requester_id).await));
                }
            }
            SyncEvent::DocumentState(response) => {
                if response.requester_id == self.participant_id {
                    self.catch_up(response).await;
                }
            }
            SyncEvent::CommentAdded(comment) => {
                self.buffer.lock().await.add_existing_comment(comment);
            }
            SyncEvent::CommentRemoved { comment_id } => {
                // Deleting its text may have removed it already.
                let _ = self.buffer.lock().await.remove_comment(&comment_id);
            }
            SyncEvent::Pong => {}
        }
        None
    }

    /// Bring the local replica up to date with a document response.
    async fn catch_up(&mut self, response: DocumentResponse) {
        let mut buffer = self.buffer.lock().await;
        match response.snapshot {
            Some(snapshot) => {
                let outcome = buffer.merge(&snapshot);
                log::info!(
                    "{} caught up on {}: {} nodes adopted",
                    self.participant_id,
                    self.key,
                    outcome.adopted
                );
            }
            None if !self.synced => {
                // No identities to merge: rebuild from text under a fresh
                // site.
                self.generation += 1;
                buffer.reset_site(format!("{}#{}", self.participant_id, self.generation));
                buffer.replace_text(&response.full_text);
                log::info!(
                    "{} replayed {} characters of {}",
                    self.participant_id,
                    response.full_text.chars().count(),
                    self.key
                );
            }
            None => {
                log::debug!("Ignoring text-only document state, already synced");
                return;
            }
        }
        for comment in response.comments {
            buffer.add_existing_comment(comment);
        }
        buffer.refresh_comment_positions();
        self.presence.clamp_to(buffer.len());
        self.synced = true;
    }

    async fn document_state(&self, requester_id: &str) -> DocumentResponse {
        let buffer = self.buffer.lock().await;
        DocumentResponse {
            requester_id: requester_id.to_string(),
            full_text: buffer.document(),
            snapshot: Some(buffer.snapshot()),
            comments: buffer.comments().into_iter().cloned().collect(),
        }
    }

    pub async fn text(&self) -> String {
        self.buffer.document().await
    }

    pub async fn comments(&self) -> Vec<Comment> {
        self.buffer
            .lock()
            .await
            .comments()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    pub fn presence(&self) -> &PresenceRoom {
        &self.presence
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.key
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn color(&self) -> &str {
        &self.color
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }
}
