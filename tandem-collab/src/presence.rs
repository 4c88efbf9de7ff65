//! Presence: who else is in the session and where their caret is.
//!
//! ```text
//! local caret move ──► PresenceRoom::update_local_cursor ──► CursorUpdate
//!                                    ▲                           │
//!              heartbeat (800ms) ────┘ re-sends latest           ▼
//!                                                        session fan-out
//!                                                               │
//! remote PresenceRoom::handle_cursor / handle_presence  ◄───────┘
//! ```
//!
//! Offsets are plain character positions. A cursor with offset
//! [`CURSOR_LEFT`](crate::protocol::CURSOR_LEFT) removes the participant.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::protocol::{CursorUpdate, PresenceUpdate};
use crate::session::Role;

/// Interval at which a participant re-announces its caret.
pub const CURSOR_HEARTBEAT: Duration = Duration::from_millis(800);

/// A remote participant as seen locally.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub participant_id: String,
    pub color: String,
    pub role: Option<Role>,
    /// `None` until the first cursor update arrives.
    pub offset: Option<usize>,
    last_update: Instant,
}

impl RemoteCursor {
    fn new(participant_id: &str, color: &str) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            color: color.to_string(),
            role: None,
            offset: None,
            last_update: Instant::now(),
        }
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }
}

/// Presence state of every remote participant in one session.
#[derive(Debug)]
pub struct PresenceRoom {
    local_id: String,
    local_color: String,
    peers: HashMap<String, RemoteCursor>,
    local_offset: Option<usize>,
}

impl PresenceRoom {
    pub fn new(local_id: impl Into<String>, local_color: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            local_color: local_color.into(),
            peers: HashMap::new(),
            local_offset: None,
        }
    }

    pub fn set_local_color(&mut self, color: impl Into<String>) {
        self.local_color = color.into();
    }

    /// Apply a remote cursor. Returns whether anything changed.
    pub fn handle_cursor(&mut self, update: &CursorUpdate) -> bool {
        if update.participant_id == self.local_id {
            return false;
        }
        match update.position() {
            None => self.peers.remove(&update.participant_id).is_some(),
            Some(offset) => {
                let peer = self
                    .peers
                    .entry(update.participant_id.clone())
                    .or_insert_with(|| RemoteCursor::new(&update.participant_id, &update.color));
                peer.color.clone_from(&update.color);
                peer.last_update = Instant::now();
                let moved = peer.offset != Some(offset);
                peer.offset = Some(offset);
                moved
            }
        }
    }

    /// Apply a remote presence change. Returns whether anything changed.
    pub fn handle_presence(&mut self, update: &PresenceUpdate) -> bool {
        if update.participant_id == self.local_id {
            return false;
        }
        if !update.online {
            return self.peers.remove(&update.participant_id).is_some();
        }
        let peer = self
            .peers
            .entry(update.participant_id.clone())
            .or_insert_with(|| RemoteCursor::new(&update.participant_id, &update.color));
        peer.color.clone_from(&update.color);
        peer.role = Some(update.role);
        peer.last_update = Instant::now();
        true
    }

    /// Record the local caret. Returns the update to send when it moved.
    pub fn update_local_cursor(&mut self, offset: usize) -> Option<CursorUpdate> {
        if self.local_offset == Some(offset) {
            return None;
        }
        self.local_offset = Some(offset);
        Some(self.local_cursor_update(offset))
    }

    /// Latest local caret, for re-broadcasting.
    pub fn local_cursor(&self) -> Option<CursorUpdate> {
        self.local_offset.map(|offset| self.local_cursor_update(offset))
    }

    /// The update announcing that the local participant left.
    pub fn leave(&mut self) -> CursorUpdate {
        self.local_offset = None;
        CursorUpdate::left(self.local_id.as_str(), self.local_color.as_str())
    }

    fn local_cursor_update(&self, offset: usize) -> CursorUpdate {
        CursorUpdate::new(self.local_id.as_str(), offset, self.local_color.as_str())
    }

    /// Clamp remote carets to a document of `len` characters.
    pub fn clamp_to(&mut self, len: usize) {
        for peer in self.peers.values_mut() {
            if let Some(offset) = peer.offset.as_mut() {
                *offset = (*offset).min(len);
            }
        }
    }

    /// Drop participants silent for longer than `timeout`.
    pub fn prune_idle(&mut self, timeout: Duration) -> Vec<String> {
        let idle: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.is_idle(timeout))
            .map(|p| p.participant_id.clone())
            .collect();
        for id in &idle {
            self.peers.remove(id);
        }
        idle
    }

    /// Remote participants ordered by id.
    pub fn cursors(&self) -> Vec<&RemoteCursor> {
        let mut cursors: Vec<&RemoteCursor> = self.peers.values().collect();
        cursors.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        cursors
    }

    pub fn peer(&self, participant_id: &str) -> Option<&RemoteCursor> {
        self.peers.get(participant_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

/// Re-send the latest local cursor every `period`.
///
/// `emit` returns `false` to stop. The task also stops once the sending
/// side of `cursor` is dropped.
pub fn spawn_cursor_heartbeat<F>(
    period: Duration,
    cursor: watch::Receiver<Option<CursorUpdate>>,
    mut emit: F,
) -> JoinHandle<()>
where
    F: FnMut(CursorUpdate) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if cursor.has_changed().is_err() {
                break;
            }
            let latest = cursor.borrow().clone();
            if let Some(update) = latest {
                log::trace!("Heartbeat cursor {} at {}", update.participant_id, update.offset);
                if !emit(update) {
                    break;
                }
            }
        }
    })
}
