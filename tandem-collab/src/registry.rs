//! Who is in which session, with what role and color.

use std::collections::HashMap;

use crate::session::{Role, SessionKey};

/// Cursor and comment colors, handed out by join order.
pub const PALETTE: [&str; 6] = [
    "#FF5733", "#33C1FF", "#B6FF33", "#FF33B8", "#FFD700", "#8A2BE2",
];

/// Color reported for unknown participants.
pub const FALLBACK_COLOR: &str = "#000000";

#[derive(Debug, Clone)]
struct Member {
    session: SessionKey,
    role: Role,
    color: String,
}

/// Participant roster. A participant belongs to at most one session.
#[derive(Debug, Default)]
pub struct UserRegistry {
    members: HashMap<String, Member>,
    /// Participant ids per session, in join order.
    rosters: HashMap<SessionKey, Vec<String>>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `user_id` to `session` and return its color.
    ///
    /// Registering again in the same session keeps the existing entry.
    /// Registering in another session leaves the previous one first.
    pub fn register_user(&mut self, user_id: &str, session: &SessionKey, role: Role) -> String {
        if let Some(member) = self.members.get(user_id) {
            if &member.session == session {
                return member.color.clone();
            }
            self.unregister_user(user_id);
        }

        let roster = self.rosters.entry(session.clone()).or_default();
        let color = PALETTE[roster.len() % PALETTE.len()].to_string();
        roster.push(user_id.to_string());
        self.members.insert(
            user_id.to_string(),
            Member {
                session: session.clone(),
                role,
                color: color.clone(),
            },
        );
        log::debug!("Registered {user_id} in {session} as {role} ({color})");
        color
    }

    /// Remove `user_id` from whatever session it is in.
    pub fn unregister_user(&mut self, user_id: &str) -> Option<SessionKey> {
        let member = self.members.remove(user_id)?;
        if let Some(roster) = self.rosters.get_mut(&member.session) {
            roster.retain(|id| id != user_id);
            if roster.is_empty() {
                self.rosters.remove(&member.session);
            }
        }
        Some(member.session)
    }

    /// Remove `user_id` only if it is currently in `session`.
    pub fn unregister_user_from_session(&mut self, user_id: &str, session: &SessionKey) -> bool {
        match self.members.get(user_id) {
            Some(member) if &member.session == session => {
                self.unregister_user(user_id);
                true
            }
            _ => false,
        }
    }

    /// Participants of `session` in join order.
    pub fn users_in_session(&self, session: &SessionKey) -> Vec<String> {
        self.rosters.get(session).cloned().unwrap_or_default()
    }

    pub fn user_color(&self, user_id: &str) -> String {
        self.members
            .get(user_id)
            .map_or_else(|| FALLBACK_COLOR.to_string(), |m| m.color.clone())
    }

    /// Unknown participants are treated as viewers.
    pub fn user_role(&self, user_id: &str) -> Role {
        self.members.get(user_id).map_or(Role::Viewer, |m| m.role)
    }

    pub fn session_of(&self, user_id: &str) -> Option<&SessionKey> {
        self.members.get(user_id).map(|m| &m.session)
    }

    pub fn user_count(&self) -> usize {
        self.members.len()
    }
}
