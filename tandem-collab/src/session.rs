//! Session codes and the keys they map to.
//!
//! A participant joins with a code such as `abc123-view`. The suffix picks
//! the role and is stripped to get the session key, so `abc123`,
//! `abc123-edit` and `abc123-view` all name the same session.

use serde::{Deserialize, Serialize};
use std::fmt;

const VIEW_SUFFIX: &str = "-view";
const EDIT_SUFFIX: &str = "-edit";

/// What a participant may do in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Editor,
    Viewer,
}

impl Role {
    pub fn can_edit(self) -> bool {
        matches!(self, Role::Editor)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Editor => f.write_str("editor"),
            Role::Viewer => f.write_str("viewer"),
        }
    }
}

/// Canonical session key: the join code without its role suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn from_code(code: &str) -> Self {
        parse_code(code).0
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Split a join code into its session key and role.
///
/// Surrounding whitespace is ignored. A `-view` suffix makes a viewer;
/// `-edit` or no suffix makes an editor.
pub fn parse_code(code: &str) -> (SessionKey, Role) {
    let code = code.trim();
    if let Some(base) = code.strip_suffix(VIEW_SUFFIX) {
        (SessionKey(base.to_string()), Role::Viewer)
    } else if let Some(base) = code.strip_suffix(EDIT_SUFFIX) {
        (SessionKey(base.to_string()), Role::Editor)
    } else {
        (SessionKey(code.to_string()), Role::Editor)
    }
}
