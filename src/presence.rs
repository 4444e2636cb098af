//! Ephemeral presence tracking for a room.
//!
//! Every connection announces a [`PresenceEntry`] on join and re-announces
//! it on cursor/focus changes. The tracker keeps one entry per connection
//! and builds a deduplicated roster for broadcast: a reconnect briefly
//! produces two live connections for the same logical tab, so entries are
//! grouped by `session_id` and the freshest one wins.
//!
//! Nothing here is persisted — presence dies with the process by design.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::protocol::ProtocolError;
use crate::store::now_millis;

/// Palette for presence indicators (avatars/cursors).
pub const PRESENCE_COLORS: [&str; 8] = [
    "#E57373", "#64B5F6", "#81C784", "#FFD54F", "#BA68C8", "#4DB6AC", "#FF8A65", "#A1887F",
];

/// Pick a stable palette color for a user from their email.
pub fn color_for_email(email: &str) -> &'static str {
    let hash: u64 = email.bytes().map(u64::from).sum();
    PRESENCE_COLORS[(hash % PRESENCE_COLORS.len() as u64) as usize]
}

/// Display name from an email address (the mailbox part).
pub fn display_name(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}

/// User identity shown to other peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub email: String,
    pub name: String,
    /// Hex palette color, stable per email.
    pub color: String,
}

impl UserInfo {
    pub fn from_email(email: impl Into<String>) -> Self {
        let email = email.into();
        let name = display_name(&email).to_string();
        let color = color_for_email(&email).to_string();
        Self { email, name, color }
    }
}

/// Cursor location inside the structured document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPos {
    /// Document field the cursor is in (e.g. "context").
    pub field: String,
    /// Character offset within the field.
    pub offset: u32,
}

/// One connection's announced presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// Connection identifier (changes on reconnect).
    pub conn_id: Uuid,
    pub user: UserInfo,
    pub cursor: Option<CursorPos>,
    /// Stable across reconnects within a browser tab.
    pub session_id: String,
    /// Epoch millis of the last announce.
    pub updated_at: u64,
}

impl PresenceEntry {
    pub fn new(conn_id: Uuid, user: UserInfo, session_id: impl Into<String>) -> Self {
        Self {
            conn_id,
            user,
            cursor: None,
            session_id: session_id.into(),
            updated_at: now_millis(),
        }
    }

    pub fn with_cursor(mut self, field: impl Into<String>, offset: u32) -> Self {
        self.cursor = Some(CursorPos {
            field: field.into(),
            offset,
        });
        self.updated_at = now_millis();
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (entry, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(entry)
    }
}

/// Deduplicate entries by session id.
///
/// Within each session-id group the entry with the greatest `updated_at`
/// survives (ties broken by `conn_id` so the result is deterministic).
/// Output is sorted by session id — arbitrary but stable.
pub fn dedup_roster(entries: impl IntoIterator<Item = PresenceEntry>) -> Vec<PresenceEntry> {
    let mut best: HashMap<String, PresenceEntry> = HashMap::new();
    for entry in entries {
        match best.get(&entry.session_id) {
            Some(current)
                if (current.updated_at, current.conn_id) >= (entry.updated_at, entry.conn_id) => {}
            _ => {
                best.insert(entry.session_id.clone(), entry);
            }
        }
    }
    let mut roster: Vec<PresenceEntry> = best.into_values().collect();
    roster.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    roster
}

/// Per-room mapping from connection to presence entry.
#[derive(Default)]
pub struct PresenceTracker {
    entries: HashMap<Uuid, PresenceEntry>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or replace) a connection's announced entry.
    pub fn announce(&mut self, entry: PresenceEntry) {
        self.entries.insert(entry.conn_id, entry);
    }

    /// Drop a connection's entry entirely. No tombstone.
    pub fn remove(&mut self, conn_id: &Uuid) -> Option<PresenceEntry> {
        self.entries.remove(conn_id)
    }

    /// Deduplicated, stably-ordered roster for broadcast.
    pub fn roster(&self) -> Vec<PresenceEntry> {
        dedup_roster(self.entries.values().cloned())
    }

    /// Number of live connections (before dedup).
    pub fn connection_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
