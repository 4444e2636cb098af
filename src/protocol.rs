//! Binary wire protocol between peers and the room coordinator.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┬──────────┐
//! │ msg_type │ conn_id   │ room_id      │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ len-prefixed │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────────┴──────────┴──────────┘
//! ```
//!
//! The first frame on a connection must be `Join`; its payload is the
//! announcing peer's presence entry. `Delta` payloads are opaque CRDT
//! updates and are rebroadcast verbatim.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::presence::PresenceEntry;

/// Message types for the room protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First frame: join a room, payload = own presence entry
    Join = 1,
    /// Client state vector, requesting a diff
    SyncStep1 = 2,
    /// State diff / full state response
    SyncStep2 = 3,
    /// Incremental CRDT delta update
    Delta = 4,
    /// Presence re-announcement (cursor/focus change)
    Presence = 5,
    /// Deduplicated room roster (server → peers)
    Roster = 6,
    /// Peer disconnected
    PeerLeft = 7,
    /// Heartbeat ping
    Ping = 8,
    /// Heartbeat pong
    Pong = 9,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sending connection (nil for server-originated frames)
    pub conn_id: Uuid,
    /// Room token: `{slug}-{id}`
    pub room_id: String,
    /// Sender-local ordering clock
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a join request carrying the peer's presence entry.
    pub fn join(
        conn_id: Uuid,
        room_id: impl Into<String>,
        entry: &PresenceEntry,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Join,
            conn_id,
            room_id: room_id.into(),
            clock: 0,
            payload: entry.encode()?,
        })
    }

    /// Create a delta update message.
    pub fn delta(conn_id: Uuid, room_id: impl Into<String>, clock: u64, update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Delta,
            conn_id,
            room_id: room_id.into(),
            clock,
            payload: update,
        }
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(conn_id: Uuid, room_id: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            conn_id,
            room_id: room_id.into(),
            clock: 0,
            payload: state_vector,
        }
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(conn_id: Uuid, room_id: impl Into<String>, state_diff: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            conn_id,
            room_id: room_id.into(),
            clock: 0,
            payload: state_diff,
        }
    }

    /// Create a presence re-announcement.
    pub fn presence(
        conn_id: Uuid,
        room_id: impl Into<String>,
        clock: u64,
        entry: &PresenceEntry,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Presence,
            conn_id,
            room_id: room_id.into(),
            clock,
            payload: entry.encode()?,
        })
    }

    /// Create a roster broadcast (server-originated).
    pub fn roster(room_id: impl Into<String>, entries: &[PresenceEntry]) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(entries, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Roster,
            conn_id: Uuid::nil(),
            room_id: room_id.into(),
            clock: 0,
            payload,
        })
    }

    /// Create a peer left notification.
    pub fn peer_left(conn_id: Uuid, room_id: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::PeerLeft,
            conn_id,
            room_id: room_id.into(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Create a ping message.
    pub fn ping(conn_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            conn_id,
            room_id: String::new(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong(conn_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            conn_id,
            room_id: String::new(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the presence payload of a `Join` or `Presence` frame.
    pub fn presence_entry(&self) -> Result<PresenceEntry, ProtocolError> {
        if !matches!(self.msg_type, MessageType::Join | MessageType::Presence) {
            return Err(ProtocolError::InvalidMessageType);
        }
        PresenceEntry::decode(&self.payload)
    }

    /// Parse the roster payload of a `Roster` frame.
    pub fn roster_entries(&self) -> Result<Vec<PresenceEntry>, ProtocolError> {
        if self.msg_type != MessageType::Roster {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (entries, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(entries)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("invalid message type")]
    InvalidMessageType,
    #[error("connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::UserInfo;

    fn test_entry(conn_id: Uuid) -> PresenceEntry {
        PresenceEntry::new(conn_id, UserInfo::from_email("alice@example.com"), "tab-1")
    }

    #[test]
    fn test_delta_roundtrip() {
        let conn = Uuid::new_v4();
        let payload = vec![1, 2, 3, 4, 5];

        let msg = SyncMessage::delta(conn, "ship-fast-abc123", 42, payload.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Delta);
        assert_eq!(decoded.conn_id, conn);
        assert_eq!(decoded.room_id, "ship-fast-abc123");
        assert_eq!(decoded.clock, 42);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_join_roundtrip() {
        let conn = Uuid::new_v4();
        let entry = test_entry(conn);

        let msg = SyncMessage::join(conn, "ship-fast-abc123", &entry).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Join);
        let parsed = decoded.presence_entry().unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_roster_roundtrip() {
        let entries = vec![test_entry(Uuid::new_v4()), test_entry(Uuid::new_v4())];
        let msg = SyncMessage::roster("ship-fast-abc123", &entries).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Roster);
        assert_eq!(decoded.conn_id, Uuid::nil());
        assert_eq!(decoded.roster_entries().unwrap(), entries);
    }

    #[test]
    fn test_sync_steps_roundtrip() {
        let conn = Uuid::new_v4();

        let step1 = SyncMessage::sync_step1(conn, "r-1", vec![10, 20]);
        let decoded = SyncMessage::decode(&step1.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::SyncStep1);
        assert_eq!(decoded.payload, vec![10, 20]);

        let step2 = SyncMessage::sync_step2(Uuid::nil(), "r-1", vec![30]);
        let decoded = SyncMessage::decode(&step2.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::SyncStep2);
        assert_eq!(decoded.payload, vec![30]);
    }

    #[test]
    fn test_peer_left_and_heartbeat() {
        let conn = Uuid::new_v4();

        let left = SyncMessage::peer_left(conn, "r-1");
        let decoded = SyncMessage::decode(&left.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::PeerLeft);
        assert!(decoded.payload.is_empty());

        let ping = SyncMessage::decode(&SyncMessage::ping(conn).encode().unwrap()).unwrap();
        let pong = SyncMessage::decode(&SyncMessage::pong(conn).encode().unwrap()).unwrap();
        assert_eq!(ping.msg_type, MessageType::Ping);
        assert_eq!(pong.msg_type, MessageType::Pong);
    }

    #[test]
    fn test_typed_accessor_rejects_wrong_type() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert!(msg.presence_entry().is_err());
        assert!(msg.roster_entries().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_delta_size_efficient() {
        let conn = Uuid::new_v4();
        // Typical small CRDT delta: ~50 bytes
        let msg = SyncMessage::delta(conn, "ship-fast-abc123", 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(
            encoded.len() < 150,
            "encoded size {} too large for 50-byte delta",
            encoded.len()
        );
    }
}
