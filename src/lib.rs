//! # principles-collab — Real-time collaborative principle documents
//!
//! WebSocket room coordinator for multiplayer editing of principle
//! documents, using CRDT synchronization with durable snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │ Peer        │ ◄─────────────────► │ CollabServer     │
//! │ (per tab)   │     Binary Proto    │ (coordinator)    │
//! └─────────────┘                     └────────┬─────────┘
//!                                              │ Gatekeeper (admit/deny)
//!                                     ┌────────┴─────────┐
//!                                     │ Room ({slug}-{id})│
//!                                     │  DocumentSession  │
//!                                     │  BroadcastGroup   │
//!                                     │  PresenceTracker  │
//!                                     └────────┬─────────┘
//!                                              │ debounced persister
//!                                     ┌────────┴─────────┐
//!                                     │ RocksDB           │
//!                                     │  snapshots (LZ4)  │
//!                                     │  records, slugs   │
//!                                     └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`] — Room-based fan-out with backpressure
//! - [`presence`] — Presence roster with session-id deduplication
//! - [`session`] — Per-room document lifecycle and debounced persistence
//! - [`gatekeeper`] — Race-tolerant admission control
//! - [`slug`] — Slug normalization, allocation and room-id tokens
//! - [`store`] — Snapshot and metadata storage (RocksDB / in-memory)
//! - [`server`] — WebSocket room coordinator

pub mod broadcast;
pub mod gatekeeper;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod slug;
pub mod store;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use gatekeeper::{Admission, AuthContext, Gatekeeper, HandshakeIdentity, RetryPolicy};
pub use presence::{dedup_roster, CursorPos, PresenceEntry, PresenceTracker, UserInfo};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use session::{DebounceConfig, DocumentSession, PersistSignal, SessionError, SessionState};
pub use slug::{allocate_slug, create_room_id, extract_id_from_room_id, normalize_slug};
pub use store::memory::MemoryStore;
pub use store::rocks::{RocksStore, StoreConfig};
pub use store::{MetadataStore, PatchOutcome, PrincipleRecord, SnapshotStore, StoreError, UNTITLED};
