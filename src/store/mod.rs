//! Durable storage contracts for principle records and CRDT snapshots.
//!
//! Two collaborator stores back every room:
//! - a snapshot store: key → bytes blobs holding encoded CRDT state
//!   (the source of truth for document content), and
//! - a metadata store: queryable rows with slug/name/timestamps, a
//!   soft-delete marker, and an optimistic version counter.
//!
//! Both are trait seams so deployments can point at an embedded RocksDB
//! database ([`rocks::RocksStore`]) or an in-process fake for tests
//! ([`memory::MemoryStore`]). Every call carries the [`AuthContext`]
//! resolved at room admission — implementations never re-derive identity
//! from ambient state.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::gatekeeper::AuthContext;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Placeholder name for records whose name is empty.
pub const UNTITLED: &str = "(untitled)";

/// A principle's metadata row.
///
/// Invariant: no two non-deleted records share a slug. Rows are only ever
/// soft-deleted (`deleted_at` set), never removed, and never un-deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrincipleRecord {
    /// Immutable, globally unique, hyphen-free id.
    pub id: String,
    /// Human-readable slug, unique among non-deleted records.
    pub slug: String,
    pub name: String,
    pub created_by: String,
    /// Epoch millis.
    pub created_at: u64,
    /// Epoch millis, bumped on every metadata write.
    pub updated_at: u64,
    /// Epoch millis; `None` = active.
    pub deleted_at: Option<u64>,
    /// Optimistic version counter, incremented on every metadata write.
    pub version: u64,
}

impl PrincipleRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (rec, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(rec)
    }
}

/// Outcome of a metadata patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The row was updated; `updated_at` and `version` were bumped.
    Applied,
    /// The row is missing or soft-deleted; the patch was a no-op.
    NotFoundOrDeleted,
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Blob storage for encoded CRDT snapshots, keyed by record id.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Fetch the raw snapshot, or `None` if absent.
    async fn load_snapshot(
        &self,
        ctx: &AuthContext,
        id: &str,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// Overwrite the snapshot for `id`.
    async fn save_snapshot(
        &self,
        ctx: &AuthContext,
        id: &str,
        bytes: &[u8],
    ) -> Result<(), StoreError>;
}

/// Relational-style metadata storage for principle records.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Allocate id and slug, then write the initial row.
    ///
    /// An empty (post-trim) name is stored as [`UNTITLED`].
    async fn create_record(
        &self,
        ctx: &AuthContext,
        name: &str,
    ) -> Result<PrincipleRecord, StoreError>;

    /// Look up a record by id, including soft-deleted rows so callers can
    /// distinguish "never existed" from "gone".
    async fn get_record(
        &self,
        ctx: &AuthContext,
        id: &str,
    ) -> Result<Option<PrincipleRecord>, StoreError>;

    /// Look up a non-deleted record by slug.
    async fn find_by_slug(
        &self,
        ctx: &AuthContext,
        slug: &str,
    ) -> Result<Option<PrincipleRecord>, StoreError>;

    /// Whether any non-deleted record currently holds `slug`.
    async fn slug_in_use(&self, ctx: &AuthContext, slug: &str) -> Result<bool, StoreError>;

    /// Partial update of the name projection, bumping `updated_at` and
    /// `version`. No-ops (reporting it) when the row is missing or
    /// soft-deleted, so a session whose record was deleted concurrently
    /// does not resurrect it.
    async fn patch_name(
        &self,
        ctx: &AuthContext,
        id: &str,
        name: &str,
    ) -> Result<PatchOutcome, StoreError>;

    /// Soft-delete by slug. Returns `false` if no active record matched.
    async fn soft_delete(&self, ctx: &AuthContext, slug: &str) -> Result<bool, StoreError>;

    /// All non-deleted records, most recently updated first.
    async fn list_records(&self, ctx: &AuthContext) -> Result<Vec<PrincipleRecord>, StoreError>;
}
