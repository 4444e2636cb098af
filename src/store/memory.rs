//! In-process store used by tests and non-durable deployments.
//!
//! Mirrors the RocksDB store's semantics, plus injection knobs:
//! - `set_fail_metadata` / `set_fail_snapshots` make every call report
//!   `Unavailable`, for exercising the admission and persistence failure
//!   paths;
//! - `hide_for` makes the next N id lookups report "not found" even though
//!   the row exists, reproducing the create→connect visibility race;
//! - `set_snapshot_load_delay` stalls every snapshot read, simulating a
//!   slow store during hydration.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::gatekeeper::AuthContext;
use crate::slug;
use crate::store::{
    now_millis, MetadataStore, PatchOutcome, PrincipleRecord, SnapshotStore, StoreError, UNTITLED,
};

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, PrincipleRecord>>,
    snapshots: RwLock<HashMap<String, Vec<u8>>>,
    /// id → remaining lookups to report absent.
    hidden: RwLock<HashMap<String, u32>>,
    fail_metadata: AtomicBool,
    fail_snapshots: AtomicBool,
    snapshot_load_delay: RwLock<Option<Duration>>,
    snapshot_writes: AtomicU64,
    metadata_patches: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every metadata call fail with `Unavailable`.
    pub fn set_fail_metadata(&self, fail: bool) {
        self.fail_metadata.store(fail, Ordering::SeqCst);
    }

    /// Make every snapshot call fail with `Unavailable`.
    pub fn set_fail_snapshots(&self, fail: bool) {
        self.fail_snapshots.store(fail, Ordering::SeqCst);
    }

    /// Stall every snapshot load by `delay`.
    pub async fn set_snapshot_load_delay(&self, delay: Option<Duration>) {
        *self.snapshot_load_delay.write().await = delay;
    }

    /// Hide record `id` from the next `lookups` calls to `get_record`.
    pub async fn hide_for(&self, id: &str, lookups: u32) {
        self.hidden.write().await.insert(id.to_string(), lookups);
    }

    /// Number of successful snapshot writes so far.
    pub fn snapshot_write_count(&self) -> u64 {
        self.snapshot_writes.load(Ordering::SeqCst)
    }

    /// Number of applied metadata patches so far.
    pub fn metadata_patch_count(&self) -> u64 {
        self.metadata_patches.load(Ordering::SeqCst)
    }

    /// Raw stored snapshot, for assertions.
    pub async fn stored_snapshot(&self, id: &str) -> Option<Vec<u8>> {
        self.snapshots.read().await.get(id).cloned()
    }

    /// Insert a pre-built record, for test setup.
    pub async fn insert_record(&self, record: PrincipleRecord) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    fn check_metadata(&self) -> Result<(), StoreError> {
        if self.fail_metadata.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected metadata failure".into()));
        }
        Ok(())
    }

    fn check_snapshots(&self) -> Result<(), StoreError> {
        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected snapshot failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load_snapshot(
        &self,
        _ctx: &AuthContext,
        id: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_snapshots()?;
        let delay = *self.snapshot_load_delay.read().await;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        Ok(self.snapshots.read().await.get(id).cloned())
    }

    async fn save_snapshot(
        &self,
        _ctx: &AuthContext,
        id: &str,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        self.check_snapshots()?;
        self.snapshots
            .write()
            .await
            .insert(id.to_string(), bytes.to_vec());
        self.snapshot_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn create_record(
        &self,
        ctx: &AuthContext,
        name: &str,
    ) -> Result<PrincipleRecord, StoreError> {
        self.check_metadata()?;
        let trimmed = name.trim();
        let stored_name = if trimmed.is_empty() { UNTITLED } else { trimmed };
        let allocated = slug::allocate_slug(self, ctx, trimmed).await?;
        let now = now_millis();
        let record = PrincipleRecord {
            id: slug::new_record_id(),
            slug: allocated,
            name: stored_name.to_string(),
            created_by: ctx.email.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 0,
        };
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_record(
        &self,
        _ctx: &AuthContext,
        id: &str,
    ) -> Result<Option<PrincipleRecord>, StoreError> {
        self.check_metadata()?;
        {
            let mut hidden = self.hidden.write().await;
            if let Some(remaining) = hidden.get_mut(id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(None);
                }
                hidden.remove(id);
            }
        }
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn find_by_slug(
        &self,
        _ctx: &AuthContext,
        slug: &str,
    ) -> Result<Option<PrincipleRecord>, StoreError> {
        self.check_metadata()?;
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.slug == slug && !r.is_deleted())
            .cloned())
    }

    async fn slug_in_use(&self, _ctx: &AuthContext, slug: &str) -> Result<bool, StoreError> {
        self.check_metadata()?;
        Ok(self
            .records
            .read()
            .await
            .values()
            .any(|r| r.slug == slug && !r.is_deleted()))
    }

    async fn patch_name(
        &self,
        _ctx: &AuthContext,
        id: &str,
        name: &str,
    ) -> Result<PatchOutcome, StoreError> {
        self.check_metadata()?;
        let mut records = self.records.write().await;
        match records.get_mut(id) {
            Some(rec) if !rec.is_deleted() => {
                rec.name = name.to_string();
                rec.updated_at = now_millis();
                rec.version += 1;
                self.metadata_patches.fetch_add(1, Ordering::SeqCst);
                Ok(PatchOutcome::Applied)
            }
            _ => Ok(PatchOutcome::NotFoundOrDeleted),
        }
    }

    async fn soft_delete(&self, _ctx: &AuthContext, slug: &str) -> Result<bool, StoreError> {
        self.check_metadata()?;
        let mut records = self.records.write().await;
        match records
            .values_mut()
            .find(|r| r.slug == slug && !r.is_deleted())
        {
            Some(rec) => {
                rec.deleted_at = Some(now_millis());
                rec.version += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_records(&self, _ctx: &AuthContext) -> Result<Vec<PrincipleRecord>, StoreError> {
        self.check_metadata()?;
        let mut active: Vec<PrincipleRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| !r.is_deleted())
            .cloned()
            .collect();
        active.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(active)
    }
}
