//! Document session: one live CRDT document per room.
//!
//! A session is created on the first connection to a room and owns the
//! room's authoritative document for the lifetime of its activity window:
//!
//! ```text
//! UNINITIALIZED → HYDRATING → LIVE → CLOSED
//!                               │
//!                               └── persister task (concurrent):
//!                                   change ──► debounce ──► snapshot PUT
//!                                                         └► metadata PATCH
//! ```
//!
//! Hydration prefers an existing snapshot, falls back to seeding the
//! `name` field from metadata, and falls back again to an empty document
//! rather than blocking admission. Persistence is debounced: ~2s of
//! quiescence after the last change, capped at ~10s under sustained
//! activity, with one final flush when the room closes.

use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Subscription, Text, Transact, Update, WriteTxn};

use crate::gatekeeper::AuthContext;
use crate::slug::extract_id_from_room_id;
use crate::store::{MetadataStore, PatchOutcome, SnapshotStore, UNTITLED};

/// Well-known fields of a principle document.
pub const FIELD_NAME: &str = "name";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_CONFIDENCE: &str = "confidence";
pub const FIELD_DOMAINS: &str = "domains";
pub const FIELD_IS_SEED: &str = "is_seed";
pub const FIELD_SEED_EXPIRES_AT: &str = "seed_expires_at";
pub const FIELD_CONTEXT: &str = "context";
pub const FIELD_TENSION: &str = "tension";
pub const FIELD_THEREFORE: &str = "therefore";
pub const FIELD_IN_PRACTICE: &str = "in_practice";

const DEFAULT_STATUS: &str = "draft";
const DEFAULT_CONFIDENCE: &str = "emerging";

/// Body fields seeded as empty collaborative text buffers.
const BODY_FIELDS: [&str; 4] = [FIELD_CONTEXT, FIELD_TENSION, FIELD_THEREFORE, FIELD_IN_PRACTICE];

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Hydrating,
    Live,
    Closed,
}

/// Debounce windows for durable persistence.
#[derive(Debug, Clone, Copy)]
pub struct DebounceConfig {
    /// Quiet period after the last change before flushing.
    pub wait: Duration,
    /// Upper bound on total wait under sustained activity.
    pub max_wait: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(2),
            max_wait: Duration::from_secs(10),
        }
    }
}

/// Signals from the session to its persister task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistSignal {
    /// A document change; arms (or feeds) the debounce window.
    Change,
    /// Flush immediately, bypassing the debounce (room close).
    FlushNow,
}

/// Session errors.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("invalid update payload: {0}")]
    InvalidUpdate(String),
    #[error("change subscription failed: {0}")]
    Subscribe(String),
}

/// Owns one room's CRDT document and its persistence cycle.
pub struct DocumentSession {
    room_id: String,
    principle_id: String,
    doc: Doc,
    state: SessionState,
    change_tx: mpsc::UnboundedSender<PersistSignal>,
    /// Update observer; dropped (= unsubscribed) at close.
    _update_sub: Option<Subscription>,
}

impl DocumentSession {
    /// Create and hydrate the session for `room_id`, spawning its
    /// persister task.
    ///
    /// The returned handle completes after the final close flush; the
    /// caller is not required to await it.
    pub async fn open(
        room_id: impl Into<String>,
        ctx: AuthContext,
        snapshots: Arc<dyn SnapshotStore>,
        meta: Arc<dyn MetadataStore>,
        debounce: DebounceConfig,
    ) -> Result<(Self, JoinHandle<()>), SessionError> {
        let room_id = room_id.into();
        let principle_id = extract_id_from_room_id(&room_id).to_string();
        let doc = Doc::new();

        let mut session = Self {
            room_id: room_id.clone(),
            principle_id: principle_id.clone(),
            doc: doc.clone(),
            state: SessionState::Hydrating,
            change_tx: mpsc::unbounded_channel().0, // replaced below
            _update_sub: None,
        };
        session.hydrate(&snapshots, &meta, &ctx).await;

        // Subscribe after hydration so seeding does not arm the debounce.
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let observer_tx = change_tx.clone();
        let sub = doc
            .observe_update_v1(move |_txn, _event| {
                let _ = observer_tx.send(PersistSignal::Change);
            })
            .map_err(|e| SessionError::Subscribe(e.to_string()))?;

        let task = tokio::spawn(run_persister(
            room_id,
            principle_id,
            doc,
            ctx,
            snapshots,
            meta,
            debounce,
            change_rx,
        ));

        session.change_tx = change_tx;
        session._update_sub = Some(sub);
        session.state = SessionState::Live;
        Ok((session, task))
    }

    /// Load the document's initial state.
    ///
    /// Snapshot wins; otherwise seed the name from metadata; otherwise
    /// seed an empty document. Store failures are logged, never fatal —
    /// a later persistence cycle reconciles.
    async fn hydrate(
        &mut self,
        snapshots: &Arc<dyn SnapshotStore>,
        meta: &Arc<dyn MetadataStore>,
        ctx: &AuthContext,
    ) {
        match snapshots.load_snapshot(ctx, &self.principle_id).await {
            Ok(Some(bytes)) if !bytes.is_empty() => match Update::decode_v1(&bytes) {
                Ok(update) => {
                    {
                        let mut txn = self.doc.transact_mut();
                        if let Err(e) = txn.apply_update(update) {
                            log::warn!(
                                "snapshot for {} did not apply cleanly: {e}",
                                self.principle_id
                            );
                        }
                    }
                    seed_defaults(&self.doc, None);
                    return;
                }
                Err(e) => {
                    log::warn!("corrupt snapshot for {}: {e}", self.principle_id);
                }
            },
            Ok(_) => {}
            Err(e) => {
                log::warn!("snapshot load failed for {}: {e}", self.principle_id);
            }
        }

        // No usable snapshot — seed from metadata, or empty as last resort.
        match meta.get_record(ctx, &self.principle_id).await {
            Ok(Some(record)) => seed_defaults(&self.doc, Some(&record.name)),
            Ok(None) => seed_defaults(&self.doc, None),
            Err(e) => {
                log::warn!("metadata load failed for {}: {e}", self.principle_id);
                seed_defaults(&self.doc, None);
            }
        }
    }

    /// Apply a peer's binary delta to the authoritative document.
    ///
    /// The observer tick arms the persister; the caller rebroadcasts the
    /// delta verbatim.
    pub fn apply_delta(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let update =
            Update::decode_v1(bytes).map_err(|e| SessionError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| SessionError::InvalidUpdate(e.to_string()))
    }

    /// Encode the full current document state.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode a diff against a peer's state vector, or `None` if the
    /// vector does not decode.
    pub fn sync_diff(&self, state_vector: &[u8]) -> Option<Vec<u8>> {
        let sv = StateVector::decode_v1(state_vector).ok()?;
        let txn = self.doc.transact();
        Some(txn.encode_diff_v1(&sv))
    }

    /// Current `name` field, trimmed, with the placeholder fallback.
    pub fn derived_name(&self) -> String {
        derived_name(&self.doc)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn principle_id(&self) -> &str {
        &self.principle_id
    }

    /// Direct handle to the underlying document (tests, diagnostics).
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Close the session: drop the change subscription and order one
    /// final flush, bypassing the debounce. Fire-and-forget — the
    /// persister finishes on its own.
    pub fn close(&mut self) {
        self._update_sub = None;
        self.state = SessionState::Closed;
        let _ = self.change_tx.send(PersistSignal::FlushNow);
    }
}

/// Idempotent, non-destructive default seeding.
///
/// Each well-known field is populated only if currently empty, from the
/// best available source (existing snapshot content > metadata > hard
/// default). Re-hydration therefore never clobbers peer-produced content.
pub fn seed_defaults(doc: &Doc, meta_name: Option<&str>) {
    let mut txn = doc.transact_mut();

    let name = txn.get_or_insert_text(FIELD_NAME);
    if name.len(&txn) == 0 {
        if let Some(n) = meta_name {
            // The placeholder is a projection fallback, not content.
            if !n.is_empty() && n != UNTITLED {
                name.insert(&mut txn, 0, n);
            }
        }
    }

    let status = txn.get_or_insert_text(FIELD_STATUS);
    if status.len(&txn) == 0 {
        status.insert(&mut txn, 0, DEFAULT_STATUS);
    }

    let confidence = txn.get_or_insert_text(FIELD_CONFIDENCE);
    if confidence.len(&txn) == 0 {
        confidence.insert(&mut txn, 0, DEFAULT_CONFIDENCE);
    }

    let _domains = txn.get_or_insert_array(FIELD_DOMAINS);

    let is_seed = txn.get_or_insert_text(FIELD_IS_SEED);
    if is_seed.len(&txn) == 0 {
        is_seed.insert(&mut txn, 0, "false");
    }
    let _expires = txn.get_or_insert_text(FIELD_SEED_EXPIRES_AT);

    for field in BODY_FIELDS {
        let _ = txn.get_or_insert_text(field);
    }
}

/// Trimmed `name` field with the placeholder fallback.
pub fn derived_name(doc: &Doc) -> String {
    let txn = doc.transact();
    let name = txn
        .get_text(FIELD_NAME)
        .map(|t| t.get_string(&txn))
        .unwrap_or_default();
    let trimmed = name.trim();
    if trimmed.is_empty() {
        UNTITLED.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Debounce loop: coalesce change ticks into periodic flushes.
#[allow(clippy::too_many_arguments)]
async fn run_persister(
    room_id: String,
    principle_id: String,
    doc: Doc,
    ctx: AuthContext,
    snapshots: Arc<dyn SnapshotStore>,
    meta: Arc<dyn MetadataStore>,
    cfg: DebounceConfig,
    mut rx: mpsc::UnboundedReceiver<PersistSignal>,
) {
    while let Some(signal) = rx.recv().await {
        match signal {
            PersistSignal::FlushNow => {
                persist_once(&doc, &principle_id, &ctx, &snapshots, &meta).await;
                continue;
            }
            PersistSignal::Change => {}
        }

        // A change opened a debounce window; absorb further changes until
        // `wait` of quiet or the `max_wait` cap, whichever comes first.
        let hard_deadline = Instant::now() + cfg.max_wait;
        let mut closed = false;
        loop {
            let quiet = cfg
                .wait
                .min(hard_deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = tokio::time::sleep(quiet) => break,
                sig = rx.recv() => match sig {
                    Some(PersistSignal::Change) => {
                        if Instant::now() >= hard_deadline {
                            break;
                        }
                    }
                    Some(PersistSignal::FlushNow) => break,
                    None => {
                        closed = true;
                        break;
                    }
                }
            }
        }

        persist_once(&doc, &principle_id, &ctx, &snapshots, &meta).await;
        if closed {
            break;
        }
    }
    log::debug!("persister for room {room_id} stopped");
}

/// One persistence attempt: snapshot first, then the metadata projection.
///
/// A failed snapshot write abandons this cycle (the next change re-arms
/// it). A failed metadata patch after a successful snapshot write is
/// non-fatal — the snapshot is authoritative, metadata is an index.
async fn persist_once(
    doc: &Doc,
    principle_id: &str,
    ctx: &AuthContext,
    snapshots: &Arc<dyn SnapshotStore>,
    meta: &Arc<dyn MetadataStore>,
) {
    let snapshot = {
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    };

    if let Err(e) = snapshots.save_snapshot(ctx, principle_id, &snapshot).await {
        log::error!("snapshot write failed for {principle_id}: {e}");
        return;
    }

    let name = derived_name(doc);
    match meta.patch_name(ctx, principle_id, &name).await {
        Ok(PatchOutcome::Applied) => {
            log::debug!("persisted {principle_id} ({} bytes)", snapshot.len());
        }
        Ok(PatchOutcome::NotFoundOrDeleted) => {
            log::warn!("metadata patch for {principle_id} skipped: record missing or deleted");
        }
        Err(e) => {
            log::warn!("metadata patch failed for {principle_id} (non-fatal): {e}");
        }
    }
}
