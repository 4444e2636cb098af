//! Slug allocation and room-id derivation.
//!
//! A principle is addressed two ways: by a human-readable `slug` (unique
//! among non-deleted records) and by a durable hyphen-free `id`. A live
//! editing room is keyed by `{slug}-{id}` so the room token stays stable
//! for a session while the id can always be recovered from the last
//! hyphen-delimited segment.

use uuid::Uuid;

use crate::gatekeeper::AuthContext;
use crate::store::{MetadataStore, StoreError};

/// Generate a new durable record id.
///
/// `Uuid::simple` renders 32 hex chars with no hyphens, which keeps the
/// `{slug}-{id}` extraction rule exact: the id can never contain the
/// separator.
pub fn new_record_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Normalize a human name into a URL-safe slug.
///
/// Lowercases, trims, collapses every run of non-alphanumeric characters
/// into a single hyphen, and strips leading/trailing hyphens. May return
/// an empty string (see [`fallback_slug`]).
pub fn normalize_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    slug
}

/// Synthesize a slug base for names that normalize to nothing.
pub fn fallback_slug() -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!("principle-{}", &token[..6])
}

/// Allocate a slug unique among non-deleted records.
///
/// Sequential probe: `base`, `base-1`, `base-2`, … until an unused slug is
/// found. The probe is not atomic with the subsequent insert; concurrent
/// creators of identically-named records can race to the same suffix, and
/// the store's slug index resolves that last-write-wins.
pub async fn allocate_slug<S: MetadataStore + ?Sized>(
    store: &S,
    ctx: &AuthContext,
    name: &str,
) -> Result<String, StoreError> {
    let base = {
        let normalized = normalize_slug(name);
        if normalized.is_empty() {
            fallback_slug()
        } else {
            normalized
        }
    };

    let mut slug = base.clone();
    let mut suffix = 0u64;
    loop {
        if !store.slug_in_use(ctx, &slug).await? {
            return Ok(slug);
        }
        suffix += 1;
        slug = format!("{base}-{suffix}");
    }
}

/// Build a room id from a slug and a record id.
pub fn create_room_id(slug: &str, id: &str) -> String {
    format!("{slug}-{id}")
}

/// Recover the record id from a room id.
///
/// Takes the last hyphen-delimited segment. Exact because record ids are
/// hyphen-free by construction ([`new_record_id`]).
pub fn extract_id_from_room_id(room_id: &str) -> &str {
    room_id.rsplit('-').next().unwrap_or(room_id)
}
