//! Admission control for new room connections.
//!
//! Before any CRDT traffic flows, every connection passes through the
//! gatekeeper: identity must be resolvable from the handshake headers, the
//! target record must exist and not be soft-deleted, and an unreachable
//! metadata store always denies (never admit on inconclusive state).
//!
//! A record created moments ago may not yet be visible to the lookup
//! path, so a "not found" is retried exactly once after a short fixed
//! delay. More than one retry would mask genuine not-found cases behind
//! added latency.

use std::sync::Arc;
use std::time::Duration;

use crate::slug::extract_id_from_room_id;
use crate::store::{MetadataStore, PrincipleRecord};

/// Identity header set by the access proxy.
pub const CF_ACCESS_EMAIL_HEADER: &str = "CF-Access-Authenticated-User-Email";
/// Dev-mode identity header, honored only with `auth_bypass`.
pub const DEV_EMAIL_HEADER: &str = "X-User-Email";

/// Caller identity resolved at admission.
///
/// Propagated onto every store call a session makes; sessions never
/// re-derive identity from ambient request state once established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub email: String,
    /// Service-to-service credential, distinct from end-user identity.
    pub service_token: Option<String>,
}

impl AuthContext {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            service_token: None,
        }
    }

    pub fn with_service_token(mut self, token: impl Into<String>) -> Self {
        self.service_token = Some(token.into());
        self
    }
}

/// Identity headers captured during the WebSocket handshake.
#[derive(Debug, Clone, Default)]
pub struct HandshakeIdentity {
    pub cf_email: Option<String>,
    pub dev_email: Option<String>,
}

impl HandshakeIdentity {
    /// Resolve the caller's email.
    ///
    /// The proxy-set header wins; the dev header (or a configured dev
    /// fallback) is honored only when the server runs with auth bypass.
    pub fn resolve(&self, auth_bypass: bool, dev_fallback: Option<&str>) -> Option<String> {
        if let Some(email) = &self.cf_email {
            return Some(email.clone());
        }
        if auth_bypass {
            return self
                .dev_email
                .clone()
                .or_else(|| dev_fallback.map(String::from));
        }
        None
    }
}

/// Admission decision for one connection attempt.
#[derive(Debug, Clone)]
pub enum Admission {
    /// Record exists and is active; carries the row for hydration seeding.
    Admitted(PrincipleRecord),
    /// No resolvable caller identity.
    Unauthenticated,
    /// Record does not exist, even after the bounded retry.
    NotFound,
    /// Record exists but was soft-deleted.
    Gone,
    /// Metadata store unreachable or erroring.
    Unavailable,
}

impl Admission {
    /// HTTP-style status for the decision table.
    pub fn status(&self) -> u16 {
        match self {
            Admission::Admitted(_) => 200,
            Admission::Unauthenticated => 401,
            Admission::NotFound => 404,
            Admission::Gone => 410,
            Admission::Unavailable => 503,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Admission::Admitted(_) => "ok",
            Admission::Unauthenticated => "unauthenticated",
            Admission::NotFound => "principle not found",
            Admission::Gone => "principle deleted",
            Admission::Unavailable => "metadata store unavailable",
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

/// Bounded retry for the create→connect visibility race.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total lookup attempts (not retries). Must be at least 1.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_millis(100),
        }
    }
}

/// Decides admit/deny for inbound room connections.
pub struct Gatekeeper {
    meta: Arc<dyn MetadataStore>,
    retry: RetryPolicy,
}

impl Gatekeeper {
    pub fn new(meta: Arc<dyn MetadataStore>, retry: RetryPolicy) -> Self {
        Self { meta, retry }
    }

    /// Run the admission decision table for `room_id`.
    pub async fn admit(&self, ctx: Option<&AuthContext>, room_id: &str) -> Admission {
        let ctx = match ctx {
            Some(ctx) => ctx,
            None => return Admission::Unauthenticated,
        };

        let id = extract_id_from_room_id(room_id);
        let attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=attempts {
            match self.meta.get_record(ctx, id).await {
                Ok(Some(record)) => {
                    if record.is_deleted() {
                        log::info!("admission denied for room {room_id}: deleted");
                        return Admission::Gone;
                    }
                    return Admission::Admitted(record);
                }
                Ok(None) if attempt < attempts => {
                    log::debug!(
                        "record {id} not yet visible (attempt {attempt}), retrying in {:?}",
                        self.retry.delay
                    );
                    tokio::time::sleep(self.retry.delay).await;
                }
                Ok(None) => {
                    log::info!("admission denied for room {room_id}: not found");
                    return Admission::NotFound;
                }
                Err(e) => {
                    log::warn!("admission check for room {room_id} failed: {e}");
                    return Admission::Unavailable;
                }
            }
        }
        Admission::NotFound
    }
}
