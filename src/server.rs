//! WebSocket room coordinator with admission control.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room ("ship-fast-a1b2…") ── DocumentSession (Yrs Doc)
//! Client B ──┘         │                            │
//!                      ├── BroadcastGroup           ├── SnapshotStore
//!                      ├── PresenceTracker          └── MetadataStore
//!                      │        (debounced persister task)
//!            ┌─────────┼─────────┐
//!            ▼         ▼         ▼
//!        Client A  Client B  Client C
//! ```
//!
//! Rooms are created on the first admitted connection and torn down when
//! the last peer leaves, after a final durability flush. Admission runs
//! after the WebSocket handshake (identity headers are captured during
//! it); a denied connection is closed with a status-coded reason before
//! any CRDT traffic flows.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::gatekeeper::{
    Admission, AuthContext, Gatekeeper, HandshakeIdentity, RetryPolicy, CF_ACCESS_EMAIL_HEADER,
    DEV_EMAIL_HEADER,
};
use crate::presence::{PresenceTracker, UserInfo};
use crate::protocol::{MessageType, SyncMessage};
use crate::session::{DebounceConfig, DocumentSession};
use crate::store::memory::MemoryStore;
use crate::store::rocks::{RocksStore, StoreConfig};
use crate::store::{MetadataStore, SnapshotStore, StoreError};

/// Per-room creation locks. Hydration is store I/O and must not run
/// under the registry lock, or one slow room would stall every other
/// room's traffic.
type RoomInitLocks = Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Honor the dev identity header / fallback (local dev only)
    pub auth_bypass: bool,
    /// Identity fallback when auth bypass is on and no header is present
    pub dev_user_email: Option<String>,
    /// Credential attached to store calls made on behalf of sessions
    pub service_token: Option<String>,
    /// Persistence debounce windows
    pub debounce: DebounceConfig,
    /// Admission retry for the create→connect race
    pub retry: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            auth_bypass: false,
            dev_user_email: None,
            service_token: None,
            debounce: DebounceConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub denied_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// One live room: authoritative session plus fan-out and presence.
struct Room {
    session: DocumentSession,
    broadcast: Arc<BroadcastGroup>,
    presence: PresenceTracker,
    /// Persister task handle; detached on room teardown, the final
    /// close-flush completes on its own.
    _persist_task: JoinHandle<()>,
}

/// The room coordinator.
pub struct CollabServer {
    config: ServerConfig,
    /// Live rooms keyed by room id (`{slug}-{id}`)
    rooms: Arc<RwLock<HashMap<String, Room>>>,
    room_init: RoomInitLocks,
    stats: Arc<RwLock<ServerStats>>,
    snapshots: Arc<dyn SnapshotStore>,
    meta: Arc<dyn MetadataStore>,
    gatekeeper: Arc<Gatekeeper>,
}

impl CollabServer {
    /// Create a server over explicit store handles.
    pub fn new(
        config: ServerConfig,
        snapshots: Arc<dyn SnapshotStore>,
        meta: Arc<dyn MetadataStore>,
    ) -> Self {
        let gatekeeper = Arc::new(Gatekeeper::new(meta.clone(), config.retry.clone()));
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            room_init: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            snapshots,
            meta,
            gatekeeper,
        }
    }

    /// Create with RocksDB persistence at the given path.
    pub fn with_storage(config: ServerConfig, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Arc::new(RocksStore::open(StoreConfig {
            path: path.into(),
            ..StoreConfig::default()
        })?);
        Ok(Self::new(config, store.clone(), store))
    }

    /// Create over an in-memory store (tests, local development).
    pub fn with_memory(config: ServerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(config, store.clone(), store)
    }

    /// Bind and run the accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collab server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Run the accept loop on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let room_init = self.room_init.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let snapshots = self.snapshots.clone();
            let meta = self.meta.clone();
            let gatekeeper = self.gatekeeper.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(
                    stream, addr, rooms, room_init, stats, config, snapshots, meta, gatekeeper,
                )
                .await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    #[allow(clippy::too_many_arguments)]
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RwLock<HashMap<String, Room>>>,
        room_init: RoomInitLocks,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
        snapshots: Arc<dyn SnapshotStore>,
        meta: Arc<dyn MetadataStore>,
        gatekeeper: Arc<Gatekeeper>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Identity headers are only visible during the handshake; capture
        // them here, admission itself runs on the first Join frame.
        let mut identity = HandshakeIdentity::default();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                identity.cf_email = header_value(req, CF_ACCESS_EMAIL_HEADER);
                identity.dev_email = header_value(req, DEV_EMAIL_HEADER);
                Ok(resp)
            },
        )
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // State for this connection, set by the Join frame
        let mut conn_id: Option<Uuid> = None;
        let mut room_id: Option<String> = None;
        let mut ctx: Option<AuthContext> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        // The message loop is fallible. Teardown below must run on every
        // exit path, a failed send to a dead peer included, or the peer's
        // presence entry would outlive it and hold the room open.
        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let sync_msg = match SyncMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("undecodable frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            // Everything but Join/Ping requires admission first.
                            if room_id.is_none()
                                && !matches!(sync_msg.msg_type, MessageType::Join | MessageType::Ping)
                            {
                                log::warn!(
                                    "{:?} frame before Join from {addr}, closing",
                                    sync_msg.msg_type
                                );
                                ws_sender
                                    .send(deny_frame(400, "expected Join"))
                                    .await?;
                                break;
                            }

                            match sync_msg.msg_type {
                                MessageType::Join => {
                                    if room_id.is_some() {
                                        log::debug!("duplicate Join from {addr}, ignoring");
                                        continue;
                                    }

                                    let email = match identity.resolve(
                                        config.auth_bypass,
                                        config.dev_user_email.as_deref(),
                                    ) {
                                        Some(email) => email,
                                        None => {
                                            let denied = Admission::Unauthenticated;
                                            log::info!(
                                                "admission denied for {addr}: {}",
                                                denied.reason()
                                            );
                                            {
                                                let mut s = stats.write().await;
                                                s.denied_connections += 1;
                                            }
                                            ws_sender
                                                .send(deny_frame(denied.status(), denied.reason()))
                                                .await?;
                                            break;
                                        }
                                    };
                                    let mut auth = AuthContext::new(&email);
                                    if let Some(token) = &config.service_token {
                                        auth = auth.with_service_token(token);
                                    }

                                    let admission =
                                        gatekeeper.admit(Some(&auth), &sync_msg.room_id).await;
                                    if !admission.is_admitted() {
                                        log::info!(
                                            "admission denied for {addr} to room {}: {} {}",
                                            sync_msg.room_id,
                                            admission.status(),
                                            admission.reason()
                                        );
                                        {
                                            let mut s = stats.write().await;
                                            s.denied_connections += 1;
                                        }
                                        ws_sender
                                            .send(deny_frame(admission.status(), admission.reason()))
                                            .await?;
                                        break;
                                    }

                                    // Presence from the Join payload; the announced
                                    // identity is replaced by the authenticated one.
                                    let mut entry = match sync_msg.presence_entry() {
                                        Ok(entry) => entry,
                                        Err(e) => {
                                            log::warn!("bad Join payload from {addr}: {e}");
                                            ws_sender
                                                .send(deny_frame(400, "bad presence payload"))
                                                .await?;
                                            break;
                                        }
                                    };
                                    entry.conn_id = sync_msg.conn_id;
                                    entry.user = UserInfo::from_email(&email);

                                    // Get or create the room. Creation is serialized
                                    // per room id; hydration runs with no registry
                                    // lock held, so already-admitted peers in other
                                    // rooms keep flowing while a cold room loads.
                                    let init_lock = {
                                        let mut init = room_init.lock().await;
                                        init.entry(sync_msg.room_id.clone())
                                            .or_default()
                                            .clone()
                                    };
                                    let init_guard = init_lock.lock().await;
                                    let exists =
                                        rooms.read().await.contains_key(&sync_msg.room_id);
                                    if !exists {
                                        let (session, task) = DocumentSession::open(
                                            sync_msg.room_id.clone(),
                                            auth.clone(),
                                            snapshots.clone(),
                                            meta.clone(),
                                            config.debounce,
                                        )
                                        .await?;
                                        let mut rooms_w = rooms.write().await;
                                        if rooms_w.contains_key(&sync_msg.room_id) {
                                            // A concurrent creator won; the duplicate
                                            // session is dropped and its persister
                                            // exits on channel close.
                                        } else {
                                            rooms_w.insert(
                                                sync_msg.room_id.clone(),
                                                Room {
                                                    session,
                                                    broadcast: Arc::new(BroadcastGroup::new(
                                                        config.broadcast_capacity,
                                                    )),
                                                    presence: PresenceTracker::new(),
                                                    _persist_task: task,
                                                },
                                            );
                                            log::info!("room {} created", sync_msg.room_id);
                                        }
                                    }
                                    drop(init_guard);

                                    let mut rooms_w = rooms.write().await;
                                    let room = match rooms_w.get_mut(&sync_msg.room_id) {
                                        Some(room) => room,
                                        None => continue,
                                    };

                                    if room.presence.connection_count()
                                        >= config.max_peers_per_room
                                    {
                                        drop(rooms_w);
                                        log::warn!(
                                            "room {} at capacity, denying {addr}",
                                            sync_msg.room_id
                                        );
                                        ws_sender
                                            .send(deny_frame(503, "room at capacity"))
                                            .await?;
                                        break;
                                    }

                                    room.presence.announce(entry);
                                    let rx = room.broadcast.add_peer(sync_msg.conn_id).await;

                                    // Full current state for the new peer, then the
                                    // refreshed roster for everyone.
                                    let state = room.session.encode_state();
                                    let state_msg = SyncMessage::sync_step2(
                                        Uuid::nil(),
                                        sync_msg.room_id.clone(),
                                        state,
                                    );
                                    let roster_msg = SyncMessage::roster(
                                        sync_msg.room_id.clone(),
                                        &room.presence.roster(),
                                    )?;
                                    let broadcast = room.broadcast.clone();
                                    let room_count = rooms_w.len();
                                    drop(rooms_w);

                                    conn_id = Some(sync_msg.conn_id);
                                    room_id = Some(sync_msg.room_id.clone());
                                    ctx = Some(auth);
                                    broadcast_rx = Some(rx);

                                    ws_sender
                                        .send(Message::Binary(state_msg.encode()?.into()))
                                        .await?;
                                    let _ = broadcast.broadcast(&roster_msg);

                                    {
                                        let mut s = stats.write().await;
                                        s.active_rooms = room_count;
                                    }

                                    log::info!(
                                        "peer {} ({email}) joined room {}",
                                        sync_msg.conn_id,
                                        sync_msg.room_id
                                    );
                                }

                                MessageType::Delta => {
                                    // Apply to the authoritative doc, then rebroadcast
                                    // the frame verbatim. The observer arms the persister.
                                    if let Some(rid) = &room_id {
                                        let broadcast = {
                                            let rooms_r = rooms.read().await;
                                            match rooms_r.get(rid) {
                                                Some(room) => {
                                                    if let Err(e) =
                                                        room.session.apply_delta(&sync_msg.payload)
                                                    {
                                                        log::warn!(
                                                            "rejected delta from {addr}: {e}"
                                                        );
                                                        None
                                                    } else {
                                                        Some(room.broadcast.clone())
                                                    }
                                                }
                                                None => None,
                                            }
                                        };
                                        if let Some(bc) = broadcast {
                                            bc.broadcast_raw(Arc::new(bytes));
                                        }
                                    }
                                }

                                MessageType::SyncStep1 => {
                                    // Peer's state vector; answer with a diff.
                                    if let Some(rid) = &room_id {
                                        let diff = {
                                            let rooms_r = rooms.read().await;
                                            rooms_r
                                                .get(rid)
                                                .and_then(|room| {
                                                    room.session.sync_diff(&sync_msg.payload)
                                                })
                                        };
                                        if let Some(diff) = diff {
                                            let response = SyncMessage::sync_step2(
                                                Uuid::nil(),
                                                rid.clone(),
                                                diff,
                                            );
                                            ws_sender
                                                .send(Message::Binary(response.encode()?.into()))
                                                .await?;
                                        }
                                    }
                                }

                                MessageType::Presence => {
                                    // Cursor or focus moved; refresh the roster.
                                    if let (Some(rid), Some(cid), Some(auth)) =
                                        (&room_id, &conn_id, &ctx)
                                    {
                                        let mut entry = match sync_msg.presence_entry() {
                                            Ok(entry) => entry,
                                            Err(e) => {
                                                log::warn!("bad presence payload from {addr}: {e}");
                                                continue;
                                            }
                                        };
                                        entry.conn_id = *cid;
                                        entry.user = UserInfo::from_email(&auth.email);

                                        let out = {
                                            let mut rooms_w = rooms.write().await;
                                            match rooms_w.get_mut(rid) {
                                                Some(room) => {
                                                    room.presence.announce(entry);
                                                    Some((
                                                        room.broadcast.clone(),
                                                        SyncMessage::roster(
                                                            rid.clone(),
                                                            &room.presence.roster(),
                                                        )?,
                                                    ))
                                                }
                                                None => None,
                                            }
                                        };
                                        if let Some((bc, roster_msg)) = out {
                                            let _ = bc.broadcast(&roster_msg);
                                        }
                                    }
                                }

                                MessageType::Ping => {
                                    let pong = SyncMessage::pong(sync_msg.conn_id);
                                    ws_sender
                                        .send(Message::Binary(pong.encode()?.into()))
                                        .await?;
                                }

                                _ => {
                                    log::debug!("unhandled message type: {:?}", sync_msg.msg_type);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast message
                msg = async {
                    if let Some(ref mut rx) = broadcast_rx {
                        rx.recv().await
                    } else {
                        // Not joined yet — wait forever
                        std::future::pending().await
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            // Don't echo a peer's own frames back at it
                            if let Ok(sync_msg) = SyncMessage::decode(&data) {
                                if Some(sync_msg.conn_id) == conn_id {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("peer {conn_id:?} lagged by {n} messages");
                        }
                        Err(_) => break,
                    }
                }
            }
        }
        Ok(())
        }
        .await;

        // Cleanup: leave the room; last peer out tears it down.
        if let (Some(cid), Some(rid)) = (conn_id, room_id) {
            let mut rooms_w = rooms.write().await;
            let mut room_empty = false;
            if let Some(room) = rooms_w.get_mut(&rid) {
                room.broadcast.remove_peer(&cid).await;
                room.presence.remove(&cid);

                if room.presence.is_empty() {
                    room_empty = true;
                } else {
                    let leave_msg = SyncMessage::peer_left(cid, rid.clone());
                    let _ = room.broadcast.broadcast(&leave_msg);
                    if let Ok(roster_msg) =
                        SyncMessage::roster(rid.clone(), &room.presence.roster())
                    {
                        let _ = room.broadcast.broadcast(&roster_msg);
                    }
                }
            }
            if room_empty {
                // Final flush bypasses the debounce; the persister task
                // finishes after the room is gone.
                if let Some(mut room) = rooms_w.remove(&rid) {
                    room.session.close();
                }
                room_init.lock().await.remove(&rid);
                log::info!("room {rid} removed (empty)");
            }

            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = rooms_w.len();
        } else {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }

        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Live room count.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

fn header_value(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Close frame carrying the admission decision as `"{status} {reason}"`.
fn deny_frame(status: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Policy,
        reason: format!("{status} {reason}").into(),
    }))
}
