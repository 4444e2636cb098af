//! Integration tests for end-to-end room collaboration.
//!
//! These tests start a real server over an in-memory store and connect
//! real WebSocket clients, verifying admission, sync and fan-out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use principles_collab::gatekeeper::{
    AuthContext, RetryPolicy, CF_ACCESS_EMAIL_HEADER, DEV_EMAIL_HEADER,
};
use principles_collab::presence::{PresenceEntry, UserInfo};
use principles_collab::protocol::{MessageType, SyncMessage};
use principles_collab::server::{CollabServer, ServerConfig};
use principles_collab::session::DebounceConfig;
use principles_collab::slug::create_room_id;
use principles_collab::store::memory::MemoryStore;
use principles_collab::store::MetadataStore;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
        debounce: DebounceConfig {
            wait: Duration::from_millis(30),
            max_wait: Duration::from_millis(150),
        },
        retry: RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(20),
        },
        ..ServerConfig::default()
    }
}

/// Start a server on a free port over a shared in-memory store.
async fn start_test_server(config: ServerConfig) -> (SocketAddr, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let server = CollabServer::new(config, store.clone(), store.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (addr, store)
}

/// Connect a WebSocket client, optionally carrying an identity header.
async fn connect(addr: SocketAddr, header: Option<(&str, &str)>) -> WsClient {
    let mut request = format!("ws://{addr}").into_client_request().unwrap();
    if let Some((name, value)) = header {
        request.headers_mut().insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    let (ws, _) = connect_async(request).await.unwrap();
    ws
}

/// Send a Join frame for `room_id`.
async fn send_join(ws: &mut WsClient, conn_id: Uuid, room_id: &str, session_id: &str) {
    let entry = PresenceEntry::new(conn_id, UserInfo::from_email("ignored@client.test"), session_id);
    let join = SyncMessage::join(conn_id, room_id, &entry).unwrap();
    ws.send(Message::Binary(join.encode().unwrap().into()))
        .await
        .unwrap();
}

/// Read protocol frames until one of the wanted type arrives.
async fn wait_for(ws: &mut WsClient, wanted: MessageType) -> SyncMessage {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Binary(data) = msg {
            let sync_msg = SyncMessage::decode(&data).unwrap();
            if sync_msg.msg_type == wanted {
                return sync_msg;
            }
        }
    }
}

/// Read until the server closes the socket; return the close reason.
async fn wait_for_close(ws: &mut WsClient) -> String {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for close");
        match msg {
            Some(Ok(Message::Close(Some(frame)))) => return frame.reason.to_string(),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => panic!("connection ended without a close frame"),
        }
    }
}

fn ctx() -> AuthContext {
    AuthContext::new("alice@example.com")
}

fn field_string(doc: &yrs::Doc, field: &str) -> String {
    use yrs::{GetString, ReadTxn, Transact};
    let txn = doc.transact();
    txn.get_text(field)
        .map(|t| t.get_string(&txn))
        .unwrap_or_default()
}

#[tokio::test]
async fn test_unauthenticated_join_is_denied() {
    let (addr, store) = start_test_server(test_config()).await;
    let record = store.create_record(&ctx(), "Ship Fast").await.unwrap();
    let room_id = create_room_id(&record.slug, &record.id);

    // No identity header, no auth bypass.
    let mut ws = connect(addr, None).await;
    send_join(&mut ws, Uuid::new_v4(), &room_id, "tab-1").await;

    let reason = wait_for_close(&mut ws).await;
    assert_eq!(reason, "401 unauthenticated");
}

#[tokio::test]
async fn test_unknown_room_is_denied_with_404() {
    let (addr, _store) = start_test_server(test_config()).await;

    let mut ws = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "alice@example.com"))).await;
    send_join(&mut ws, Uuid::new_v4(), "ghost-room-deadbeef", "tab-1").await;

    let reason = wait_for_close(&mut ws).await;
    assert_eq!(reason, "404 principle not found");
}

#[tokio::test]
async fn test_deleted_room_is_denied_with_410() {
    let (addr, store) = start_test_server(test_config()).await;
    let record = store.create_record(&ctx(), "Ship Fast").await.unwrap();
    let room_id = create_room_id(&record.slug, &record.id);
    assert!(store.soft_delete(&ctx(), &record.slug).await.unwrap());

    let mut ws = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "alice@example.com"))).await;
    send_join(&mut ws, Uuid::new_v4(), &room_id, "tab-1").await;

    let reason = wait_for_close(&mut ws).await;
    assert_eq!(reason, "410 principle deleted");
}

#[tokio::test]
async fn test_join_races_record_creation() {
    let (addr, store) = start_test_server(test_config()).await;
    let record = store.create_record(&ctx(), "Ship Fast").await.unwrap();
    let room_id = create_room_id(&record.slug, &record.id);

    // The record is invisible to the first lookup population, as when a
    // peer connects before the creating write has propagated. The bounded
    // retry must still admit.
    store.hide_for(&record.id, 1).await;

    let mut ws = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "alice@example.com"))).await;
    send_join(&mut ws, Uuid::new_v4(), &room_id, "tab-1").await;

    let state = wait_for(&mut ws, MessageType::SyncStep2).await;
    assert!(!state.payload.is_empty());
}

#[tokio::test]
async fn test_join_receives_hydrated_state_and_roster() {
    let (addr, store) = start_test_server(test_config()).await;
    let record = store.create_record(&ctx(), "Ship Fast").await.unwrap();
    let room_id = create_room_id(&record.slug, &record.id);

    let mut ws = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "alice@example.com"))).await;
    let conn_id = Uuid::new_v4();
    send_join(&mut ws, conn_id, &room_id, "tab-1").await;

    // Full state first: the seeded name comes from metadata.
    let state = wait_for(&mut ws, MessageType::SyncStep2).await;
    let doc = yrs::Doc::new();
    {
        use yrs::updates::decoder::Decode;
        use yrs::Transact;
        let mut txn = doc.transact_mut();
        txn.apply_update(yrs::Update::decode_v1(&state.payload).unwrap())
            .unwrap();
    }
    assert_eq!(field_string(&doc, "name"), "Ship Fast");
    assert_eq!(field_string(&doc, "status"), "draft");

    // Then the roster, carrying the authenticated identity rather than
    // whatever the client announced.
    let roster = wait_for(&mut ws, MessageType::Roster).await;
    let entries = roster.roster_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].conn_id, conn_id);
    assert_eq!(entries[0].user.email, "alice@example.com");
}

#[tokio::test]
async fn test_dev_header_honored_only_with_auth_bypass() {
    // Bypass off: the dev header is ignored.
    let (addr, store) = start_test_server(test_config()).await;
    let record = store.create_record(&ctx(), "Ship Fast").await.unwrap();
    let room_id = create_room_id(&record.slug, &record.id);

    let mut ws = connect(addr, Some((DEV_EMAIL_HEADER, "dev@local.test"))).await;
    send_join(&mut ws, Uuid::new_v4(), &room_id, "tab-1").await;
    assert_eq!(wait_for_close(&mut ws).await, "401 unauthenticated");

    // Bypass on: the dev header admits.
    let config = ServerConfig {
        auth_bypass: true,
        ..test_config()
    };
    let (addr, store) = start_test_server(config).await;
    let record = store.create_record(&ctx(), "Ship Fast").await.unwrap();
    let room_id = create_room_id(&record.slug, &record.id);

    let mut ws = connect(addr, Some((DEV_EMAIL_HEADER, "dev@local.test"))).await;
    send_join(&mut ws, Uuid::new_v4(), &room_id, "tab-1").await;
    let roster = wait_for(&mut ws, MessageType::Roster).await;
    assert_eq!(
        roster.roster_entries().unwrap()[0].user.email,
        "dev@local.test"
    );
}

#[tokio::test]
async fn test_delta_fanout_between_clients() {
    let (addr, store) = start_test_server(test_config()).await;
    let record = store.create_record(&ctx(), "Shared").await.unwrap();
    let room_id = create_room_id(&record.slug, &record.id);

    let conn1 = Uuid::new_v4();
    let mut ws1 = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "alice@example.com"))).await;
    send_join(&mut ws1, conn1, &room_id, "tab-alice").await;
    wait_for(&mut ws1, MessageType::SyncStep2).await;

    let conn2 = Uuid::new_v4();
    let mut ws2 = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "bob@example.com"))).await;
    send_join(&mut ws2, conn2, &room_id, "tab-bob").await;
    wait_for(&mut ws2, MessageType::SyncStep2).await;

    // Alice edits her replica and ships the delta.
    let doc = yrs::Doc::new();
    let update = {
        use yrs::{Text, Transact, WriteTxn};
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("context");
        text.insert(&mut txn, 0, "teams ship faster with fewer meetings");
        drop(txn);
        use yrs::ReadTxn;
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    };
    let delta = SyncMessage::delta(conn1, &room_id, 1, update.clone());
    ws1.send(Message::Binary(delta.encode().unwrap().into()))
        .await
        .unwrap();

    // Bob receives it verbatim.
    let received = wait_for(&mut ws2, MessageType::Delta).await;
    assert_eq!(received.conn_id, conn1);
    assert_eq!(received.payload, update);

    // A late joiner gets the contribution folded into the full state.
    let conn3 = Uuid::new_v4();
    let mut ws3 = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "carol@example.com"))).await;
    send_join(&mut ws3, conn3, &room_id, "tab-carol").await;
    let state = wait_for(&mut ws3, MessageType::SyncStep2).await;

    let replica = yrs::Doc::new();
    {
        use yrs::updates::decoder::Decode;
        use yrs::Transact;
        let mut txn = replica.transact_mut();
        txn.apply_update(yrs::Update::decode_v1(&state.payload).unwrap())
            .unwrap();
    }
    assert_eq!(
        field_string(&replica, "context"),
        "teams ship faster with fewer meetings"
    );
}

#[tokio::test]
async fn test_roster_tracks_joins_and_leaves() {
    let (addr, store) = start_test_server(test_config()).await;
    let record = store.create_record(&ctx(), "Roster Room").await.unwrap();
    let room_id = create_room_id(&record.slug, &record.id);

    let conn1 = Uuid::new_v4();
    let mut ws1 = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "alice@example.com"))).await;
    send_join(&mut ws1, conn1, &room_id, "tab-alice").await;
    wait_for(&mut ws1, MessageType::Roster).await;

    let conn2 = Uuid::new_v4();
    let mut ws2 = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "bob@example.com"))).await;
    send_join(&mut ws2, conn2, &room_id, "tab-bob").await;
    wait_for(&mut ws2, MessageType::Roster).await;

    // Alice sees the two-member roster.
    let roster = wait_for(&mut ws1, MessageType::Roster).await;
    assert_eq!(roster.roster_entries().unwrap().len(), 2);

    // Bob leaves; Alice gets PeerLeft and a one-member roster.
    ws2.close(None).await.unwrap();
    let left = wait_for(&mut ws1, MessageType::PeerLeft).await;
    assert_eq!(left.conn_id, conn2);
    let roster = wait_for(&mut ws1, MessageType::Roster).await;
    let entries = roster.roster_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].user.email, "alice@example.com");
}

#[tokio::test]
async fn test_same_session_reconnect_dedups_in_roster() {
    let (addr, store) = start_test_server(test_config()).await;
    let record = store.create_record(&ctx(), "Dedup Room").await.unwrap();
    let room_id = create_room_id(&record.slug, &record.id);

    let conn1 = Uuid::new_v4();
    let mut ws1 = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "alice@example.com"))).await;
    send_join(&mut ws1, conn1, &room_id, "tab-alice").await;
    wait_for(&mut ws1, MessageType::Roster).await;

    // A second connection from the same browser tab (same session id), as
    // during the reconnect overlap window. The pause keeps the announce
    // timestamps strictly ordered.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let conn2 = Uuid::new_v4();
    let mut ws2 = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "alice@example.com"))).await;
    send_join(&mut ws2, conn2, &room_id, "tab-alice").await;

    let roster = wait_for(&mut ws2, MessageType::Roster).await;
    let entries = roster.roster_entries().unwrap();
    assert_eq!(entries.len(), 1, "same session must collapse to one entry");
    assert_eq!(entries[0].conn_id, conn2, "newest announce wins");
}

#[tokio::test]
async fn test_presence_update_refreshes_roster() {
    let (addr, store) = start_test_server(test_config()).await;
    let record = store.create_record(&ctx(), "Cursors").await.unwrap();
    let room_id = create_room_id(&record.slug, &record.id);

    let conn1 = Uuid::new_v4();
    let mut ws1 = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "alice@example.com"))).await;
    send_join(&mut ws1, conn1, &room_id, "tab-alice").await;
    wait_for(&mut ws1, MessageType::Roster).await;

    let conn2 = Uuid::new_v4();
    let mut ws2 = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "bob@example.com"))).await;
    send_join(&mut ws2, conn2, &room_id, "tab-bob").await;
    wait_for(&mut ws2, MessageType::Roster).await;

    // Bob moves his cursor into the tension field.
    let entry = PresenceEntry::new(conn2, UserInfo::from_email("bob@example.com"), "tab-bob")
        .with_cursor("tension", 7);
    let presence = SyncMessage::presence(conn2, &room_id, 2, &entry).unwrap();
    ws2.send(Message::Binary(presence.encode().unwrap().into()))
        .await
        .unwrap();

    // Alice's next roster carries the cursor.
    let roster = wait_for(&mut ws1, MessageType::Roster).await;
    let entries = roster.roster_entries().unwrap();
    let bob = entries
        .iter()
        .find(|e| e.user.email == "bob@example.com")
        .expect("bob in roster");
    let cursor = bob.cursor.as_ref().expect("cursor announced");
    assert_eq!(cursor.field, "tension");
    assert_eq!(cursor.offset, 7);
}

#[tokio::test]
async fn test_abrupt_disconnect_clears_presence() {
    let (addr, store) = start_test_server(test_config()).await;
    let record = store.create_record(&ctx(), "Ghost Check").await.unwrap();
    let room_id = create_room_id(&record.slug, &record.id);

    let conn1 = Uuid::new_v4();
    let mut ws1 = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "alice@example.com"))).await;
    send_join(&mut ws1, conn1, &room_id, "tab-alice").await;
    wait_for(&mut ws1, MessageType::Roster).await;

    let conn2 = Uuid::new_v4();
    let mut ws2 = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "bob@example.com"))).await;
    send_join(&mut ws2, conn2, &room_id, "tab-bob").await;
    let roster = wait_for(&mut ws2, MessageType::Roster).await;
    assert_eq!(roster.roster_entries().unwrap().len(), 2);

    // Alice's connection dies without a close handshake: a zero-linger
    // drop resets the TCP stream, as when a laptop lid closes mid-edit.
    match ws1.get_ref() {
        MaybeTlsStream::Plain(stream) => {
            stream.set_linger(Some(Duration::from_secs(0))).unwrap()
        }
        _ => panic!("expected a plain TCP stream"),
    }
    drop(ws1);

    // Bob's edit wakes the server's forwarding path toward the dead peer.
    let delta = SyncMessage::delta(conn2, &room_id, 1, vec![0, 0]);
    ws2.send(Message::Binary(delta.encode().unwrap().into()))
        .await
        .unwrap();

    // Either exit path must still run teardown: Alice leaves the roster
    // rather than lingering as a ghost entry.
    let left = wait_for(&mut ws2, MessageType::PeerLeft).await;
    assert_eq!(left.conn_id, conn1);
    let roster = wait_for(&mut ws2, MessageType::Roster).await;
    let entries = roster.roster_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].user.email, "bob@example.com");
}

#[tokio::test]
async fn test_slow_hydration_does_not_stall_other_rooms() {
    let (addr, store) = start_test_server(test_config()).await;
    let slow_rec = store.create_record(&ctx(), "Cold Cache").await.unwrap();
    let fast_rec = store.create_record(&ctx(), "Warm Path").await.unwrap();
    let slow_room = create_room_id(&slow_rec.slug, &slow_rec.id);
    let fast_room = create_room_id(&fast_rec.slug, &fast_rec.id);

    store
        .set_snapshot_load_delay(Some(Duration::from_millis(1500)))
        .await;

    // First connect to the slow room starts its hydration. The delay is
    // sampled when the load begins, so clearing the knob afterwards
    // leaves only that room stalled.
    let mut slow = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "alice@example.com"))).await;
    send_join(&mut slow, Uuid::new_v4(), &slow_room, "tab-slow").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    store.set_snapshot_load_delay(None).await;

    // A second room must admit and serve while the first still hydrates.
    let started = std::time::Instant::now();
    let mut fast = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "bob@example.com"))).await;
    send_join(&mut fast, Uuid::new_v4(), &fast_room, "tab-fast").await;
    wait_for(&mut fast, MessageType::SyncStep2).await;
    assert!(
        started.elapsed() < Duration::from_millis(700),
        "second room waited on the first room's hydration"
    );

    // The slow room still comes up once its load completes.
    let state = wait_for(&mut slow, MessageType::SyncStep2).await;
    assert!(!state.payload.is_empty());
}

#[tokio::test]
async fn test_concurrent_first_joins_share_one_room() {
    let (addr, store) = start_test_server(test_config()).await;
    let record = store.create_record(&ctx(), "First Light").await.unwrap();
    let room_id = create_room_id(&record.slug, &record.id);

    // Hydration takes long enough that both joins overlap it.
    store
        .set_snapshot_load_delay(Some(Duration::from_millis(300)))
        .await;

    let conn1 = Uuid::new_v4();
    let mut ws1 = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "alice@example.com"))).await;
    send_join(&mut ws1, conn1, &room_id, "tab-alice").await;

    let conn2 = Uuid::new_v4();
    let mut ws2 = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "bob@example.com"))).await;
    send_join(&mut ws2, conn2, &room_id, "tab-bob").await;

    wait_for(&mut ws1, MessageType::SyncStep2).await;
    wait_for(&mut ws2, MessageType::SyncStep2).await;

    // One room, not two: the second joiner lands in the first one's
    // roster instead of a parallel instance.
    loop {
        let roster = wait_for(&mut ws2, MessageType::Roster).await;
        let entries = roster.roster_entries().unwrap();
        if entries.len() == 2 {
            break;
        }
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let (addr, _store) = start_test_server(test_config()).await;

    let conn_id = Uuid::new_v4();
    let mut ws = connect(addr, None).await;
    let ping = SyncMessage::ping(conn_id);
    ws.send(Message::Binary(ping.encode().unwrap().into()))
        .await
        .unwrap();

    let pong = wait_for(&mut ws, MessageType::Pong).await;
    assert_eq!(pong.conn_id, conn_id);
}

#[tokio::test]
async fn test_frame_before_join_closes_connection() {
    let (addr, _store) = start_test_server(test_config()).await;

    let mut ws = connect(addr, Some((CF_ACCESS_EMAIL_HEADER, "alice@example.com"))).await;
    let delta = SyncMessage::delta(Uuid::new_v4(), "some-room-abc", 1, vec![1, 2, 3]);
    ws.send(Message::Binary(delta.encode().unwrap().into()))
        .await
        .unwrap();

    assert_eq!(wait_for_close(&mut ws).await, "400 expected Join");
}
