//! Reconnect and catch-up tests: edits made while offline are delivered
//! exactly once after the connection comes back.

use futures_util::{SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use tessera_collab::protocol::{AckStatus, Envelope, Framing, Payload, SyncBody};
use tessera_collab::{
    Access, Backoff, Change, ClientConfig, ConnectionState, InProcessBus, MemoryStore, Operation, ServerConfig,
    StaticIdentity, SyncClient, SyncEvent, SyncServer, UserEntry,
};

async fn start_test_server() -> (SyncServer, String) {
    let identity = StaticIdentity::new([
        UserEntry::new("t-alice", "alice").writes("*"),
        UserEntry::new("t-bob", "bob").writes("*"),
    ]);
    let server = SyncServer::new(
        ServerConfig::default(),
        Arc::new(MemoryStore::new()),
        Arc::new(identity),
        Arc::new(InProcessBus::standalone()),
    );
    let (addr, _) = server.start("127.0.0.1:0").await.unwrap();
    (server, format!("ws://{addr}"))
}

fn client(url: &str, token: &str, user: &str, backoff: Backoff) -> SyncClient {
    let mut config = ClientConfig::new(url, token, "doc");
    config.backoff = backoff;
    SyncClient::connect(config, user, Uuid::new_v4())
}

async fn settled(client: &SyncClient, sequence: u64, within: Duration) {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if client.pending_len().await == 0 && client.known_sequence().await == sequence {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!(
        "client never settled at {sequence} (known {}, pending {})",
        client.known_sequence().await,
        client.pending_len().await
    );
}

#[tokio::test]
async fn test_offline_edits_replayed_once_after_reconnect() {
    let (_server, url) = start_test_server().await;
    let fast = Backoff::new(Duration::from_millis(50), Duration::from_millis(200), 5);
    let slow = Backoff::new(Duration::from_secs(3), Duration::from_secs(30), 5);

    let mut alice = client(&url, "t-alice", "alice", slow);
    let bob = client(&url, "t-bob", "bob", fast);
    let mut alice_events = alice.take_event_rx().unwrap();

    alice.edit(Operation::insert("body", 0, "hello")).await.unwrap();
    settled(&alice, 1, Duration::from_secs(3)).await;
    settled(&bob, 1, Duration::from_secs(3)).await;

    alice.interrupt().await;
    let dropped_at = Instant::now();
    timeout(Duration::from_secs(2), async {
        while let Some(event) = alice_events.recv().await {
            if matches!(event, SyncEvent::Reconnecting { .. }) {
                return;
            }
        }
    })
    .await
    .unwrap();

    // Two edits queue while offline; meanwhile the document moves on.
    alice.edit(Operation::insert("body", 5, " one")).await.unwrap();
    alice.edit(Operation::insert("body", 9, " two")).await.unwrap();
    assert_eq!(alice.pending_len().await, 2);
    assert_eq!(alice.text("body").await.as_deref(), Some("hello one two"));

    bob.edit(Operation::insert("body", 0, ">> ")).await.unwrap();
    settled(&bob, 2, Duration::from_secs(2)).await;

    settled(&alice, 4, Duration::from_secs(8)).await;
    assert!(dropped_at.elapsed() >= Duration::from_secs(3));
    assert_eq!(alice.state().await, ConnectionState::Connected);

    settled(&bob, 4, Duration::from_secs(2)).await;
    let expected = Some(">> hello one two".to_string());
    assert_eq!(alice.text("body").await, expected);
    assert_eq!(bob.text("body").await, expected);
}

#[tokio::test]
async fn test_edits_during_outage_keep_local_order() {
    let (_server, url) = start_test_server().await;
    let fast = Backoff::new(Duration::from_millis(200), Duration::from_millis(400), 5);
    let alice = client(&url, "t-alice", "alice", fast);

    alice.edit(Operation::insert("body", 0, "abc")).await.unwrap();
    settled(&alice, 1, Duration::from_secs(3)).await;

    alice.interrupt().await;
    for (i, ch) in ["1", "2", "3", "4"].into_iter().enumerate() {
        alice.edit(Operation::insert("body", 3 + i, ch)).await.unwrap();
    }
    settled(&alice, 5, Duration::from_secs(5)).await;
    assert_eq!(alice.text("body").await.as_deref(), Some("abc1234"));

    let reader = client(
        &url,
        "t-bob",
        "bob",
        Backoff::new(Duration::from_millis(50), Duration::from_millis(100), 3),
    );
    settled(&reader, 5, Duration::from_secs(3)).await;
    assert_eq!(reader.text("body").await.as_deref(), Some("abc1234"));
}

// ─── Lost acknowledgement ────────────────────────────────────────────────────

type Ws = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn raw_session(url: &str) -> Ws {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    for payload in [
        Payload::Auth {
            token: "t-alice".into(),
        },
        Payload::Open {
            document_id: "doc".into(),
            access: Access::Write,
        },
    ] {
        ws.send(Envelope::new(payload).to_message(Framing::Binary).unwrap())
            .await
            .unwrap();
    }
    ws
}

async fn next_payload<S>(ws: &mut S, pred: impl Fn(&Payload) -> bool) -> Payload
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    timeout(Duration::from_secs(3), async {
        loop {
            let msg = ws.next().await.unwrap().unwrap();
            if let Some((envelope, _)) = Envelope::from_message(&msg).unwrap() {
                if pred(&envelope.payload) {
                    return envelope.payload;
                }
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_resubmission_after_lost_ack_is_not_applied_twice() {
    let (server, url) = start_test_server().await;
    let client_id = Uuid::new_v4();
    let op = Operation::insert("body", 0, "once").with_origin("alice", 1, 1.0);
    let change = Change::new("alice", client_id, 1, 0, vec![op]);

    // Submit, then drop the connection without reading the ack.
    let mut first = raw_session(&url).await;
    next_payload(&mut first, |p| matches!(p, Payload::SyncResponse { .. })).await;
    first
        .send(
            Envelope::new(Payload::Change {
                document_id: "doc".into(),
                change: change.clone(),
            })
            .to_message(Framing::Binary)
            .unwrap(),
        )
        .await
        .unwrap();
    for _ in 0..100 {
        if server.rooms().get("doc").await.unwrap().sequence().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    drop(first);

    let mut second = raw_session(&url).await;
    let opened = next_payload(&mut second, |p| matches!(p, Payload::SyncResponse { .. })).await;
    let Payload::SyncResponse {
        body: SyncBody::Snapshot { snapshot, .. },
        ..
    } = opened
    else {
        panic!("expected open snapshot");
    };
    assert_eq!(snapshot.clients.get(&client_id), Some(&1));

    second
        .send(
            Envelope::new(Payload::Change {
                document_id: "doc".into(),
                change,
            })
            .to_message(Framing::Binary)
            .unwrap(),
        )
        .await
        .unwrap();
    let ack = next_payload(&mut second, |p| matches!(p, Payload::Ack { .. })).await;
    assert!(matches!(
        ack,
        Payload::Ack {
            client_seq: 1,
            sequence: 1,
            status: AckStatus::Duplicate,
            ..
        }
    ));

    let room = server.rooms().get("doc").await.unwrap();
    assert_eq!(room.sequence().await, 1);
    assert_eq!(room.snapshot().await.segments["body"], "once");
}
