//! Integration tests for real-time presence and cursor synchronization.
//!
//! These tests start a real server and connect two clients, verifying
//! join/leave notices, cursor broadcast and activity demotion through the
//! full network stack.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use tessera_collab::{
    Activity, Backoff, ClientConfig, CursorPosition, InProcessBus, MemoryStore, PresenceEvent, PresenceState,
    Selection, ServerConfig, StaticIdentity, SyncClient, SyncEvent, SyncServer, UserEntry,
};

/// Start a server on a free port, return its URL.
async fn start_test_server(config: ServerConfig) -> (SyncServer, String) {
    let identity = StaticIdentity::new([
        UserEntry::new("t-alice", "alice").writes("*"),
        UserEntry::new("t-bob", "bob").writes("*"),
    ]);
    let server = SyncServer::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(identity),
        Arc::new(InProcessBus::standalone()),
    );
    let (addr, _) = server.start("127.0.0.1:0").await.unwrap();
    (server, format!("ws://{addr}"))
}

/// Connect a client and wait until its document is open.
async fn open_client(url: &str, token: &str, user: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut config = ClientConfig::new(url, token, "doc");
    config.backoff = Backoff::new(Duration::from_millis(50), Duration::from_millis(200), 3);
    let mut client = SyncClient::connect(config, user, Uuid::new_v4());
    let mut events = client.take_event_rx().unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Resynced(_))).await;
    (client, events)
}

async fn wait_for(events: &mut mpsc::Receiver<SyncEvent>, pred: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
    timeout(Duration::from_secs(3), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Next `Updated` presence for `user`.
async fn next_update(events: &mut mpsc::Receiver<SyncEvent>, user: &str) -> PresenceState {
    let event = wait_for(events, |e| {
        matches!(e, SyncEvent::Presence(PresenceEvent::Updated(s)) if s.user_id == user)
    })
    .await;
    match event {
        SyncEvent::Presence(PresenceEvent::Updated(state)) => state,
        other => panic!("expected update, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_is_announced_to_existing_peers() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let (_alice, mut alice_events) = open_client(&url, "t-alice", "alice").await;
    let (_bob, _) = open_client(&url, "t-bob", "bob").await;

    let joined = wait_for(&mut alice_events, |e| {
        matches!(e, SyncEvent::Presence(PresenceEvent::Joined(s)) if s.user_id == "bob")
    })
    .await;
    let SyncEvent::Presence(PresenceEvent::Joined(state)) = joined else {
        unreachable!()
    };
    assert_eq!(state.document_id, "doc");
    assert_eq!(state.activity, Activity::Active);
    assert!(state.cursor.is_none());
}

#[tokio::test]
async fn test_cursor_and_selection_reach_peer() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let (alice, _) = open_client(&url, "t-alice", "alice").await;
    let (_bob, mut bob_events) = open_client(&url, "t-bob", "bob").await;

    alice
        .set_cursor(Some(CursorPosition {
            segment: "body".into(),
            position: 4,
        }))
        .await;
    let state = next_update(&mut bob_events, "alice").await;
    assert_eq!(state.cursor.as_ref().map(|c| c.position), Some(4));

    alice
        .set_selection(Some(Selection {
            segment: "body".into(),
            start: 1,
            end: 3,
        }))
        .await;
    let state = next_update(&mut bob_events, "alice").await;
    assert_eq!(state.selection.as_ref().map(|s| (s.start, s.end)), Some((1, 3)));
    // Last write wins per field; the cursor is kept.
    assert_eq!(state.cursor.as_ref().map(|c| c.position), Some(4));
}

#[tokio::test]
async fn test_typing_demoted_after_timeout() {
    let (_server, url) = start_test_server(ServerConfig {
        typing_timeout_ms: 200,
        ..ServerConfig::default()
    })
    .await;
    let (alice, _) = open_client(&url, "t-alice", "alice").await;
    let (_bob, mut bob_events) = open_client(&url, "t-bob", "bob").await;

    alice.set_activity(Activity::Typing).await;
    assert_eq!(next_update(&mut bob_events, "alice").await.activity, Activity::Typing);
    assert_eq!(next_update(&mut bob_events, "alice").await.activity, Activity::Active);
}

#[tokio::test]
async fn test_leave_is_announced_once() {
    let (_server, url) = start_test_server(ServerConfig::default()).await;
    let (_alice, mut alice_events) = open_client(&url, "t-alice", "alice").await;
    let (bob, _) = open_client(&url, "t-bob", "bob").await;

    bob.disconnect().await;
    let left = wait_for(&mut alice_events, |e| {
        matches!(e, SyncEvent::Presence(PresenceEvent::Left { .. }))
    })
    .await;
    assert!(matches!(
        left,
        SyncEvent::Presence(PresenceEvent::Left { ref user_id, .. }) if user_id == "bob"
    ));

    let again = timeout(Duration::from_millis(300), async {
        loop {
            match alice_events.recv().await {
                Some(SyncEvent::Presence(PresenceEvent::Left { .. })) => return,
                Some(_) => {}
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(again.is_err(), "leave announced twice");
}

#[tokio::test]
async fn test_registry_tracks_open_connections() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let (_alice, _) = open_client(&url, "t-alice", "alice").await;
    let (bob, _) = open_client(&url, "t-bob", "bob").await;

    let mut users = Vec::new();
    for _ in 0..100 {
        users = server
            .presence()
            .list_active("doc")
            .await
            .into_iter()
            .map(|s| s.user_id)
            .collect();
        if users.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(users, vec!["alice", "bob"]);

    bob.disconnect().await;
    for _ in 0..100 {
        if server.presence().list_active("doc").await.len() == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("bob still listed after disconnect");
}
