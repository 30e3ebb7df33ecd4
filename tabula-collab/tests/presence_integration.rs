//! Integration tests for live cursors through the relay.
//!
//! These tests start a real server and connect sessions or raw clients,
//! verifying cursor broadcast, late-joiner queries and departure cleanup.

use std::sync::Arc;

use tabula_collab::client::{SyncClient, SyncEvent};
use tabula_collab::presence::{AwarenessMessage, CursorPosition};
use tabula_collab::protocol::PeerInfo;
use tabula_collab::server::{ServerConfig, SyncServer};
use tabula_collab::session::{BoardSnapshot, Command, Session, SessionConfig};
use tabula_core::MemorySurface;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Duration};

async fn start_test_server() -> (Arc<SyncServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

fn session(url: &str, name: &str, color: &str) -> Session<MemorySurface> {
    let config = SessionConfig {
        server_url: url.to_string(),
        room: "cursors".to_string(),
        name: name.to_string(),
        color: Some(color.to_string()),
        ..SessionConfig::default()
    };
    Session::new(config, MemorySurface::new()).unwrap()
}

async fn wait_for(tx: &mpsc::Sender<Command>, pred: impl Fn(&BoardSnapshot) -> bool) -> BoardSnapshot {
    timeout(Duration::from_secs(5), async {
        loop {
            let (reply, rx) = oneshot::channel();
            tx.send(Command::Snapshot(reply)).await.unwrap();
            let snap = rx.await.unwrap();
            if pred(&snap) {
                return snap;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached within 5s")
}

/// Connect a raw client and drain its `Connected` event.
async fn connect(url: &str, name: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(PeerInfo::new(name, "#00ff00"), "cursors", url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    assert_eq!(
        timeout(Duration::from_secs(2), events.recv()).await.unwrap(),
        Some(SyncEvent::Connected)
    );
    (client, events)
}

#[tokio::test]
async fn test_cursor_seen_by_other_session() {
    let (_server, url) = start_test_server().await;
    let mut a = session(&url, "Alice", "#ff0000");
    let mut b = session(&url, "Bob", "#0000ff");
    let a_id = a.peer_info().peer_id;
    let b_id = b.peer_info().peer_id;
    a.start().await.unwrap();
    b.start().await.unwrap();

    let (tx_a, rx_a) = mpsc::channel(16);
    let (tx_b, rx_b) = mpsc::channel(16);

    let driver = async {
        tx_a.send(Command::Cursor { x: 100.0, y: 200.0 }).await.unwrap();

        let on_b = wait_for(&tx_b, |s| {
            s.others
                .iter()
                .any(|e| e.peer_id == a_id && e.cursor == Some(CursorPosition::new(100.0, 200.0)))
        })
        .await;
        assert_eq!(on_b.others.len(), 1);
        assert_eq!(on_b.others[0].color, "#ff0000");

        // Own entry never shows up among the others.
        let on_a = wait_for(&tx_a, |s| s.others.iter().any(|e| e.peer_id == b_id)).await;
        assert!(on_a.others.iter().all(|e| e.peer_id != a_id));

        tx_a.send(Command::Shutdown).await.unwrap();
        wait_for(&tx_b, |s| s.others.is_empty()).await;
        tx_b.send(Command::Shutdown).await.unwrap();
    };
    tokio::join!(a.run(rx_a), b.run(rx_b), driver);
}

#[tokio::test]
async fn test_awareness_relayed_between_clients() {
    let (_server, url) = start_test_server().await;
    let (alice, _alice_events) = connect(&url, "Alice").await;
    let (_bob, mut bob_events) = connect(&url, "Bob").await;
    sleep(Duration::from_millis(50)).await;

    let update = AwarenessMessage::Update {
        peer_id: alice.peer_info().peer_id,
        clock: 1,
        color: "#00ff00".into(),
        cursor: Some(CursorPosition::new(12.5, 7.0)),
    };
    alice.send_awareness(&update).await.unwrap();

    let received = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(SyncEvent::RemoteAwareness { message, .. }) = bob_events.recv().await {
                return message;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(received, update);
}

#[tokio::test]
async fn test_late_joiner_queries_presence() {
    let (_server, url) = start_test_server().await;
    let mut a = session(&url, "Alice", "#ff0000");
    let a_id = a.peer_info().peer_id;
    a.start().await.unwrap();
    let (tx_a, rx_a) = mpsc::channel(16);

    let (bob, mut bob_events) = connect(&url, "Bob").await;

    let driver = async {
        tx_a.send(Command::Cursor { x: 5.0, y: 6.0 }).await.unwrap();
        sleep(Duration::from_millis(200)).await;
        while bob_events.try_recv().is_ok() {}

        // Bob's query makes Alice re-announce.
        bob.send_awareness(&AwarenessMessage::Query).await.unwrap();
        let state = timeout(Duration::from_secs(2), async {
            loop {
                if let Some(SyncEvent::RemoteAwareness {
                    message: msg @ AwarenessMessage::Update { .. },
                    peer_id,
                }) = bob_events.recv().await
                {
                    if peer_id == a_id {
                        return msg;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(
            state,
            AwarenessMessage::Update { cursor: Some(c), .. } if c == CursorPosition::new(5.0, 6.0)
        ));

        tx_a.send(Command::Shutdown).await.unwrap();
    };
    tokio::join!(a.run(rx_a), driver);
}

#[tokio::test]
async fn test_departed_peer_removed_from_presence() {
    let (_server, url) = start_test_server().await;
    let mut a = session(&url, "Alice", "#ff0000");
    a.start().await.unwrap();
    let (tx_a, rx_a) = mpsc::channel(16);

    let (mut bob, _bob_events) = connect(&url, "Bob").await;
    let bob_id = bob.peer_info().peer_id;

    let driver = async {
        sleep(Duration::from_millis(50)).await;
        bob.send_awareness(&AwarenessMessage::Update {
            peer_id: bob_id,
            clock: 1,
            color: "#00ff00".into(),
            cursor: None,
        })
        .await
        .unwrap();
        wait_for(&tx_a, |s| s.others.iter().any(|e| e.peer_id == bob_id)).await;

        // No Leave message: the relay's PeerLeft must be enough.
        bob.disconnect().await;
        wait_for(&tx_a, |s| s.others.is_empty()).await;

        tx_a.send(Command::Shutdown).await.unwrap();
    };
    tokio::join!(a.run(rx_a), driver);
}
