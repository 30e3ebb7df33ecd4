//! Persistence integration tests.
//!
//! Verifies:
//! - Updates are stored as they reach the relay
//! - A room survives a relay restart
//! - Edits made offline reach the room through the local cache on reconnect

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tabula_collab::server::{ServerConfig, SyncServer};
use tabula_collab::session::{BoardSnapshot, Command, Session, SessionConfig};
use tabula_core::{MemorySurface, ShapeStore};
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn start_server_at(listener: TcpListener, db: &Path) -> (Arc<SyncServer>, JoinHandle<()>) {
    let config = ServerConfig {
        bind_addr: listener.local_addr().unwrap().to_string(),
        storage_path: Some(db.to_path_buf()),
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let serving = server.clone();
    let handle = tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, handle)
}

/// Stop a server once every connection has drained, releasing its database.
async fn stop_server(server: Arc<SyncServer>, handle: JoinHandle<()>) {
    timeout(Duration::from_secs(5), async {
        while server.stats().await.active_connections > 0 || server.room_count().await > 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("server did not drain");
    handle.abort();
    let _ = handle.await;
    drop(server);
    sleep(Duration::from_millis(100)).await;
}

fn session(url: &str, name: &str, cache: Option<PathBuf>) -> Session<MemorySurface> {
    let config = SessionConfig {
        server_url: url.to_string(),
        room: "durable".to_string(),
        name: name.to_string(),
        cache_path: cache,
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

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_updates_persisted_while_room_open() {
    let dir = tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (server, _handle) = start_server_at(listener, &dir.path().join("db")).await;

    let mut a = session(&url, "Alice", None);
    a.start().await.unwrap();
    let (tx_a, rx_a) = mpsc::channel(16);

    let driver = async {
        tx_a.send(Command::AddRectangle).await.unwrap();
        tx_a.send(Command::AddCircle).await.unwrap();
        wait_for(&tx_a, |s| s.entries.len() == 2).await;

        let store = server.store().unwrap().clone();
        timeout(Duration::from_secs(5), async {
            loop {
                let mut replica = ShapeStore::new();
                for update in store.load_state("durable").unwrap() {
                    replica.apply_update(&update).unwrap();
                }
                if replica.len() == 2 {
                    return;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("updates not persisted");
        assert!(server.stats().await.persisted_updates >= 2);

        tx_a.send(Command::Shutdown).await.unwrap();
    };
    tokio::join!(a.run(rx_a), driver);
}

#[tokio::test]
async fn test_room_survives_server_restart() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("db");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://{addr}");
    let (server, handle) = start_server_at(listener, &db).await;

    let mut a = session(&url, "Alice", None);
    a.start().await.unwrap();
    let (tx_a, rx_a) = mpsc::channel(16);
    let driver = async {
        tx_a.send(Command::AddRectangle).await.unwrap();
        tx_a.send(Command::AddRectangle).await.unwrap();
        wait_for(&tx_a, |s| s.entries.len() == 2).await;
        sleep(Duration::from_millis(100)).await;
        tx_a.send(Command::Shutdown).await.unwrap();
    };
    tokio::join!(a.run(rx_a), driver);
    let mut original = a.snapshot().entries;
    original.sort_by(|x, y| x.0.cmp(&y.0));

    stop_server(server, handle).await;

    let listener = TcpListener::bind(addr).await.unwrap();
    let (server, _handle) = start_server_at(listener, &db).await;
    let meta = server.store().unwrap().load_metadata("durable").unwrap();
    assert_eq!(meta.update_count, 0, "closing the room folds its updates");
    assert!(meta.snapshot_size > 0);

    let mut b = session(&url, "Bob", None);
    b.start().await.unwrap();
    let (tx_b, rx_b) = mpsc::channel(16);
    let driver = async {
        let mut restored = wait_for(&tx_b, |s| s.entries.len() == 2).await.entries;
        restored.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(restored, original);
        tx_b.send(Command::Shutdown).await.unwrap();
    };
    tokio::join!(b.run(rx_b), driver);
}

#[tokio::test]
async fn test_offline_edits_reach_room_after_reconnect() {
    let dir = tempdir().unwrap();
    let cache = dir.path().join("cache");

    // Edit with no relay running.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let url = format!("ws://{addr}");
    {
        let mut offline = session(&url, "Alice", Some(cache.clone()));
        offline.start().await.unwrap();
        offline.handle_command(Command::AddCircle).await;
        offline.handle_command(Command::AddRectangle).await;
        offline.shutdown().await;
    }

    let listener = TcpListener::bind(addr).await.unwrap();
    let (_server, _handle) = start_server_at(listener, &dir.path().join("db")).await;

    let mut a = session(&url, "Alice", Some(cache));
    let mut b = session(&url, "Bob", None);
    a.start().await.unwrap();
    assert!(a.status().borrow().cache_synced);
    assert_eq!(a.snapshot().entries.len(), 2);
    b.start().await.unwrap();

    let (tx_a, rx_a) = mpsc::channel(16);
    let (tx_b, rx_b) = mpsc::channel(16);
    let driver = async {
        let on_b = wait_for(&tx_b, |s| s.entries.len() == 2).await;
        let on_a = wait_for(&tx_a, |s| s.entries.len() == 2).await;
        let mut keys_a: Vec<_> = on_a.entries.into_iter().map(|(k, _)| k).collect();
        let mut keys_b: Vec<_> = on_b.entries.into_iter().map(|(k, _)| k).collect();
        keys_a.sort();
        keys_b.sort();
        assert_eq!(keys_a, keys_b);

        tx_a.send(Command::Shutdown).await.unwrap();
        tx_b.send(Command::Shutdown).await.unwrap();
    };
    tokio::join!(a.run(rx_a), b.run(rx_b), driver);
}
