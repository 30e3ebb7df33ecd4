//! WebSocket relay server with named rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room ("lobby") ── yrs Doc ── BroadcastGroup
//! Client B ──┘        │
//!                     └── DocumentStore (RocksDB, optional)
//!                             ├── updates as they arrive
//!                             └── snapshot when the room empties
//! ```
//!
//! Join sequence for one connection:
//! ```text
//! client                         server
//!   │── PeerJoined(room) ────────►│  room created / restored from disk
//!   │◄──────── SyncStep1(sv_s) ───│
//!   │◄──────── PeerJoined(...) ───│  one per peer already in the room
//!   │── SyncStep1(sv_c) ─────────►│
//!   │◄──────── SyncStep2(diff) ───│
//!   │── SyncStep2(diff) ─────────►│  applied, persisted, relayed as Update
//! ```
//!
//! Each room keeps an authoritative yrs `Doc` so late joiners can be
//! brought up to date without any other peer online.
//!
//! Peers are added to and removed from a room only under the `rooms` write
//! lock, so a room is dropped from the map exactly when its last peer leaves
//! and a joiner never lands on a room that is no longer served.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::broadcast::{BroadcastGroup, Envelope};
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::storage::{DocumentStore, StorageError, StoreConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Joins beyond this are refused
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Websocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Persistence path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_updates: u64,
    pub persisted_snapshots: u64,
    pub rejected_peers: u64,
}

/// Room: authoritative doc + fan-out group.
struct DocumentRoom {
    doc: yrs::Doc,
    broadcast: BroadcastGroup,
    /// Newest stored update version already folded into `doc`.
    persisted: AtomicU64,
}

impl DocumentRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: yrs::Doc::new(),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            persisted: AtomicU64::new(0),
        }
    }

    fn apply(&self, update: &[u8]) -> Result<(), String> {
        let update = Update::decode_v1(update).map_err(|e| e.to_string())?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update).map_err(|e| e.to_string())
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, String> {
        let sv = StateVector::decode_v1(remote_sv).map_err(|e| e.to_string())?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    fn full_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }
}

/// State shared by every connection task.
struct Shared {
    config: ServerConfig,
    rooms: RwLock<HashMap<String, Arc<DocumentRoom>>>,
    stats: RwLock<ServerStats>,
    store: Option<Arc<DocumentStore>>,
}

/// Per-connection state.
struct Connection {
    addr: SocketAddr,
    peer: Option<PeerInfo>,
    room: Option<(String, Arc<DocumentRoom>)>,
    rx: Option<broadcast::Receiver<Envelope>>,
}

/// The relay server.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Create a server, opening storage if a path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StorageError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(DocumentStore::open(StoreConfig::at(path.clone()))?)),
            None => None,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                rooms: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
                store,
            }),
        })
    }

    /// In-memory server with the default configuration.
    pub fn with_defaults() -> Self {
        Self {
            shared: Arc::new(Shared {
                config: ServerConfig::default(),
                rooms: RwLock::new(HashMap::new()),
                stats: RwLock::new(ServerStats::default()),
                store: None,
            }),
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection {
            addr,
            peer: None,
            room: None,
            rx: None,
        };
        let mut heartbeat = tokio::time::interval(Duration::from_secs(shared.config.heartbeat_interval_secs.max(1)));
        heartbeat.tick().await;

        let outcome: Result<(), BoxError> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            match Self::handle_frame(&shared, &mut conn, &mut ws_sender, &data).await {
                                Ok(true) => {}
                                Ok(false) => break Ok(()),
                                Err(e) => break Err(e),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        _ => {}
                    }
                }

                frame = async {
                    match conn.rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(envelope) => {
                            if conn.peer.as_ref().is_some_and(|p| p.peer_id == envelope.from) {
                                continue;
                            }
                            if let Err(e) = ws_sender.send(Message::Binary(envelope.bytes.to_vec().into())).await {
                                break Err(e.into());
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer at {addr} lagged by {n} messages");
                            if let Some((_, room)) = &conn.room {
                                room.broadcast.record_dropped(n);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break Ok(()),
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = ws_sender.send(Message::Ping(Vec::new().into())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        Self::leave(&shared, conn).await;
        outcome
    }

    /// Handle one binary frame. Returns `false` to close the connection.
    async fn handle_frame(
        shared: &Shared,
        conn: &mut Connection,
        ws_sender: &mut WsSink,
        bytes: &[u8],
    ) -> Result<bool, BoxError> {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode message from {}: {e}", conn.addr);
                return Ok(true);
            }
        };

        {
            let mut s = shared.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += bytes.len() as u64;
        }

        if msg.msg_type == MessageType::PeerJoined {
            return Self::join(shared, conn, ws_sender, &msg).await;
        }

        let (Some(peer), Some((room_name, room))) = (&conn.peer, &conn.room) else {
            log::debug!("Ignoring {:?} from {} before join", msg.msg_type, conn.addr);
            return Ok(true);
        };

        match msg.msg_type {
            MessageType::SyncStep1 => match room.diff(&msg.payload) {
                Ok(diff) => {
                    let reply = SyncMessage::sync_step2(Uuid::nil(), room_name, diff);
                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                }
                Err(e) => log::warn!("Bad state vector from {}: {e}", peer.peer_id),
            },

            MessageType::SyncStep2 | MessageType::Update => {
                if !Self::integrate(shared, room_name, room, &msg.payload).await {
                    return Ok(true);
                }
                // A step-2 diff holds edits the rest of the room hasn't seen.
                let relay = SyncMessage::update(peer.peer_id, room_name, msg.clock, msg.payload);
                room.broadcast.broadcast(&relay)?;
            }

            MessageType::Awareness => {
                match AwarenessMessage::decode(&msg.payload) {
                    Ok(AwarenessMessage::Leave { peer_id }) => log::info!("Presence: {peer_id} left room {room_name}"),
                    Ok(_) => log::trace!("Presence traffic in room {room_name}"),
                    Err(e) => log::debug!("Undecodable presence payload: {e}"),
                }
                room.broadcast.broadcast_raw(peer.peer_id, Arc::new(bytes.to_vec()));
            }

            other => log::debug!("Unhandled message type: {other:?}"),
        }

        Ok(true)
    }

    async fn join(
        shared: &Shared,
        conn: &mut Connection,
        ws_sender: &mut WsSink,
        msg: &SyncMessage,
    ) -> Result<bool, BoxError> {
        if conn.peer.is_some() {
            log::debug!("Duplicate join from {}", conn.addr);
            return Ok(true);
        }
        let info = msg
            .peer_info()
            .unwrap_or_else(|_| PeerInfo::with_id(msg.peer_id, "Anonymous", "#808080"));
        let room_name = msg.room.clone();

        let admitted = {
            let mut rooms = shared.rooms.write().await;
            let room = match rooms.get(&room_name) {
                Some(room) => room.clone(),
                None => {
                    let room = Arc::new(DocumentRoom::new(shared.config.broadcast_capacity));
                    Self::restore(shared, &room_name, &room).await;
                    rooms.insert(room_name.clone(), room.clone());
                    room
                }
            };

            if room.broadcast.peer_count().await >= shared.config.max_peers_per_room {
                if room.broadcast.peer_count().await == 0 {
                    rooms.remove(&room_name);
                }
                None
            } else {
                let existing = room.broadcast.peers().await;
                let rx = room.broadcast.add_peer(info.clone()).await;
                let server_sv = room.state_vector();
                shared.stats.write().await.active_rooms = rooms.len();
                Some((room, rx, existing, server_sv))
            }
        };

        let Some((room, rx, existing, server_sv)) = admitted else {
            log::warn!("Room {room_name} is full, refusing {}", info.peer_id);
            shared.stats.write().await.rejected_peers += 1;
            ws_sender.send(Message::Close(None)).await?;
            return Ok(false);
        };

        // Registered from here on: `leave` runs whatever happens next.
        conn.rx = Some(rx);
        conn.peer = Some(info.clone());
        conn.room = Some((room_name.clone(), room.clone()));

        ws_sender
            .send(Message::Binary(SyncMessage::sync_step1(Uuid::nil(), &room_name, server_sv).encode()?.into()))
            .await?;
        for other in &existing {
            let notice = SyncMessage::peer_joined(&room_name, other)?;
            ws_sender.send(Message::Binary(notice.encode()?.into())).await?;
        }
        room.broadcast.broadcast(&SyncMessage::peer_joined(&room_name, &info)?)?;

        log::info!("Peer {} ({}) joined room {room_name}", info.name, info.peer_id);
        Ok(true)
    }

    /// Load a room's persisted state into a fresh doc.
    async fn restore(shared: &Shared, room_name: &str, room: &DocumentRoom) {
        let Some(store) = shared.store.clone() else {
            return;
        };
        let name = room_name.to_string();
        let loaded = tokio::task::spawn_blocking(move || {
            let version = store.latest_version(&name)?;
            Ok::<_, StorageError>((version, store.load_state(&name)?))
        })
        .await;

        match loaded {
            Ok(Ok((version, updates))) => {
                for update in &updates {
                    if let Err(e) = room.apply(update) {
                        log::warn!("Skipping unreadable stored update for room {room_name}: {e}");
                    }
                }
                room.persisted.store(version, Ordering::Release);
                if !updates.is_empty() {
                    log::info!("Restored room {room_name} from {} stored entries", updates.len());
                }
            }
            Ok(Err(e)) => log::error!("Failed to load room {room_name}: {e}"),
            Err(e) => log::error!("Room loader for {room_name} panicked: {e}"),
        }
    }

    /// Apply an update to the room doc and persist it. Returns whether it
    /// was valid.
    async fn integrate(shared: &Shared, room_name: &str, room: &DocumentRoom, update: &[u8]) -> bool {
        if let Err(e) = room.apply(update) {
            log::warn!("Rejecting invalid update for room {room_name}: {e}");
            return false;
        }

        if let Some(store) = shared.store.clone() {
            let name = room_name.to_string();
            let bytes = update.to_vec();
            match tokio::task::spawn_blocking(move || store.store_update(&name, &bytes)).await {
                Ok(Ok(version)) => {
                    room.persisted.fetch_max(version, Ordering::AcqRel);
                    shared.stats.write().await.persisted_updates += 1;
                }
                Ok(Err(e)) => log::error!("Failed to persist update for room {room_name}: {e}"),
                Err(e) => log::error!("Update writer for room {room_name} panicked: {e}"),
            }
        }
        true
    }

    /// Deregister a connection; snapshot and drop the room when it empties.
    async fn leave(shared: &Shared, conn: Connection) {
        let closed = match (conn.peer, conn.room) {
            (Some(peer), Some((room_name, room))) => {
                let mut rooms = shared.rooms.write().await;
                room.broadcast.remove_peer(&peer.peer_id).await;
                if let Err(e) = room.broadcast.broadcast(&SyncMessage::peer_left(peer.peer_id, &room_name)) {
                    log::warn!("Failed to announce departure of {}: {e}", peer.peer_id);
                }
                log::info!("Peer {} left room {room_name}", peer.peer_id);

                let served = rooms.get(&room_name).is_some_and(|current| Arc::ptr_eq(current, &room));
                let closed = served && room.broadcast.peer_count().await == 0;
                if closed {
                    rooms.remove(&room_name);
                    log::info!("Room {room_name} removed (empty)");
                }
                shared.stats.write().await.active_rooms = rooms.len();
                closed.then_some((room_name, room))
            }
            _ => None,
        };

        if let (Some((room_name, room)), Some(store)) = (closed, shared.store.clone()) {
            // Only the updates this doc already holds are folded, so a room
            // reopened meanwhile keeps what it has written since.
            let through = room.persisted.load(Ordering::Acquire);
            let snapshot = room.full_state();
            let name = room_name.clone();
            match tokio::task::spawn_blocking(move || store.compact(&name, &snapshot, through)).await {
                Ok(Ok(_)) => {
                    shared.stats.write().await.persisted_snapshots += 1;
                    log::info!("Persisted snapshot for room {room_name} (room closing)");
                }
                Ok(Err(e)) => log::error!("Failed to persist snapshot for room {room_name}: {e}"),
                Err(e) => log::error!("Snapshot writer for room {room_name} panicked: {e}"),
            }
        }

        let mut s = shared.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }

    // ─── Introspection ───────────────────────────────────────────────

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.shared.store.as_ref()
    }

    pub async fn room_count(&self) -> usize {
        self.shared.rooms.read().await.len()
    }

    /// Full encoded state of a live room.
    pub async fn room_state(&self, room: &str) -> Option<Vec<u8>> {
        self.shared.rooms.read().await.get(room).map(|room| room.full_state())
    }
}
