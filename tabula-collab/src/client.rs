//! WebSocket sync client for connecting to the relay server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Update and handshake send/receive
//! - Presence (cursor/color) messages
//!
//! Edits made while offline are not queued here: the shape store keeps
//! them, and the session resynchronizes by state vector on reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Incremental update from a remote peer
    RemoteUpdate { peer_id: Uuid, update: Vec<u8> },
    /// Server asks for what it is missing
    SyncStep1(Vec<u8>),
    /// Diff answering our state vector
    SyncStep2(Vec<u8>),
    /// Presence message from a remote peer
    RemoteAwareness { peer_id: Uuid, message: AwarenessMessage },
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
}

/// The sync client.
pub struct SyncClient {
    peer_info: PeerInfo,
    room: String,
    server_url: String,

    state: Arc<RwLock<ConnectionState>>,

    /// Per-sender message counter
    clock: AtomicU64,

    /// Channel to the websocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,

    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, room: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_info,
            room: room.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: AtomicU64::new(0),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            tasks: Vec::new(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to `<server_url>/<room>` and announce ourselves.
    ///
    /// Spawns a reader and a writer task. The reader emits `Disconnected`
    /// when the socket closes.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.abort_tasks();
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.server_url.trim_end_matches('/'), self.room);
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                log::debug!("Connect to {url} failed: {e}");
                return Err(ProtocolError::ConnectFailed(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());

        self.tasks.push(tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        }));

        let join = SyncMessage::peer_joined(&self.room, &self.peer_info)?.encode()?;
        out_tx.send(join).await.map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Connected;
        log::info!("Connected to {url} as {}", self.peer_info.peer_id);
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let peer_id = self.peer_info.peer_id;
        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let Ok(sync_msg) = SyncMessage::decode(&data) else {
                            log::debug!("Dropping undecodable frame ({} bytes)", data.len());
                            continue;
                        };
                        if sync_msg.peer_id == peer_id {
                            continue;
                        }
                        if let Some(event) = Self::to_event(sync_msg) {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            log::info!("Disconnected from server");
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        }));

        Ok(())
    }

    fn to_event(msg: SyncMessage) -> Option<SyncEvent> {
        match msg.msg_type {
            MessageType::Update => Some(SyncEvent::RemoteUpdate {
                peer_id: msg.peer_id,
                update: msg.payload,
            }),
            MessageType::SyncStep1 => Some(SyncEvent::SyncStep1(msg.payload)),
            MessageType::SyncStep2 => Some(SyncEvent::SyncStep2(msg.payload)),
            MessageType::Awareness => match msg.awareness_message() {
                Ok(message) => Some(SyncEvent::RemoteAwareness {
                    peer_id: msg.peer_id,
                    message,
                }),
                Err(e) => {
                    log::debug!("Bad presence payload from {}: {e}", msg.peer_id);
                    None
                }
            },
            MessageType::PeerJoined => msg.peer_info().ok().map(SyncEvent::PeerJoined),
            MessageType::PeerLeft => Some(SyncEvent::PeerLeft(msg.peer_id)),
        }
    }

    /// Send an incremental update. Dropped while offline.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        let clock = self.next_clock();
        self.send(SyncMessage::update(self.peer_info.peer_id, &self.room, clock, update))
            .await
    }

    pub async fn send_sync_step1(&self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(SyncMessage::sync_step1(self.peer_info.peer_id, &self.room, state_vector))
            .await
    }

    pub async fn send_sync_step2(&self, diff: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(SyncMessage::sync_step2(self.peer_info.peer_id, &self.room, diff))
            .await
    }

    pub async fn send_awareness(&self, message: &AwarenessMessage) -> Result<(), ProtocolError> {
        let clock = self.next_clock();
        let msg = SyncMessage::awareness(self.peer_info.peer_id, &self.room, clock, message)?;
        self.send(msg).await
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            log::trace!("Offline, dropping {:?}", msg.msg_type);
            return Ok(());
        }
        let encoded = msg.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Ok(()),
        }
    }

    fn next_clock(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Close the connection. No `Disconnected` event is emitted.
    pub async fn disconnect(&mut self) {
        let mut tasks: Vec<_> = self.tasks.drain(..).collect();
        // tasks = [writer, reader]
        if let Some(reader) = tasks.pop() {
            reader.abort();
        }
        // Dropping the sender lets the writer send a close frame.
        self.outgoing_tx = None;
        if let Some(writer) = tasks.pop() {
            let _ = tokio::time::timeout(std::time::Duration::from_millis(200), writer).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        log::info!("Disconnected from server");
    }

    fn abort_tasks(&mut self) {
        self.outgoing_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
