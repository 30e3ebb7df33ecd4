//! Session: one participant's board, presence and transport in one loop.
//!
//! ```text
//!  Command (mpsc) ──┐
//!  SyncEvent ───────┼──► Session::run ──► Board ──► Surface
//!  ticker ──────────┘        │   ▲
//!                            │   └── LocalCache (replayed first)
//!                            ▼
//!                       SyncClient ──► relay
//! ```
//!
//! Every input is handled to completion before the next one is read.
//! A dropped connection is retried with exponential backoff and followed
//! by a full state-vector exchange, so nothing assumes stream continuity.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};

use tabula_core::{random_color, Board, BoardError, ShapeKey, ShapeRecord, Surface};

use crate::cache::LocalCache;
use crate::client::{ConnectionState, SyncClient, SyncEvent};
use crate::presence::{AwarenessMessage, PresenceChannel, PresenceConfig, PresenceEntry};
use crate::protocol::{PeerInfo, ProtocolError};
use crate::storage::StorageError;

/// First reconnect delay.
pub const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
/// Reconnect delays double up to this.
pub const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay base URL; the room name is appended as a path segment
    pub server_url: String,
    pub room: String,
    /// Display name announced to other peers
    pub name: String,
    /// Cursor color; random when unset
    pub color: Option<String>,
    /// Local cache directory (None = no cache)
    pub cache_path: Option<PathBuf>,
    /// Period of the housekeeping tick
    pub tick_interval: Duration,
    pub presence: PresenceConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            room: "default".to_string(),
            name: "Anonymous".to_string(),
            color: None,
            cache_path: None,
            tick_interval: Duration::from_millis(25),
            presence: PresenceConfig::default(),
        }
    }
}

/// User commands.
#[derive(Debug)]
pub enum Command {
    AddRectangle,
    AddCircle,
    DeleteLastAdded,
    MoveShape { key: ShapeKey, left: f64, top: f64 },
    Cursor { x: f64, y: f64 },
    Snapshot(oneshot::Sender<BoardSnapshot>),
    Shutdown,
}

/// Point-in-time view of the board and the other peers.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardSnapshot {
    pub entries: Vec<(ShapeKey, ShapeRecord)>,
    pub others: Vec<PresenceEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub connection: ConnectionState,
    /// Local cache content has been replayed
    pub cache_synced: bool,
    /// Other peers with live presence
    pub peers: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("local cache: {0}")]
    Cache(#[from] StorageError),
    #[error(transparent)]
    Board(#[from] BoardError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub struct Session<S: Surface> {
    board: Board<S>,
    presence: PresenceChannel,
    client: SyncClient,
    events: Option<mpsc::Receiver<SyncEvent>>,
    cache: Option<LocalCache>,
    tick_interval: Duration,
    status_tx: watch::Sender<SessionStatus>,
    backoff: Duration,
    next_reconnect: Option<Instant>,
}

impl<S: Surface> Session<S> {
    /// Build a session. Fails only if the local cache cannot be opened.
    pub fn new(config: SessionConfig, surface: S) -> Result<Self, SessionError> {
        let color = config.color.unwrap_or_else(|| random_color(&mut rand::rng()));
        let peer = PeerInfo::new(config.name, color.clone());
        let presence = PresenceChannel::with_config(peer.peer_id, color, config.presence);

        let cache = config
            .cache_path
            .map(|path| LocalCache::open(path, config.room.clone()))
            .transpose()?;

        let mut client = SyncClient::new(peer, config.room, config.server_url);
        let events = client.take_event_rx();

        let (status_tx, _) = watch::channel(SessionStatus {
            connection: ConnectionState::Disconnected,
            cache_synced: false,
            peers: 0,
        });

        Ok(Self {
            board: Board::new(surface),
            presence,
            client,
            events,
            cache,
            tick_interval: config.tick_interval,
            status_tx,
            backoff: RECONNECT_INITIAL,
            next_reconnect: None,
        })
    }

    /// Replay the local cache, then try to connect. A failed connect is
    /// retried from the run loop.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if let Some(cache) = &mut self.cache {
            let updates = cache.load()?;
            for update in &updates {
                if let Err(e) = self.board.apply_remote_update(update) {
                    log::warn!("Skipping unreadable cached update: {e}");
                }
            }
            cache.mark_synced(updates.len());
        }
        self.connect().await;
        self.publish_status().await;
        Ok(())
    }

    /// Drive the session until `Shutdown` or the command channel closes.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<Command>) {
        let Some(mut events) = self.events.take() else {
            log::error!("Session is already running");
            return;
        };
        let mut ticker = tokio::time::interval(self.tick_interval);

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(event) = events.recv() => self.handle_sync_event(event).await,
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.events = Some(events);
        self.shutdown().await;
    }

    pub async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddRectangle => {
                if let Err(e) = self.board.add_rectangle() {
                    log::warn!("Add rectangle failed: {e}");
                }
            }
            Command::AddCircle => {
                if let Err(e) = self.board.add_circle() {
                    log::warn!("Add circle failed: {e}");
                }
            }
            Command::DeleteLastAdded => {
                if let Some(key) = self.board.delete_last_added() {
                    log::debug!("Deleted {key}");
                }
            }
            Command::MoveShape { key, left, top } => {
                if let Err(e) = self.board.move_shape(&key, left, top) {
                    log::warn!("Move failed: {e}");
                }
            }
            Command::Cursor { x, y } => {
                if let Some(msg) = self.presence.set_local_cursor(x, y) {
                    self.send_presence(&msg).await;
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
        self.sync_pending().await;
    }

    pub async fn handle_sync_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Connected => {
                self.backoff = RECONNECT_INITIAL;
                self.next_reconnect = None;
                if let Err(e) = self.client.send_sync_step1(self.board.state_vector()).await {
                    log::warn!("Failed to start sync: {e}");
                }
                let announce = self.presence.announce();
                self.send_presence(&announce).await;
                self.send_presence(&AwarenessMessage::Query).await;
            }

            SyncEvent::Disconnected => {
                log::warn!("Connection lost, retrying in {:?}", self.backoff);
                self.presence.clear_remote();
                self.next_reconnect = Some(Instant::now() + self.backoff);
            }

            SyncEvent::SyncStep1(remote_sv) => match self.board.encode_diff(&remote_sv) {
                Ok(diff) => {
                    if let Err(e) = self.client.send_sync_step2(diff).await {
                        log::warn!("Failed to answer sync: {e}");
                    }
                }
                Err(e) => log::warn!("Bad state vector from server: {e}"),
            },

            // The relay's answer to our step 1 after every (re)connect: once
            // it is in, the surface is rebuilt from the full mapping.
            SyncEvent::SyncStep2(update) => {
                match self.board.apply_remote_update(&update) {
                    Ok(()) => self.cache_update(&update),
                    Err(e) => log::warn!("Dropping sync diff: {e}"),
                }
                self.board.resync();
            }

            SyncEvent::RemoteUpdate { update, .. } => match self.board.apply_remote_update(&update) {
                Ok(()) => self.cache_update(&update),
                Err(e) => log::warn!("Dropping remote update: {e}"),
            },

            SyncEvent::RemoteAwareness { message, .. } => {
                if let Some(reply) = self.presence.handle_message(&message) {
                    self.send_presence(&reply).await;
                }
            }

            SyncEvent::PeerJoined(info) => {
                log::info!("{} joined", info.name);
                self.presence.peer_joined(&info.peer_id);
            }

            SyncEvent::PeerLeft(peer_id) => {
                self.presence.remove_peer(&peer_id);
            }
        }
        self.sync_pending().await;
        self.publish_status().await;
    }

    /// Housekeeping: throttled cursor flush, presence renewal and expiry,
    /// reconnect attempts.
    pub async fn tick(&mut self) {
        if let Some(msg) = self.presence.flush_pending() {
            self.send_presence(&msg).await;
        }
        if self.client.connection_state().await == ConnectionState::Connected {
            if let Some(msg) = self.presence.renew() {
                self.send_presence(&msg).await;
            }
        }
        if !self.presence.prune_stale().is_empty() {
            self.publish_status().await;
        }

        if self.next_reconnect.is_some_and(|at| Instant::now() >= at) {
            self.next_reconnect = None;
            self.connect().await;
            self.publish_status().await;
        }
        self.sync_pending().await;
    }

    async fn connect(&mut self) {
        match self.client.connect().await {
            Ok(()) => {}
            Err(e) => {
                log::warn!("Connect to {} failed: {e}; retrying in {:?}", self.client.server_url(), self.backoff);
                self.next_reconnect = Some(Instant::now() + self.backoff);
                self.backoff = (self.backoff * 2).min(RECONNECT_MAX);
            }
        }
    }

    /// Ship local edits to the relay and the cache.
    async fn sync_pending(&mut self) {
        for update in self.board.take_outgoing() {
            self.cache_update(&update);
            if let Err(e) = self.client.send_update(update).await {
                log::warn!("Failed to send update: {e}");
            }
        }
    }

    fn cache_update(&self, update: &[u8]) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.record(update) {
                log::warn!("Failed to cache update: {e}");
            }
        }
    }

    async fn send_presence(&self, msg: &AwarenessMessage) {
        if let Err(e) = self.client.send_awareness(msg).await {
            log::debug!("Failed to send presence: {e}");
        }
    }

    async fn publish_status(&self) {
        let status = SessionStatus {
            connection: self.client.connection_state().await,
            cache_synced: self.cache.as_ref().is_some_and(LocalCache::is_synced),
            peers: self.presence.peer_count(),
        };
        self.status_tx.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    /// Leave presence, close the transport, fold the cache into one snapshot.
    pub async fn shutdown(&mut self) {
        let leave = self.presence.leave_message();
        self.send_presence(&leave).await;
        self.client.disconnect().await;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.compact(&self.board.encode_state()).and_then(|_| cache.flush()) {
                log::warn!("Failed to compact local cache: {e}");
            }
        }
        self.next_reconnect = None;
        self.publish_status().await;
        log::info!("Session closed");
    }

    // ─── Accessors ───────────────────────────────────────────────────

    pub fn snapshot(&self) -> BoardSnapshot {
        BoardSnapshot {
            entries: self.board.entries(),
            others: self.presence.others(),
        }
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn presence(&self) -> watch::Receiver<Vec<PresenceEntry>> {
        self.presence.subscribe()
    }

    pub fn board(&self) -> &Board<S> {
        &self.board
    }

    pub fn peer_info(&self) -> &PeerInfo {
        self.client.peer_info()
    }
}
