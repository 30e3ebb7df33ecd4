//! Presence channel: live cursors and colors of the peers in a room.
//!
//! ## Architecture
//!
//! ```text
//! Local pointer move
//!       │
//!       ▼
//! PresenceChannel::set_local_cursor()
//!       │  (throttled: 33ms, latest position flushed on the next tick)
//!       ▼
//! AwarenessMessage::Update { clock, color, cursor }
//!       │
//!       ▼   (SyncMessage::Awareness over the relay)
//! Remote PresenceChannel::handle_message()
//!       │  (stale clocks dropped)
//!       ▼
//! watch::Receiver<Vec<PresenceEntry>>   (every *other* peer)
//! ```
//!
//! Presence is never persisted. An entry disappears on an explicit
//! `Leave`, when the relay reports the peer gone, when our own connection
//! drops, or when the peer stops renewing its state.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

/// Minimum spacing of outgoing cursor messages.
pub const CURSOR_THROTTLE: Duration = Duration::from_millis(33);
/// Remote entries not renewed within this window are dropped.
pub const PRESENCE_TIMEOUT: Duration = Duration::from_secs(30);
/// How often the local state is re-broadcast to keep it alive.
pub const RENEW_INTERVAL: Duration = Duration::from_secs(15);

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Cursor position in board coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// What one peer currently shows to the others.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub peer_id: Uuid,
    pub color: String,
    /// `None` until the peer first moves its pointer.
    pub cursor: Option<CursorPosition>,
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// Presence messages, carried inside `SyncMessage::Awareness` payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Full state of one peer. `clock` increases with every message the
    /// peer sends.
    Update {
        peer_id: Uuid,
        clock: u64,
        color: String,
        cursor: Option<CursorPosition>,
    },
    /// Clean departure.
    Leave { peer_id: Uuid },
    /// Ask every peer to re-announce its state.
    Query,
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| e.to_string())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(msg)
    }

    /// Sender of the message, if it names one.
    pub fn peer_id(&self) -> Option<Uuid> {
        match self {
            AwarenessMessage::Update { peer_id, .. } | AwarenessMessage::Leave { peer_id } => Some(*peer_id),
            AwarenessMessage::Query => None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Channel
// ───────────────────────────────────────────────────────────────────

/// Timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct PresenceConfig {
    pub cursor_throttle: Duration,
    pub timeout: Duration,
    pub renew_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            cursor_throttle: CURSOR_THROTTLE,
            timeout: PRESENCE_TIMEOUT,
            renew_interval: RENEW_INTERVAL,
        }
    }
}

#[derive(Debug)]
struct RemotePeer {
    entry: PresenceEntry,
    clock: u64,
    last_seen: Instant,
}

/// A peer that left. Its updates still in flight are dropped until the
/// relay announces it again.
#[derive(Debug)]
struct Departed {
    clock: u64,
    rejoined: bool,
    since: Instant,
}

/// Local presence state plus the view of every other peer in the room.
pub struct PresenceChannel {
    local_id: Uuid,
    color: String,
    cursor: Option<CursorPosition>,
    /// Clock of the last message we produced.
    clock: u64,
    peers: HashMap<Uuid, RemotePeer>,
    departed: HashMap<Uuid, Departed>,
    config: PresenceConfig,
    last_cursor_broadcast: Option<Instant>,
    last_broadcast: Option<Instant>,
    /// A throttled cursor move is waiting for `flush_pending`.
    cursor_pending: bool,
    watch_tx: watch::Sender<Vec<PresenceEntry>>,
}

impl PresenceChannel {
    pub fn new(local_id: Uuid, color: impl Into<String>) -> Self {
        Self::with_config(local_id, color, PresenceConfig::default())
    }

    pub fn with_config(local_id: Uuid, color: impl Into<String>, config: PresenceConfig) -> Self {
        let (watch_tx, _) = watch::channel(Vec::new());
        Self {
            local_id,
            color: color.into(),
            cursor: None,
            clock: 0,
            peers: HashMap::new(),
            departed: HashMap::new(),
            config,
            last_cursor_broadcast: None,
            last_broadcast: None,
            cursor_pending: false,
            watch_tx,
        }
    }

    // ─── Local state ─────────────────────────────────────────────────

    /// Replace the whole local state and broadcast it immediately.
    pub fn set_local_presence(&mut self, color: impl Into<String>, cursor: Option<CursorPosition>) -> AwarenessMessage {
        self.color = color.into();
        self.cursor = cursor;
        self.announce()
    }

    /// Move the local cursor. Returns a message unless throttled; a
    /// throttled position is sent later by [`flush_pending`](Self::flush_pending).
    pub fn set_local_cursor(&mut self, x: f64, y: f64) -> Option<AwarenessMessage> {
        self.cursor = Some(CursorPosition::new(x, y));

        let throttled = self
            .last_cursor_broadcast
            .is_some_and(|at| at.elapsed() < self.config.cursor_throttle);
        if throttled {
            self.cursor_pending = true;
            return None;
        }
        Some(self.announce())
    }

    /// Send the latest throttled cursor position once the throttle window
    /// has passed.
    pub fn flush_pending(&mut self) -> Option<AwarenessMessage> {
        if !self.cursor_pending {
            return None;
        }
        if self
            .last_cursor_broadcast
            .is_some_and(|at| at.elapsed() < self.config.cursor_throttle)
        {
            return None;
        }
        Some(self.announce())
    }

    /// Re-broadcast the local state if it hasn't gone out recently.
    pub fn renew(&mut self) -> Option<AwarenessMessage> {
        let due = self
            .last_broadcast
            .is_none_or(|at| at.elapsed() >= self.config.renew_interval);
        due.then(|| self.announce())
    }

    /// Current local state as an update message, bumping the clock.
    pub fn announce(&mut self) -> AwarenessMessage {
        let now = Instant::now();
        self.clock += 1;
        self.last_broadcast = Some(now);
        self.last_cursor_broadcast = Some(now);
        self.cursor_pending = false;

        log::trace!("Presence {} clock {} cursor {:?}", self.local_id, self.clock, self.cursor);
        AwarenessMessage::Update {
            peer_id: self.local_id,
            clock: self.clock,
            color: self.color.clone(),
            cursor: self.cursor,
        }
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave { peer_id: self.local_id }
    }

    pub fn local(&self) -> PresenceEntry {
        PresenceEntry {
            peer_id: self.local_id,
            color: self.color.clone(),
            cursor: self.cursor,
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    // ─── Remote state ────────────────────────────────────────────────

    /// Handle an incoming presence message. Returns a reply to send, if any.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) -> Option<AwarenessMessage> {
        if msg.peer_id() == Some(self.local_id) {
            return None;
        }

        match msg {
            AwarenessMessage::Update {
                peer_id,
                clock,
                color,
                cursor,
            } => {
                if let Some(known) = self.peers.get(peer_id) {
                    if *clock <= known.clock {
                        log::trace!("Stale presence from {peer_id}: {clock} <= {}", known.clock);
                        return None;
                    }
                }
                if let Some(gone) = self.departed.get(peer_id) {
                    if !gone.rejoined || *clock <= gone.clock {
                        log::trace!("Presence from departed peer {peer_id} dropped");
                        return None;
                    }
                    self.departed.remove(peer_id);
                }
                self.peers.insert(
                    *peer_id,
                    RemotePeer {
                        entry: PresenceEntry {
                            peer_id: *peer_id,
                            color: color.clone(),
                            cursor: *cursor,
                        },
                        clock: *clock,
                        last_seen: Instant::now(),
                    },
                );
                self.publish();
                None
            }

            AwarenessMessage::Leave { peer_id } => {
                self.remove_peer(peer_id);
                None
            }

            AwarenessMessage::Query => Some(self.announce()),
        }
    }

    /// Drop a peer (explicit leave or relay notice). Returns whether it was known.
    pub fn remove_peer(&mut self, peer_id: &Uuid) -> bool {
        let removed = self.peers.remove(peer_id);
        let floor = removed.as_ref().map_or(0, |p| p.clock);
        let clock = self.departed.get(peer_id).map_or(floor, |d| d.clock.max(floor));
        self.departed.insert(
            *peer_id,
            Departed {
                clock,
                rejoined: false,
                since: Instant::now(),
            },
        );

        if removed.is_some() {
            log::debug!("Presence of {peer_id} removed");
            self.publish();
        }
        removed.is_some()
    }

    /// The relay announced `peer_id` in the room. A departed peer is
    /// accepted again from its next newer update.
    pub fn peer_joined(&mut self, peer_id: &Uuid) {
        if let Some(gone) = self.departed.get_mut(peer_id) {
            gone.rejoined = true;
        }
    }

    /// Forget every remote peer, e.g. after our own connection dropped.
    pub fn clear_remote(&mut self) {
        if !self.peers.is_empty() {
            self.peers.clear();
            self.publish();
        }
    }

    /// Drop peers whose state wasn't renewed within the timeout.
    pub fn prune_stale(&mut self) -> Vec<Uuid> {
        let timeout = self.config.timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();

        self.departed.retain(|_, d| d.since.elapsed() <= timeout);

        if !stale.is_empty() {
            for id in &stale {
                self.peers.remove(id);
            }
            log::debug!("Pruned {} idle presence entries", stale.len());
            self.publish();
        }
        stale
    }

    /// Every other peer, ordered by peer id.
    pub fn others(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self.peers.values().map(|p| p.entry.clone()).collect();
        entries.sort_by_key(|e| e.peer_id);
        entries
    }

    pub fn peer(&self, peer_id: &Uuid) -> Option<&PresenceEntry> {
        self.peers.get(peer_id).map(|p| &p.entry)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Receiver that always holds the current [`others`](Self::others).
    pub fn subscribe(&self) -> watch::Receiver<Vec<PresenceEntry>> {
        self.watch_tx.subscribe()
    }

    fn publish(&self) {
        self.watch_tx.send_replace(self.others());
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn update(peer_id: Uuid, clock: u64, cursor: Option<(f64, f64)>) -> AwarenessMessage {
        AwarenessMessage::Update {
            peer_id,
            clock,
            color: "#123456".into(),
            cursor: cursor.map(|(x, y)| CursorPosition::new(x, y)),
        }
    }

    fn fast_config() -> PresenceConfig {
        PresenceConfig {
            cursor_throttle: Duration::from_millis(20),
            timeout: Duration::from_millis(20),
            renew_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_awareness_message_roundtrip() {
        let msgs = vec![
            update(Uuid::new_v4(), 1, Some((1.5, 2.5))),
            AwarenessMessage::Leave { peer_id: Uuid::new_v4() },
            AwarenessMessage::Query,
        ];
        for msg in msgs {
            assert_eq!(AwarenessMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
        }
    }

    #[test]
    fn test_remote_cursor_is_visible() {
        let mut channel = PresenceChannel::new(Uuid::new_v4(), "#ff0000");
        let bob = Uuid::new_v4();
        channel.handle_message(&update(bob, 1, Some((100.0, 200.0))));

        let others = channel.others();
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].peer_id, bob);
        assert_eq!(others[0].cursor, Some(CursorPosition::new(100.0, 200.0)));
    }

    #[test]
    fn test_ignores_self() {
        let me = Uuid::new_v4();
        let mut channel = PresenceChannel::new(me, "#ff0000");
        channel.handle_message(&update(me, 1, None));
        assert_eq!(channel.peer_count(), 0);
    }

    #[test]
    fn test_stale_clock_rejected() {
        let mut channel = PresenceChannel::new(Uuid::new_v4(), "#ff0000");
        let bob = Uuid::new_v4();
        channel.handle_message(&update(bob, 5, Some((5.0, 5.0))));
        channel.handle_message(&update(bob, 4, Some((4.0, 4.0))));
        channel.handle_message(&update(bob, 5, Some((6.0, 6.0))));

        assert_eq!(channel.peer(&bob).unwrap().cursor, Some(CursorPosition::new(5.0, 5.0)));
    }

    #[test]
    fn test_leave_removes_peer() {
        let mut channel = PresenceChannel::new(Uuid::new_v4(), "#ff0000");
        let bob = Uuid::new_v4();
        channel.handle_message(&update(bob, 1, None));
        channel.handle_message(&AwarenessMessage::Leave { peer_id: bob });
        assert!(channel.others().is_empty());
    }

    #[test]
    fn test_late_update_does_not_revive_departed_peer() {
        let mut channel = PresenceChannel::new(Uuid::new_v4(), "#ff0000");
        let bob = Uuid::new_v4();
        channel.handle_message(&update(bob, 1, None));
        assert!(channel.remove_peer(&bob));

        // Still in flight when the relay reported the departure.
        channel.handle_message(&update(bob, 2, Some((1.0, 1.0))));
        assert!(channel.others().is_empty());

        // Back in the room: only newer state counts.
        channel.peer_joined(&bob);
        channel.handle_message(&update(bob, 1, None));
        assert!(channel.others().is_empty());
        channel.handle_message(&update(bob, 3, Some((7.0, 8.0))));
        assert_eq!(channel.peer(&bob).unwrap().cursor, Some(CursorPosition::new(7.0, 8.0)));
    }

    #[test]
    fn test_query_gets_reply() {
        let me = Uuid::new_v4();
        let mut channel = PresenceChannel::new(me, "#00ff00");
        let reply = channel.handle_message(&AwarenessMessage::Query).unwrap();
        assert!(matches!(reply, AwarenessMessage::Update { peer_id, clock: 1, .. } if peer_id == me));
    }

    #[test]
    fn test_cursor_throttled_then_flushed() {
        let mut channel = PresenceChannel::with_config(Uuid::new_v4(), "#000000", fast_config());
        assert!(channel.set_local_cursor(1.0, 1.0).is_some());
        assert!(channel.set_local_cursor(2.0, 2.0).is_none());
        assert!(channel.set_local_cursor(3.0, 3.0).is_none());
        assert!(channel.flush_pending().is_none());

        thread::sleep(Duration::from_millis(30));
        let flushed = channel.flush_pending().unwrap();
        assert!(matches!(
            flushed,
            AwarenessMessage::Update { cursor: Some(CursorPosition { x, y }), .. } if x == 3.0 && y == 3.0
        ));
        assert!(channel.flush_pending().is_none());
    }

    #[test]
    fn test_clock_increases() {
        let mut channel = PresenceChannel::new(Uuid::new_v4(), "#000000");
        let clocks: Vec<u64> = (0..3)
            .map(|_| match channel.announce() {
                AwarenessMessage::Update { clock, .. } => clock,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(clocks, vec![1, 2, 3]);
    }

    #[test]
    fn test_renew_after_interval() {
        let mut channel = PresenceChannel::with_config(Uuid::new_v4(), "#000000", fast_config());
        assert!(channel.renew().is_some());
        assert!(channel.renew().is_none());
        thread::sleep(Duration::from_millis(30));
        assert!(channel.renew().is_some());
    }

    #[test]
    fn test_prune_stale_peers() {
        let mut channel = PresenceChannel::with_config(Uuid::new_v4(), "#000000", fast_config());
        let bob = Uuid::new_v4();
        channel.handle_message(&update(bob, 1, None));
        assert!(channel.prune_stale().is_empty());

        thread::sleep(Duration::from_millis(30));
        assert_eq!(channel.prune_stale(), vec![bob]);
        assert_eq!(channel.peer_count(), 0);
    }

    #[test]
    fn test_subscribe_tracks_changes() {
        let mut channel = PresenceChannel::new(Uuid::new_v4(), "#000000");
        let rx = channel.subscribe();
        let bob = Uuid::new_v4();

        channel.handle_message(&update(bob, 1, Some((100.0, 200.0))));
        assert_eq!(rx.borrow()[0].cursor, Some(CursorPosition::new(100.0, 200.0)));

        channel.clear_remote();
        assert!(rx.borrow().is_empty());
    }

    #[test]
    fn test_set_local_presence() {
        let mut channel = PresenceChannel::new(Uuid::new_v4(), "#000000");
        channel.set_local_presence("#abcdef", Some(CursorPosition::new(1.0, 2.0)));
        let local = channel.local();
        assert_eq!(local.color, "#abcdef");
        assert_eq!(local.cursor, Some(CursorPosition::new(1.0, 2.0)));
    }
}
