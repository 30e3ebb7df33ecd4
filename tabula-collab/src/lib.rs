//! # tabula-collab — Networked replication for the Tabula whiteboard
//!
//! Carries shape-store updates and presence between peers through a
//! websocket relay, and keeps rooms durable on both ends.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ Session     │ ◄─────────────────► │ SyncServer  │
//! │ SyncClient  │     Binary Proto    │ (relay)     │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Board       │                     │ yrs Doc     │
//! │ LocalCache  │                     │ per room    │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ DocumentStore │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`presence`] — cursors and colors of the other peers
//! - [`broadcast`] — per-room fan-out
//! - [`storage`] — RocksDB room persistence
//! - [`server`] — websocket relay
//! - [`client`] — websocket client
//! - [`cache`] — local durable copy of a room
//! - [`session`] — the per-participant event loop

pub mod broadcast;
pub mod cache;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use cache::LocalCache;
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use presence::{AwarenessMessage, CursorPosition, PresenceChannel, PresenceConfig, PresenceEntry};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{BoardSnapshot, Command, Session, SessionConfig, SessionError, SessionStatus};
pub use storage::{room_id, DocumentStore, RoomMetadata, StorageError, StoreConfig};
