//! Binary protocol for shape-map synchronization.
//!
//! Wire format (bincode-encoded, one websocket binary frame per message):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room     │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ varint+n │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Handshake: whoever opens the conversation sends `SyncStep1` with its
//! encoded state vector; the other side answers `SyncStep2` with the diff.
//! Both sides do this, so after two round trips each holds the union.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::AwarenessMessage;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Encoded yrs state vector
    SyncStep1 = 1,
    /// Encoded yrs diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental yrs update
    Update = 3,
    /// Presence (cursor/color) message
    Awareness = 4,
    PeerJoined = 5,
    PeerLeft = 6,
}

/// Peer identity announced on join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// `#rrggbb` cursor color
    pub color: String,
}

impl PeerInfo {
    /// New peer with a random id.
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name, color)
    }

    pub fn with_id(peer_id: Uuid, name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            color: color.into(),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room: String,
    /// Sender's message counter
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room: room.to_string(),
            clock,
            payload,
        }
    }

    /// Incremental update message.
    pub fn update(peer_id: Uuid, room: &str, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, peer_id, room, clock, yrs_update)
    }

    /// Sync step 1 (state vector).
    pub fn sync_step1(peer_id: Uuid, room: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room, 0, state_vector)
    }

    /// Sync step 2 (diff).
    pub fn sync_step2(peer_id: Uuid, room: &str, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room, 0, diff)
    }

    pub fn awareness(peer_id: Uuid, room: &str, clock: u64, msg: &AwarenessMessage) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(msg, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(MessageType::Awareness, peer_id, room, clock, payload))
    }

    pub fn peer_joined(room: &str, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(MessageType::PeerJoined, info.peer_id, room, 0, payload))
    }

    pub fn peer_left(peer_id: Uuid, room: &str) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, room, 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse an awareness payload.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (msg, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a peer-joined payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(info)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    /// Could not open the websocket.
    ConnectFailed(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectFailed(e) => write!(f, "Connect failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
