//! Durable per-room cache on the local machine.
//!
//! Replayed into the shape store before the network connects, so a board
//! opens with its last known content even when the relay is unreachable.
//! Backed by the same RocksDB [`DocumentStore`] the relay uses.

use std::path::Path;

use crate::storage::{DocumentStore, StorageError, StoreConfig};

/// Local copy of one room's document.
pub struct LocalCache {
    store: DocumentStore,
    room: String,
    synced: bool,
}

impl LocalCache {
    pub fn open(path: impl AsRef<Path>, room: impl Into<String>) -> Result<Self, StorageError> {
        let store = DocumentStore::open(StoreConfig::at(path.as_ref()))?;
        Ok(Self {
            store,
            room: room.into(),
            synced: false,
        })
    }

    /// Cached updates, snapshot first.
    pub fn load(&self) -> Result<Vec<Vec<u8>>, StorageError> {
        self.store.load_state(&self.room)
    }

    /// Record that the loaded content has been replayed. Only the first
    /// call logs.
    pub fn mark_synced(&mut self, replayed: usize) {
        if !self.synced {
            self.synced = true;
            log::info!(
                "Initial content loaded from local cache for room {} ({replayed} entries)",
                self.room
            );
        }
    }

    /// Append one update.
    pub fn record(&self, update: &[u8]) -> Result<u64, StorageError> {
        self.store.store_update(&self.room, update)
    }

    /// Replace cached history with a full-state snapshot covering every
    /// recorded update.
    pub fn compact(&self, state: &[u8]) -> Result<u64, StorageError> {
        let through = self.store.latest_version(&self.room)?;
        let dropped = self.store.compact(&self.room, state, through)?;
        log::debug!("Compacted local cache for room {} ({dropped} updates folded)", self.room);
        Ok(dropped)
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.store.sync()
    }
}
