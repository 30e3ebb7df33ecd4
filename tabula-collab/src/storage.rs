//! RocksDB-backed room store.
//!
//! ```text
//! ┌─────────────┐  updates / snapshots  ┌───────────────┐
//! │ SyncServer  │ ────────────────────► │ DocumentStore │
//! │ LocalCache  │ ◄──────────────────── │ (RocksDB)     │
//! └─────────────┘      load_state       └───────┬───────┘
//!                                               │ column families
//!                       ┌───────────────────────┴──────────────────┐
//!                       │ "documents": full yrs state (LZ4)        │
//!                       │ "updates"  : yrs updates (LZ4), by version│
//!                       │ "metadata" : RoomMetadata (bincode)      │
//!                       └──────────────────────────────────────────┘
//! ```
//!
//! Rooms are addressed by name; the name is hashed to a fixed 16-byte id
//! (UUID v5) so update keys can be prefix-scanned.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const CF_DOCUMENTS: &str = "documents";
const CF_UPDATES: &str = "updates";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_UPDATES, CF_METADATA];

/// Namespace for room-name → id hashing.
const ROOM_NAMESPACE: Uuid = Uuid::from_u128(0x7461_6275_6c61_4000_8000_726f_6f6d_7321);

/// Stable 16-byte id of a room name.
pub fn room_id(room: &str) -> Uuid {
    Uuid::new_v5(&ROOM_NAMESPACE, room.as_bytes())
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    /// Bloom filter bits per key
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tabula_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

}

/// Per-room bookkeeping stored next to the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room: String,
    /// Version of the newest stored update.
    pub version: u64,
    /// Updates currently stored (not yet folded into the snapshot).
    pub update_count: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(room: &str) -> Self {
        let now = now_secs();
        Self {
            room: room.to_string(),
            version: 0,
            update_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Room has no stored data
    NotFound(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StorageError::NotFound(room) => write!(f, "Room not found: {room}"),
            StorageError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StorageError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StorageError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::DatabaseError(e.to_string())
    }
}

/// Durable store for room documents.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes metadata read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::debug!("Opened room store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_UPDATES => {
                // Many small writes, prefix-scanned by room id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    // ─── Snapshots ───────────────────────────────────────────────────

    pub fn load_snapshot(&self, room: &str) -> Result<Vec<u8>, StorageError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, room_id(room).as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map_err(|e| StorageError::CompressionError(e.to_string())),
            None => Err(StorageError::NotFound(room.to_string())),
        }
    }

    // ─── Updates ─────────────────────────────────────────────────────

    /// Append an update to a room's log. Returns its version.
    ///
    /// Key format: `<room id:16 bytes><version:8 bytes big-endian>`.
    pub fn store_update(&self, room: &str, update: &[u8]) -> Result<u64, StorageError> {
        let _guard = self.lock();
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let id = room_id(room);

        let mut meta = self.metadata_or_new(room)?;
        meta.version += 1;
        meta.update_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_updates,
            Self::update_key(id, meta.version),
            lz4_flex::compress_prepend_size(update),
        );
        batch.put_cf(&cf_meta, id.as_bytes(), meta.encode()?);
        self.write(batch)?;

        Ok(meta.version)
    }

    /// Every stored update of a room, in version order.
    pub fn load_updates(&self, room: &str) -> Result<Vec<(u64, Vec<u8>)>, StorageError> {
        let cf = self.cf(CF_UPDATES)?;
        let id = room_id(room);
        let start_key = Self::update_key(id, 0);

        let mut updates = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::From(&start_key, Direction::Forward)) {
            let (key, value) = item?;
            if key.len() != 24 || &key[..16] != id.as_bytes() {
                break;
            }

            let mut ver_buf = [0u8; 8];
            ver_buf.copy_from_slice(&key[16..24]);
            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StorageError::CompressionError(e.to_string()))?;
            updates.push((u64::from_be_bytes(ver_buf), decompressed));
        }

        Ok(updates)
    }

    /// Snapshot (if any) followed by every later update, ready to be
    /// applied in order.
    pub fn load_state(&self, room: &str) -> Result<Vec<Vec<u8>>, StorageError> {
        let mut state = Vec::new();
        match self.load_snapshot(room) {
            Ok(snapshot) => state.push(snapshot),
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        state.extend(self.load_updates(room)?.into_iter().map(|(_, update)| update));
        Ok(state)
    }

    /// Replace the room's snapshot and drop the updates it covers, which
    /// are those up to and including version `through`. Later updates stay
    /// in the log. Returns the number of updates dropped.
    pub fn compact(&self, room: &str, snapshot: &[u8], through: u64) -> Result<u64, StorageError> {
        let _guard = self.lock();
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let id = room_id(room);

        let compressed = lz4_flex::compress_prepend_size(snapshot);
        let mut meta = self.metadata_or_new(room)?;
        let through = through.min(meta.version);
        // Versions above `through` are contiguous and untouched by earlier
        // compactions.
        let remaining = meta.version - through;
        let dropped = meta.update_count.saturating_sub(remaining);
        meta.update_count = remaining;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.delete_range_cf(&cf_updates, Self::update_key(id, 0), Self::update_key(id, through + 1));
        batch.put_cf(&cf_docs, id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, id.as_bytes(), meta.encode()?);
        self.write(batch)?;

        log::debug!("Compacted room {room}: {dropped} updates folded into snapshot");
        Ok(dropped)
    }

    // ─── Rooms ───────────────────────────────────────────────────────

    /// Version of the newest stored update, 0 for an unknown room.
    pub fn latest_version(&self, room: &str) -> Result<u64, StorageError> {
        Ok(self.metadata_or_new(room)?.version)
    }

    pub fn load_metadata(&self, room: &str) -> Result<RoomMetadata, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, room_id(room).as_bytes())? {
            Some(bytes) => RoomMetadata::decode(&bytes),
            None => Err(StorageError::NotFound(room.to_string())),
        }
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ─────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn metadata_or_new(&self, room: &str) -> Result<RoomMetadata, StorageError> {
        match self.load_metadata(room) {
            Ok(meta) => Ok(meta),
            Err(StorageError::NotFound(_)) => Ok(RoomMetadata::new(room)),
            Err(e) => Err(e),
        }
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_key(id: Uuid, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(id.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
