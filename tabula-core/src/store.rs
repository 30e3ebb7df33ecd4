//! Shared shape store — a yrs map of shape key → shape record.
//!
//! ```text
//!   set / delete ──► TransactionMut ──► encode_update_v1 ──► outgoing queue
//!                          │
//!                          ▼ (commit)
//!                    MapRef::observe ──► change queue ──► drain_changes()
//!                          ▲
//!   apply_update ──────────┘   (remote deltas: observed, never re-sent)
//! ```
//!
//! Conflict resolution is the yrs map's: concurrent writes to the same key
//! resolve last-writer-wins, and replicas that applied the same updates in
//! any order hold the same mapping.
//!
//! The observe callback only records what changed. Consumers pull the
//! queued [`ShapeChange`]s from a single event loop, so projection work never
//! runs inside a yrs transaction.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexSet;
use yrs::types::EntryChange;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, MapRef, Observable, Out, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::shape::{ShapeError, ShapeKey, ShapeKind, ShapeRecord};

/// Name of the root map holding all shapes.
pub const SHAPES_MAP: &str = "shapes";

/// One observed change to one key.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeChange {
    Added(ShapeKey, ShapeRecord),
    Updated(ShapeKey, ShapeRecord),
    Deleted(ShapeKey),
    /// The key now holds a value we can't decode (e.g. an unknown kind).
    Unreadable(ShapeKey, ShapeError),
}

impl ShapeChange {
    pub fn key(&self) -> &ShapeKey {
        match self {
            ShapeChange::Added(key, _)
            | ShapeChange::Updated(key, _)
            | ShapeChange::Deleted(key)
            | ShapeChange::Unreadable(key, _) => key,
        }
    }
}

/// Store errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Record(#[from] ShapeError),
    #[error("shape {key} is a {existing}, refusing to replace it with a {requested}")]
    KindChanged {
        key: ShapeKey,
        existing: ShapeKind,
        requested: ShapeKind,
    },
    #[error("invalid update: {0}")]
    Update(String),
}

/// The replicated shape map.
pub struct ShapeStore {
    doc: Doc,
    shapes: MapRef,
    /// Keys in the order this replica first observed them.
    order: Arc<Mutex<IndexSet<Arc<str>>>>,
    /// Changes observed but not yet drained.
    changes: Arc<Mutex<VecDeque<ShapeChange>>>,
    /// Encoded local deltas awaiting replication.
    outgoing: VecDeque<Vec<u8>>,
    _subscription: Subscription,
}

impl ShapeStore {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Wrap an existing document (e.g. one with a fixed client id in tests).
    pub fn from_doc(doc: Doc) -> Self {
        let shapes = doc.get_or_insert_map(SHAPES_MAP);
        let order: Arc<Mutex<IndexSet<Arc<str>>>> = Arc::new(Mutex::new(IndexSet::new()));
        let changes: Arc<Mutex<VecDeque<ShapeChange>>> = Arc::new(Mutex::new(VecDeque::new()));

        let order_ref = order.clone();
        let changes_ref = changes.clone();
        let subscription = shapes.observe(move |txn, event| {
            // Keys of one batch arrive unordered; generated keys sort by
            // creation time, so sorting keeps a multi-key batch stable.
            let mut batch: Vec<(&Arc<str>, &EntryChange)> = event.keys(txn).iter().collect();
            batch.sort_by(|a, b| a.0.cmp(b.0));

            let mut order = lock(&order_ref);
            let mut queue = lock(&changes_ref);
            for (key, change) in batch {
                let shape_key = ShapeKey::from(key.as_ref());
                let observed = match change {
                    EntryChange::Inserted(value) => {
                        order.insert(key.clone());
                        match decode_value(value) {
                            Ok(record) => ShapeChange::Added(shape_key, record),
                            Err(e) => ShapeChange::Unreadable(shape_key, e),
                        }
                    }
                    EntryChange::Updated(_, value) => {
                        order.insert(key.clone());
                        match decode_value(value) {
                            Ok(record) => ShapeChange::Updated(shape_key, record),
                            Err(e) => ShapeChange::Unreadable(shape_key, e),
                        }
                    }
                    EntryChange::Removed(_) => {
                        order.shift_remove(&**key);
                        ShapeChange::Deleted(shape_key)
                    }
                };
                queue.push_back(observed);
            }
        });

        Self {
            doc,
            shapes,
            order,
            changes,
            outgoing: VecDeque::new(),
            _subscription: subscription,
        }
    }

    // ─── Local mutations ─────────────────────────────────────────────

    /// Write a full record under `key`.
    ///
    /// The change is visible locally at once; its delta is queued for
    /// [`take_outgoing`](Self::take_outgoing). Replacing a record with one of
    /// a different kind is refused.
    pub fn set(&mut self, key: &ShapeKey, record: &ShapeRecord) -> Result<(), StoreError> {
        let json = record.to_json()?;

        let mut txn = self.doc.transact_mut();
        if let Some(existing) = self.shapes.get(&txn, key.as_str()) {
            if let Ok(current) = decode_value(&existing) {
                if current.kind() != record.kind() {
                    return Err(StoreError::KindChanged {
                        key: key.clone(),
                        existing: current.kind(),
                        requested: record.kind(),
                    });
                }
            }
        }
        self.shapes.insert(&mut txn, key.as_str(), json);
        let update = txn.encode_update_v1();
        drop(txn);

        self.outgoing.push_back(update);
        Ok(())
    }

    /// Remove `key`. Returns `false` (and does nothing) when it is absent.
    pub fn delete(&mut self, key: &ShapeKey) -> bool {
        let mut txn = self.doc.transact_mut();
        if self.shapes.get(&txn, key.as_str()).is_none() {
            return false;
        }
        self.shapes.remove(&mut txn, key.as_str());
        let update = txn.encode_update_v1();
        drop(txn);

        self.outgoing.push_back(update);
        true
    }

    // ─── Reads ───────────────────────────────────────────────────────

    pub fn get(&self, key: &ShapeKey) -> Option<ShapeRecord> {
        let txn = self.doc.transact();
        self.shapes
            .get(&txn, key.as_str())
            .and_then(|value| decode_value(&value).ok())
    }

    pub fn contains(&self, key: &ShapeKey) -> bool {
        let txn = self.doc.transact();
        self.shapes.get(&txn, key.as_str()).is_some()
    }

    /// Number of keys in the map, readable or not.
    pub fn len(&self) -> usize {
        let txn = self.doc.transact();
        self.shapes.len(&txn) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All readable records in this replica's observed insertion order.
    pub fn entries(&self) -> Vec<(ShapeKey, ShapeRecord)> {
        let order: Vec<Arc<str>> = lock(&self.order).iter().cloned().collect();
        let txn = self.doc.transact();

        order
            .into_iter()
            .filter_map(|key| {
                let value = self.shapes.get(&txn, &key)?;
                match decode_value(&value) {
                    Ok(record) => Some((ShapeKey::from(key.as_ref()), record)),
                    Err(e) => {
                        log::debug!("Skipping unreadable shape {key}: {e}");
                        None
                    }
                }
            })
            .collect()
    }

    // ─── Change queue ────────────────────────────────────────────────

    /// Take every change observed since the last call, oldest first.
    pub fn drain_changes(&self) -> Vec<ShapeChange> {
        lock(&self.changes).drain(..).collect()
    }

    /// An `Added` for every live entry, for re-subscribing consumers.
    pub fn replay(&self) -> Vec<ShapeChange> {
        self.entries()
            .into_iter()
            .map(|(key, record)| ShapeChange::Added(key, record))
            .collect()
    }

    // ─── Replication ─────────────────────────────────────────────────

    /// Take the encoded deltas of local mutations, oldest first.
    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        self.outgoing.drain(..).collect()
    }

    /// Integrate a delta produced by another replica.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<(), StoreError> {
        let update = Update::decode_v1(update).map_err(|e| StoreError::Update(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| StoreError::Update(e.to_string()))?;
        Ok(())
    }

    /// Encoded state vector, the first half of a sync handshake.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that the holder of `remote_sv` lacks.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, StoreError> {
        let sv = StateVector::decode_v1(remote_sv).map_err(|e| StoreError::Update(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// The full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

impl Default for ShapeStore {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_value(value: &Out) -> Result<ShapeRecord, ShapeError> {
    match value {
        Out::Any(Any::String(json)) => ShapeRecord::from_json(json),
        other => Err(ShapeError::NotARecord(format!("{other:?}"))),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
