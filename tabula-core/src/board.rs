//! Board: one replica's store, projection and surface, wired together.
//!
//! A `Board` is the explicit context every local action runs against. It
//! never touches the network: replication goes through
//! [`take_outgoing`](Board::take_outgoing) and
//! [`apply_remote_update`](Board::apply_remote_update), driven by whoever owns
//! the board (the session loop, or a test).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::palette::random_color;
use crate::projection::{Projection, ProjectionStats};
use crate::shape::{Geometry, KeyGenerator, ShapeKey, ShapeKind, ShapeRecord};
use crate::store::{ShapeStore, StoreError};
use crate::surface::{Point, Surface};

/// Upper bound (exclusive) of the random position used by the add actions.
pub const SPAWN_AREA: f64 = 300.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BoardError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no object on the board for shape {0}")]
    UnknownShape(ShapeKey),
}

pub struct Board<S: Surface> {
    store: ShapeStore,
    projection: Projection,
    surface: S,
    keys: KeyGenerator,
    rng: StdRng,
}

impl<S: Surface> Board<S> {
    pub fn new(surface: S) -> Self {
        Self::with_rng(surface, StdRng::seed_from_u64(rand::random()))
    }

    /// Deterministic positions, colors and key salt.
    pub fn with_seed(surface: S, seed: u64) -> Self {
        Self::with_rng(surface, StdRng::seed_from_u64(seed))
    }

    fn with_rng(surface: S, mut rng: StdRng) -> Self {
        let salt: u32 = rng.random();
        Self {
            store: ShapeStore::new(),
            projection: Projection::new(),
            surface,
            keys: KeyGenerator::new(salt),
            rng,
        }
    }

    // ─── Local actions ───────────────────────────────────────────────

    /// Create a shape under a fresh key.
    pub fn add_shape(
        &mut self,
        geometry: Geometry,
        left: f64,
        top: f64,
        fill: impl Into<String>,
    ) -> Result<ShapeKey, BoardError> {
        let key = self.keys.next_key();
        let record = ShapeRecord::new(left, top, fill, geometry);
        self.store.set(&key, &record)?;
        log::debug!("Added {} {key} at ({left}, {top})", record.kind());
        self.pump();
        Ok(key)
    }

    /// 70×70 rectangle at a random position with a random fill.
    pub fn add_rectangle(&mut self) -> Result<ShapeKey, BoardError> {
        self.add_default(ShapeKind::Rectangle)
    }

    /// Radius-40 circle at a random position with a random fill.
    pub fn add_circle(&mut self) -> Result<ShapeKey, BoardError> {
        self.add_default(ShapeKind::Circle)
    }

    fn add_default(&mut self, kind: ShapeKind) -> Result<ShapeKey, BoardError> {
        let left = self.rng.random_range(0.0..SPAWN_AREA);
        let top = self.rng.random_range(0.0..SPAWN_AREA);
        let fill = random_color(&mut self.rng);
        self.add_shape(Geometry::default_for(kind), left, top, fill)
    }

    /// Delete the most recently inserted shape in this replica's order.
    /// Returns `None` on an empty board.
    pub fn delete_last_added(&mut self) -> Option<ShapeKey> {
        let Some((key, _)) = self.store.entries().pop() else {
            log::debug!("Nothing to delete");
            return None;
        };
        self.store.delete(&key);
        self.pump();
        Some(key)
    }

    /// Drag a shape's object to a new top-left position.
    ///
    /// Goes through the surface like a user drag, so the store is written
    /// by the projection's write-back path.
    pub fn move_shape(&mut self, key: &ShapeKey, left: f64, top: f64) -> Result<(), BoardError> {
        let id = self
            .surface
            .find_object_by_tag(key)
            .ok_or_else(|| BoardError::UnknownShape(key.clone()))?;
        self.surface.drag_object(id, Point::new(left, top));
        self.pump();
        Ok(())
    }

    /// Run both projection directions until quiet: interaction events are
    /// written back to the store, then store changes are projected.
    ///
    /// Returns the number of store changes projected.
    pub fn pump(&mut self) -> usize {
        for event in self.surface.take_events() {
            let Some(object) = self.surface.object(event.target) else {
                continue;
            };
            if let Err(e) = self.projection.write_back(&mut self.store, object) {
                log::warn!("Dropping {:?} of object {}: {e}", event.kind, event.target);
            }
        }

        let changes = self.store.drain_changes();
        if !changes.is_empty() {
            self.projection.apply_batch(&mut self.surface, &changes);
        }
        changes.len()
    }

    // ─── Replication ─────────────────────────────────────────────────

    /// Apply a delta from another replica and project it.
    pub fn apply_remote_update(&mut self, update: &[u8]) -> Result<(), BoardError> {
        self.store.apply_update(update)?;
        self.pump();
        Ok(())
    }

    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        self.store.take_outgoing()
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.store.state_vector()
    }

    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, BoardError> {
        Ok(self.store.encode_diff(remote_sv)?)
    }

    pub fn encode_state(&self) -> Vec<u8> {
        self.store.encode_state()
    }

    /// Rebuild the surface by replaying the store's full current mapping.
    pub fn resync(&mut self) {
        // Pending changes are subsumed by the replay.
        self.store.drain_changes();
        let replay = self.store.replay();
        log::debug!("Resyncing surface with {} live shapes", replay.len());
        self.projection.reconcile(&mut self.surface, &replay);
    }

    // ─── Accessors ───────────────────────────────────────────────────

    pub fn store(&self) -> &ShapeStore {
        &self.store
    }

    pub fn entries(&self) -> Vec<(ShapeKey, ShapeRecord)> {
        self.store.entries()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn projection_stats(&self) -> ProjectionStats {
        self.projection.stats()
    }
}
