//! Projection engine. Keeps a [`Surface`] in step with the shape store.
//!
//! ```text
//!   ShapeStore ──drain_changes──► Projection::apply_batch ──► Surface
//!       ▲                                                       │
//!       └──────── set(snapshot) ◄── Projection::write_back ◄────┘
//!                                      (Moving / DragEnd)
//! ```
//!
//! Every key is either Absent (no tagged object) or Present (exactly one
//! object tagged with it). Visual objects are derived state: they are built
//! from records and only ever written back as full record snapshots.

use std::collections::HashSet;

use crate::shape::{Geometry, ShapeError, ShapeKey, ShapeRecord};
use crate::store::{ShapeChange, ShapeStore, StoreError};
use crate::surface::{ObjectId, ObjectProps, Surface, VisualObject, VisualShape};

/// Projection faults. None of them stop the engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProjectionError {
    #[error("no object is tagged with updated shape {0}")]
    Inconsistency(ShapeKey),
    #[error("shape {key} has unknown kind '{kind}'")]
    UnknownShapeKind { key: ShapeKey, kind: String },
    #[error("shape {key} is unreadable: {source}")]
    Unreadable { key: ShapeKey, source: ShapeError },
}

/// What applying one change did to the surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Created(ObjectId),
    Updated(ObjectId),
    /// Kind changed, so the object was replaced.
    Rebuilt(ObjectId),
    Removed(ObjectId),
    /// Delete of a key that has no object.
    Absent,
    Recovered(ObjectId, ProjectionError),
    Ignored(ProjectionError),
    /// Unreadable value for a drawn key; its object was removed.
    Discarded(ObjectId, ProjectionError),
}

impl Applied {
    fn touched_surface(&self) -> bool {
        !matches!(self, Applied::Absent | Applied::Ignored(_))
    }
}

/// Counters for one engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectionStats {
    pub created: u64,
    pub updated: u64,
    pub removed: u64,
    pub recovered: u64,
    pub ignored: u64,
    pub written_back: u64,
}

#[derive(Debug, Default)]
pub struct Projection {
    stats: ProjectionStats,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> ProjectionStats {
        self.stats
    }

    // ─── Store → surface ─────────────────────────────────────────────

    /// Apply one change. Does not request a redraw.
    pub fn apply<S: Surface>(&mut self, surface: &mut S, change: &ShapeChange) -> Applied {
        match change {
            ShapeChange::Added(key, record) => self.upsert(surface, key, record),

            ShapeChange::Updated(key, record) => {
                if surface.find_object_by_tag(key).is_some() {
                    return self.upsert(surface, key, record);
                }
                let err = ProjectionError::Inconsistency(key.clone());
                log::warn!("{err}; re-adding it");
                let id = surface.add_object(object_props(key, record));
                self.stats.recovered += 1;
                Applied::Recovered(id, err)
            }

            ShapeChange::Deleted(key) => match surface.find_object_by_tag(key) {
                Some(id) => {
                    surface.remove_object(id);
                    self.stats.removed += 1;
                    Applied::Removed(id)
                }
                None => Applied::Absent,
            },

            ShapeChange::Unreadable(key, source) => {
                let err = match source {
                    ShapeError::UnknownKind(kind) => ProjectionError::UnknownShapeKind {
                        key: key.clone(),
                        kind: kind.clone(),
                    },
                    other => ProjectionError::Unreadable {
                        key: key.clone(),
                        source: other.clone(),
                    },
                };
                self.stats.ignored += 1;
                // The old object no longer mirrors the stored value.
                match surface.find_object_by_tag(key) {
                    Some(id) => {
                        log::warn!("Ignoring shape and removing its stale object: {err}");
                        surface.remove_object(id);
                        self.stats.removed += 1;
                        Applied::Discarded(id, err)
                    }
                    None => {
                        log::warn!("Ignoring shape: {err}");
                        Applied::Ignored(err)
                    }
                }
            }
        }
    }

    /// Apply a batch of changes and request a single redraw if anything
    /// on the surface changed.
    pub fn apply_batch<S: Surface>(&mut self, surface: &mut S, changes: &[ShapeChange]) -> Vec<Applied> {
        let applied: Vec<Applied> = changes.iter().map(|c| self.apply(surface, c)).collect();
        if applied.iter().any(Applied::touched_surface) {
            surface.request_redraw();
        }
        applied
    }

    /// Bring the surface to exactly the replayed mapping (see
    /// [`ShapeStore::replay`]): tagged objects whose key is not replayed are
    /// removed, every replayed entry is upserted.
    pub fn reconcile<S: Surface>(&mut self, surface: &mut S, replay: &[ShapeChange]) {
        let entries: Vec<(&ShapeKey, &ShapeRecord)> = replay
            .iter()
            .filter_map(|change| match change {
                ShapeChange::Added(key, record) | ShapeChange::Updated(key, record) => Some((key, record)),
                ShapeChange::Deleted(_) | ShapeChange::Unreadable(..) => None,
            })
            .collect();
        let live: HashSet<&ShapeKey> = entries.iter().map(|(key, _)| *key).collect();

        for key in surface.tagged_keys() {
            if live.contains(&key) {
                continue;
            }
            if let Some(id) = surface.find_object_by_tag(&key) {
                surface.remove_object(id);
                self.stats.removed += 1;
            }
        }
        for (key, record) in entries {
            self.upsert(surface, key, record);
        }
        surface.request_redraw();
    }

    fn upsert<S: Surface>(&mut self, surface: &mut S, key: &ShapeKey, record: &ShapeRecord) -> Applied {
        let props = object_props(key, record);

        let Some(id) = surface.find_object_by_tag(key) else {
            let id = surface.add_object(props);
            self.stats.created += 1;
            return Applied::Created(id);
        };

        let same_kind = surface
            .object(id)
            .is_some_and(|object| object.props.shape.same_kind(&props.shape));
        if same_kind {
            surface.update_object(id, props);
            self.stats.updated += 1;
            Applied::Updated(id)
        } else {
            log::debug!("Shape {key} changed kind, rebuilding its object");
            surface.remove_object(id);
            let id = surface.add_object(props);
            self.stats.updated += 1;
            Applied::Rebuilt(id)
        }
    }

    // ─── Surface → store ─────────────────────────────────────────────

    /// Write the object's current state back to the store under its tag.
    pub fn write_back(&mut self, store: &mut ShapeStore, object: &VisualObject) -> Result<ShapeKey, StoreError> {
        let (key, record) = snapshot(object);
        store.set(&key, &record)?;
        self.stats.written_back += 1;
        Ok(key)
    }
}

/// Build the surface object for a record.
pub fn object_props(key: &ShapeKey, record: &ShapeRecord) -> ObjectProps {
    let shape = match record.geometry {
        Geometry::Rectangle { width, height } => VisualShape::Rect { width, height },
        Geometry::Circle { radius, angle } => VisualShape::Circle { radius, angle },
    };
    ObjectProps {
        left: record.left,
        top: record.top,
        fill: record.fill.clone(),
        shape,
        tag: key.clone(),
        has_controls: false,
        selectable: true,
    }
}

/// Full record snapshot of an object's current state.
pub fn snapshot(object: &VisualObject) -> (ShapeKey, ShapeRecord) {
    let props = &object.props;
    let geometry = match props.shape {
        VisualShape::Rect { width, height } => Geometry::Rectangle { width, height },
        VisualShape::Circle { radius, angle } => Geometry::Circle { radius, angle },
    };
    (
        props.tag.clone(),
        ShapeRecord::new(props.left, props.top, props.fill.clone(), geometry),
    )
}
