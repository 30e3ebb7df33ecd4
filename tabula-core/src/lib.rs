//! # tabula-core — Shared shape state for the Tabula whiteboard
//!
//! Holds the replicated shape map and keeps a drawing surface in step with
//! it. Networking lives in `tabula-collab`; nothing here blocks or awaits.
//!
//! ## Architecture
//!
//! ```text
//!  add / delete / move
//!          │
//!          ▼
//!   ┌─────────────┐  encode_update_v1   ┌──────────────┐
//!   │ Board       │ ──────────────────► │ take_outgoing│ ──► transport
//!   │ (context)   │ ◄────────────────── │ apply_update │ ◄── transport
//!   └──────┬──────┘                     └──────────────┘
//!          │
//!   ┌──────┴──────┐   drain_changes    ┌─────────────┐
//!   │ ShapeStore  │ ─────────────────► │ Projection  │
//!   │ (yrs map)   │ ◄───── set ─────── │ (engine)    │
//!   └─────────────┘    (write-back)    └──────┬──────┘
//!                                             │
//!                                      ┌──────┴──────┐
//!                                      │ Surface     │
//!                                      └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`shape`] — shape records, keys and their JSON wire form
//! - [`store`] — the yrs-backed replicated map and its change queue
//! - [`surface`] — drawing surface contract plus an in-memory surface
//! - [`projection`] — store changes → surface, interactions → store
//! - [`board`] — one replica's store, projection and surface together
//! - [`palette`] — random colors

pub mod board;
pub mod palette;
pub mod projection;
pub mod shape;
pub mod store;
pub mod surface;

pub use board::{Board, BoardError, SPAWN_AREA};
pub use palette::random_color;
pub use projection::{Applied, Projection, ProjectionError, ProjectionStats};
pub use shape::{
    Bounds, Geometry, KeyGenerator, ShapeError, ShapeKey, ShapeKind, ShapeRecord,
};
pub use store::{ShapeChange, ShapeStore, StoreError};
pub use surface::{
    InteractionEvent, InteractionKind, MemorySurface, ObjectId, ObjectProps, Point, Surface,
    VisualObject, VisualShape,
};
