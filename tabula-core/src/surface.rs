//! Drawing surface contract and a headless implementation.
//!
//! The projection engine only talks to a [`Surface`]: it adds, updates and
//! removes visual objects, asks for redraws, and drains interaction events.
//! A GUI canvas would implement the same trait; [`MemorySurface`] keeps the
//! objects in memory so the whole pipeline runs in tests and in the CLI.

use std::collections::{HashMap, VecDeque};

use indexmap::IndexMap;

use crate::shape::{Bounds, ShapeKey};

/// Surface-assigned object handle. Never reused within one surface.
pub type ObjectId = u64;

/// Point in surface coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Drawable primitive of a visual object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VisualShape {
    Rect { width: f64, height: f64 },
    Circle { radius: f64, angle: f64 },
}

impl VisualShape {
    pub fn extent(&self) -> (f64, f64) {
        match *self {
            VisualShape::Rect { width, height } => (width, height),
            VisualShape::Circle { radius, .. } => (radius * 2.0, radius * 2.0),
        }
    }

    /// Whether two primitives are the same kind of object.
    pub fn same_kind(&self, other: &VisualShape) -> bool {
        matches!(
            (self, other),
            (VisualShape::Rect { .. }, VisualShape::Rect { .. })
                | (VisualShape::Circle { .. }, VisualShape::Circle { .. })
        )
    }
}

/// Everything the surface needs to draw an object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectProps {
    pub left: f64,
    pub top: f64,
    pub fill: String,
    pub shape: VisualShape,
    /// Key of the shape record this object projects.
    pub tag: ShapeKey,
    /// Resize/rotate handles.
    pub has_controls: bool,
    /// Whether the object can be picked and dragged.
    pub selectable: bool,
}

impl ObjectProps {
    pub fn bounds(&self) -> Bounds {
        let (width, height) = self.shape.extent();
        Bounds {
            left: self.left,
            top: self.top,
            width,
            height,
        }
    }
}

/// An object living on a surface.
#[derive(Debug, Clone, PartialEq)]
pub struct VisualObject {
    pub id: ObjectId,
    pub props: ObjectProps,
    /// Cached bounds, recomputed on every update.
    pub bounds: Bounds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    /// Object is being dragged; fired repeatedly.
    Moving,
    /// Drag finished.
    DragEnd,
}

/// A user interaction reported by the surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InteractionEvent {
    pub kind: InteractionKind,
    pub target: ObjectId,
    pub pointer: Point,
}

/// Operations the projection engine needs from a drawing surface.
pub trait Surface {
    fn add_object(&mut self, props: ObjectProps) -> ObjectId;

    fn find_object_by_tag(&self, tag: &ShapeKey) -> Option<ObjectId>;

    fn object(&self, id: ObjectId) -> Option<&VisualObject>;

    /// Overwrite every field of an object. Returns `false` if `id` is unknown.
    fn update_object(&mut self, id: ObjectId, props: ObjectProps) -> bool;

    fn remove_object(&mut self, id: ObjectId) -> bool;

    fn request_redraw(&mut self);

    /// Topmost selectable object under `point`.
    fn hit_test(&self, point: Point) -> Option<ObjectId>;

    /// Move an object's top-left corner to `to` as a user drag would,
    /// emitting `Moving` then `DragEnd`.
    fn drag_object(&mut self, id: ObjectId, to: Point) -> bool;

    /// Drain pending interaction events, oldest first.
    fn take_events(&mut self) -> Vec<InteractionEvent>;

    /// Tags of every object on the surface, bottom to top.
    fn tagged_keys(&self) -> Vec<ShapeKey>;
}

// ───────────────────────────────────────────────────────────────────
// MemorySurface
// ───────────────────────────────────────────────────────────────────

/// In-memory surface. Paint order is insertion order.
#[derive(Debug, Default)]
pub struct MemorySurface {
    objects: IndexMap<ObjectId, VisualObject>,
    by_tag: HashMap<ShapeKey, ObjectId>,
    next_id: ObjectId,
    events: VecDeque<InteractionEvent>,
    redraws: u64,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Objects bottom to top.
    pub fn objects(&self) -> impl Iterator<Item = &VisualObject> {
        self.objects.values()
    }

    pub fn object_by_tag(&self, tag: &ShapeKey) -> Option<&VisualObject> {
        self.by_tag.get(tag).and_then(|id| self.objects.get(id))
    }

    /// Number of redraws requested so far.
    pub fn redraw_count(&self) -> u64 {
        self.redraws
    }
}

impl Surface for MemorySurface {
    fn add_object(&mut self, props: ObjectProps) -> ObjectId {
        self.next_id += 1;
        let id = self.next_id;
        self.by_tag.insert(props.tag.clone(), id);
        let bounds = props.bounds();
        self.objects.insert(id, VisualObject { id, props, bounds });
        id
    }

    fn find_object_by_tag(&self, tag: &ShapeKey) -> Option<ObjectId> {
        self.by_tag.get(tag).copied()
    }

    fn object(&self, id: ObjectId) -> Option<&VisualObject> {
        self.objects.get(&id)
    }

    fn update_object(&mut self, id: ObjectId, props: ObjectProps) -> bool {
        let Some(object) = self.objects.get_mut(&id) else {
            return false;
        };
        if object.props.tag != props.tag {
            self.by_tag.remove(&object.props.tag);
            self.by_tag.insert(props.tag.clone(), id);
        }
        object.bounds = props.bounds();
        object.props = props;
        true
    }

    fn remove_object(&mut self, id: ObjectId) -> bool {
        match self.objects.shift_remove(&id) {
            Some(object) => {
                if self.by_tag.get(&object.props.tag) == Some(&id) {
                    self.by_tag.remove(&object.props.tag);
                }
                true
            }
            None => false,
        }
    }

    fn request_redraw(&mut self) {
        self.redraws += 1;
    }

    fn hit_test(&self, point: Point) -> Option<ObjectId> {
        self.objects
            .values()
            .rev()
            .find(|o| o.props.selectable && o.bounds.contains(point.x, point.y))
            .map(|o| o.id)
    }

    fn drag_object(&mut self, id: ObjectId, to: Point) -> bool {
        let Some(object) = self.objects.get_mut(&id) else {
            return false;
        };
        if !object.props.selectable {
            return false;
        }

        object.props.left = to.x;
        object.props.top = to.y;
        object.bounds = object.props.bounds();

        for kind in [InteractionKind::Moving, InteractionKind::DragEnd] {
            self.events.push_back(InteractionEvent {
                kind,
                target: id,
                pointer: to,
            });
        }
        true
    }

    fn take_events(&mut self) -> Vec<InteractionEvent> {
        self.events.drain(..).collect()
    }

    fn tagged_keys(&self) -> Vec<ShapeKey> {
        self.objects.values().map(|o| o.props.tag.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(tag: &str, left: f64, top: f64) -> ObjectProps {
        ObjectProps {
            left,
            top,
            fill: "#000000".into(),
            shape: VisualShape::Rect {
                width: 10.0,
                height: 10.0,
            },
            tag: ShapeKey::from(tag),
            has_controls: false,
            selectable: true,
        }
    }

    #[test]
    fn test_add_and_find_by_tag() {
        let mut surface = MemorySurface::new();
        let id = surface.add_object(props("a", 0.0, 0.0));
        assert_eq!(surface.find_object_by_tag(&ShapeKey::from("a")), Some(id));
        assert_eq!(surface.find_object_by_tag(&ShapeKey::from("b")), None);
        assert_eq!(surface.len(), 1);
    }

    #[test]
    fn test_update_recomputes_bounds() {
        let mut surface = MemorySurface::new();
        let id = surface.add_object(props("a", 0.0, 0.0));
        let mut moved = props("a", 100.0, 50.0);
        moved.shape = VisualShape::Circle {
            radius: 5.0,
            angle: 0.0,
        };
        assert!(surface.update_object(id, moved));

        let bounds = surface.object(id).unwrap().bounds;
        assert_eq!((bounds.left, bounds.top, bounds.width), (100.0, 50.0, 10.0));
        assert!(!surface.update_object(999, props("x", 0.0, 0.0)));
    }

    #[test]
    fn test_remove_clears_tag() {
        let mut surface = MemorySurface::new();
        let id = surface.add_object(props("a", 0.0, 0.0));
        assert!(surface.remove_object(id));
        assert!(!surface.remove_object(id));
        assert_eq!(surface.find_object_by_tag(&ShapeKey::from("a")), None);
        assert!(surface.is_empty());
    }

    #[test]
    fn test_hit_test_picks_topmost() {
        let mut surface = MemorySurface::new();
        let _bottom = surface.add_object(props("bottom", 0.0, 0.0));
        let top = surface.add_object(props("top", 5.0, 5.0));
        assert_eq!(surface.hit_test(Point::new(7.0, 7.0)), Some(top));
        assert_eq!(surface.hit_test(Point::new(50.0, 50.0)), None);
    }

    #[test]
    fn test_drag_emits_moving_then_drag_end() {
        let mut surface = MemorySurface::new();
        let id = surface.add_object(props("a", 0.0, 0.0));
        assert!(surface.drag_object(id, Point::new(50.0, 60.0)));

        let events = surface.take_events();
        let kinds: Vec<InteractionKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![InteractionKind::Moving, InteractionKind::DragEnd]);
        assert!(events.iter().all(|e| e.target == id));
        assert_eq!(surface.object(id).unwrap().props.left, 50.0);
        assert!(surface.take_events().is_empty());
    }

    #[test]
    fn test_unselectable_object_cannot_be_dragged() {
        let mut surface = MemorySurface::new();
        let mut locked = props("a", 0.0, 0.0);
        locked.selectable = false;
        let id = surface.add_object(locked);
        assert!(!surface.drag_object(id, Point::new(1.0, 1.0)));
        assert_eq!(surface.hit_test(Point::new(1.0, 1.0)), None);
    }
}
