//! Shape records — the unit of content stored in the shared map.
//!
//! A record is stored in the replicated map as a JSON object string:
//!
//! ```text
//! {"shape":"Rect","left":10,"top":20,"fill":"#a1b2c3","width":70,"height":70}
//! {"shape":"Circle","left":5,"top":8,"fill":"#123456","radius":40,"angle":50}
//! ```
//!
//! Decoding switches on the `shape` tag, so a record written by a newer peer
//! with a kind we don't know surfaces as [`ShapeError::UnknownKind`] instead of
//! a panic.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Default rectangle size for the toolbar action.
pub const DEFAULT_RECT_SIZE: f64 = 70.0;
/// Default circle radius for the toolbar action.
pub const DEFAULT_CIRCLE_RADIUS: f64 = 40.0;
/// Default circle angle for the toolbar action.
pub const DEFAULT_CIRCLE_ANGLE: f64 = 50.0;

// ───────────────────────────────────────────────────────────────────
// Kind & geometry
// ───────────────────────────────────────────────────────────────────

/// Kind of a shape. Immutable for the lifetime of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShapeKind {
    Rectangle,
    Circle,
}

impl ShapeKind {
    /// Tag written into the `shape` field of the stored record.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ShapeKind::Rectangle => "Rect",
            ShapeKind::Circle => "Circle",
        }
    }

    /// Parse a `shape` tag. Returns `None` for kinds this build doesn't know.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "Rect" => Some(ShapeKind::Rectangle),
            "Circle" => Some(ShapeKind::Circle),
            _ => None,
        }
    }
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Kind-specific geometry. The variant *is* the kind, so a record can never
/// carry circle fields on a rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Rectangle { width: f64, height: f64 },
    Circle { radius: f64, angle: f64 },
}

impl Geometry {
    /// Fixed geometry used by the add-shape actions.
    pub fn default_for(kind: ShapeKind) -> Self {
        match kind {
            ShapeKind::Rectangle => Geometry::Rectangle {
                width: DEFAULT_RECT_SIZE,
                height: DEFAULT_RECT_SIZE,
            },
            ShapeKind::Circle => Geometry::Circle {
                radius: DEFAULT_CIRCLE_RADIUS,
                angle: DEFAULT_CIRCLE_ANGLE,
            },
        }
    }

    pub fn kind(&self) -> ShapeKind {
        match self {
            Geometry::Rectangle { .. } => ShapeKind::Rectangle,
            Geometry::Circle { .. } => ShapeKind::Circle,
        }
    }

    /// Width and height of the axis-aligned box enclosing the shape.
    pub fn extent(&self) -> (f64, f64) {
        match *self {
            Geometry::Rectangle { width, height } => (width, height),
            Geometry::Circle { radius, .. } => (radius * 2.0, radius * 2.0),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Keys
// ───────────────────────────────────────────────────────────────────

/// Key of a shape in the shared map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeKey(String);

impl ShapeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShapeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShapeKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ShapeKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Session-scoped key generator.
///
/// Keys are `<stamp:016x>-<salt:08x>`: the stamp is a strictly increasing
/// microsecond timestamp, so keys never repeat within a session and sort in
/// creation order. The salt is random per session and makes cross-client
/// collisions unlikely; a collision would only overwrite the same slot,
/// which last-writer-wins already tolerates.
#[derive(Debug)]
pub struct KeyGenerator {
    last_stamp: AtomicU64,
    salt: u32,
}

impl KeyGenerator {
    pub fn new(salt: u32) -> Self {
        Self {
            last_stamp: AtomicU64::new(0),
            salt,
        }
    }

    /// Produce a fresh key.
    pub fn next_key(&self) -> ShapeKey {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;

        let mut prev = self.last_stamp.load(Ordering::Relaxed);
        let stamp = loop {
            let candidate = now.max(prev + 1);
            match self.last_stamp.compare_exchange_weak(
                prev,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break candidate,
                Err(actual) => prev = actual,
            }
        };

        ShapeKey(format!("{stamp:016x}-{:08x}", self.salt))
    }
}

// ───────────────────────────────────────────────────────────────────
// Records
// ───────────────────────────────────────────────────────────────────

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bounds {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.left && x <= self.left + self.width && y >= self.top && y <= self.top + self.height
    }
}

/// A shape as stored in the shared map. Always written as a full replace.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeRecord {
    pub left: f64,
    pub top: f64,
    pub fill: String,
    pub geometry: Geometry,
}

impl ShapeRecord {
    pub fn new(left: f64, top: f64, fill: impl Into<String>, geometry: Geometry) -> Self {
        Self {
            left,
            top,
            fill: fill.into(),
            geometry,
        }
    }

    pub fn kind(&self) -> ShapeKind {
        self.geometry.kind()
    }

    /// Copy of this record at a new position; every other field is preserved.
    pub fn moved_to(&self, left: f64, top: f64) -> Self {
        Self {
            left,
            top,
            ..self.clone()
        }
    }

    pub fn bounds(&self) -> Bounds {
        let (width, height) = self.geometry.extent();
        Bounds {
            left: self.left,
            top: self.top,
            width,
            height,
        }
    }

    /// Encode to the JSON object string stored in the map.
    pub fn to_json(&self) -> Result<String, ShapeError> {
        let (width, height, radius, angle) = match self.geometry {
            Geometry::Rectangle { width, height } => (Some(width), Some(height), None, None),
            Geometry::Circle { radius, angle } => (None, None, Some(radius), Some(angle)),
        };
        let raw = RawShape {
            shape: self.kind().wire_name().to_string(),
            left: self.left,
            top: self.top,
            fill: self.fill.clone(),
            width,
            height,
            radius,
            angle,
        };
        Ok(serde_json::to_string(&raw)?)
    }

    /// Decode the JSON object string stored in the map.
    pub fn from_json(json: &str) -> Result<Self, ShapeError> {
        let raw: RawShape = serde_json::from_str(json)?;
        let kind =
            ShapeKind::from_wire(&raw.shape).ok_or_else(|| ShapeError::UnknownKind(raw.shape.clone()))?;

        let geometry = match kind {
            ShapeKind::Rectangle => Geometry::Rectangle {
                width: raw.width.ok_or(ShapeError::MissingField { kind, field: "width" })?,
                height: raw.height.ok_or(ShapeError::MissingField { kind, field: "height" })?,
            },
            ShapeKind::Circle => Geometry::Circle {
                radius: raw.radius.ok_or(ShapeError::MissingField { kind, field: "radius" })?,
                // Older clients wrote the angle under a misspelled field.
                angle: raw.angle.unwrap_or(0.0),
            },
        };

        Ok(Self {
            left: raw.left,
            top: raw.top,
            fill: raw.fill,
            geometry,
        })
    }
}

/// Flat wire form of a record.
#[derive(Debug, Serialize, Deserialize)]
struct RawShape {
    shape: String,
    left: f64,
    top: f64,
    fill: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    radius: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    angle: Option<f64>,
}

/// Errors decoding or encoding a shape record.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShapeError {
    #[error("unknown shape kind '{0}'")]
    UnknownKind(String),
    #[error("{kind} record is missing '{field}'")]
    MissingField { kind: ShapeKind, field: &'static str },
    #[error("stored value is not a shape record: {0}")]
    NotARecord(String),
    #[error("malformed shape json: {0}")]
    Json(String),
}

impl From<serde_json::Error> for ShapeError {
    fn from(e: serde_json::Error) -> Self {
        ShapeError::Json(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rectangle_json_roundtrip() {
        let rect = ShapeRecord::new(10.0, 20.0, "#ff0000", Geometry::default_for(ShapeKind::Rectangle));
        let json = rect.to_json().unwrap();
        assert!(json.contains("\"shape\":\"Rect\""));
        assert!(!json.contains("radius"));
        assert_eq!(ShapeRecord::from_json(&json).unwrap(), rect);
    }

    #[test]
    fn test_circle_json_fields() {
        let circle = ShapeRecord::new(1.0, 2.0, "#00ff00", Geometry::default_for(ShapeKind::Circle));
        let json = circle.to_json().unwrap();
        assert!(json.contains("\"radius\":40"));
        assert!(json.contains("\"angle\":50"));
        assert!(!json.contains("width"));
    }

    #[test]
    fn test_unknown_kind_is_reported() {
        let json = r##"{"shape":"Triangle","left":0,"top":0,"fill":"#000"}"##;
        assert_eq!(
            ShapeRecord::from_json(json),
            Err(ShapeError::UnknownKind("Triangle".into()))
        );
    }

    #[test]
    fn test_missing_geometry_is_reported() {
        let json = r##"{"shape":"Rect","left":0,"top":0,"fill":"#000","width":5}"##;
        assert_eq!(
            ShapeRecord::from_json(json),
            Err(ShapeError::MissingField {
                kind: ShapeKind::Rectangle,
                field: "height"
            })
        );
    }

    #[test]
    fn test_circle_without_angle_defaults_to_zero() {
        let json = r##"{"shape":"Circle","left":3,"top":4,"fill":"#abc","radius":40,"andgle":50}"##;
        let record = ShapeRecord::from_json(json).unwrap();
        assert_eq!(record.geometry, Geometry::Circle { radius: 40.0, angle: 0.0 });
    }

    #[test]
    fn test_garbage_json() {
        assert!(matches!(ShapeRecord::from_json("not json"), Err(ShapeError::Json(_))));
    }

    #[test]
    fn test_moved_to_preserves_fields() {
        let rect = ShapeRecord::new(10.0, 20.0, "#123456", Geometry::Rectangle { width: 30.0, height: 40.0 });
        let moved = rect.moved_to(50.0, 60.0);
        assert_eq!(moved.left, 50.0);
        assert_eq!(moved.top, 60.0);
        assert_eq!(moved.fill, rect.fill);
        assert_eq!(moved.geometry, rect.geometry);
    }

    #[test]
    fn test_circle_bounds() {
        let circle = ShapeRecord::new(0.0, 0.0, "#fff", Geometry::Circle { radius: 10.0, angle: 0.0 });
        let bounds = circle.bounds();
        assert_eq!(bounds.width, 20.0);
        assert!(bounds.contains(19.0, 19.0));
        assert!(!bounds.contains(21.0, 5.0));
    }

    #[test]
    fn test_key_generator_monotonic_and_unique() {
        let keys = KeyGenerator::new(0xdead_beef);
        let generated: Vec<ShapeKey> = (0..1000).map(|_| keys.next_key()).collect();
        for pair in generated.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
        assert!(generated[0].as_str().ends_with("-deadbeef"));
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(ShapeKind::from_wire("Rect"), Some(ShapeKind::Rectangle));
        assert_eq!(ShapeKind::from_wire("Circle"), Some(ShapeKind::Circle));
        assert_eq!(ShapeKind::from_wire("Ellipse"), None);
        assert_eq!(ShapeKind::Circle.to_string(), "Circle");
    }
}
