//! Geometry values for spatial filtering
//!
//! Just enough geometry for a record store: points, axis-aligned bounds,
//! and the bbox intersection test behind the spatial query filter. Real
//! geometry math belongs to backend adapters. Nothing here panics on
//! degenerate input: an empty geometry has no bounds and matches no
//! spatial filter.

use serde::{Deserialize, Serialize};

/// 2D coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    /// Box spanning two corner coordinates, accepted in either order.
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            min_x: x1.min(x2),
            min_y: y1.min(y2),
            max_x: x1.max(x2),
            max_y: y1.max(y2),
        }
    }

    /// Degenerate box covering a single coordinate.
    pub fn around(point: Point) -> Self {
        Self::new(point.x, point.y, point.x, point.y)
    }

    /// Tight bounds of a point sequence; `None` when empty.
    pub fn of_points(points: &[Point]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        let mut bounds = Self::around(*first);
        for p in rest {
            bounds.min_x = bounds.min_x.min(p.x);
            bounds.min_y = bounds.min_y.min(p.y);
            bounds.max_x = bounds.max_x.max(p.x);
            bounds.max_y = bounds.max_y.max(p.y);
        }
        Some(bounds)
    }

    pub fn contains(&self, point: &Point) -> bool {
        (self.min_x..=self.max_x).contains(&point.x)
            && (self.min_y..=self.max_y).contains(&point.y)
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }
}

/// Geometry kinds storable in a record's geometry field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Point(Point),
    LineString(Vec<Point>),
    /// Outer ring; the first point is repeated last when closed.
    Polygon(Vec<Point>),
}

impl Geometry {
    /// Tight bounds of this geometry, or `None` for an empty line or
    /// polygon.
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        match self {
            Geometry::Point(p) => Some(BoundingBox::around(*p)),
            Geometry::LineString(points) | Geometry::Polygon(points) => {
                BoundingBox::of_points(points)
            }
        }
    }

    /// Whether this geometry's bounds intersect `bbox`. An empty geometry
    /// intersects nothing.
    pub fn intersects_bbox(&self, bbox: &BoundingBox) -> bool {
        self.bounding_box()
            .is_some_and(|bounds| bounds.intersects(bbox))
    }
}
