//! Query value objects
//!
//! A `Query` describes what to fetch: the record type, an optional
//! predicate, an optional spatial filter, ordering, and limit/offset. It
//! carries no backend state; adapters interpret it into their own dialect.
//! The in-memory evaluators here back the pipeline's filter+scan fallback
//! and the test backend.

pub mod pipeline;

use crate::record::Record;
use crate::types::{BoundingBox, Value};
use serde::{Deserialize, Serialize};

/// Attribute predicate over record fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// field == value
    Eq(String, Value),
    /// field != value
    Ne(String, Value),
    /// field > value
    Gt(String, Value),
    /// field < value
    Lt(String, Value),
    /// field IS NULL
    IsNull(String),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Evaluate this predicate against a record. Unknown fields and
    /// cross-modal comparisons evaluate to false.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::Eq(field, value) => {
                record.get(field).map(|v| v == value).unwrap_or(false)
            }
            Filter::Ne(field, value) => {
                record.get(field).map(|v| v != value).unwrap_or(false)
            }
            Filter::Gt(field, value) => record
                .get(field)
                .ok()
                .and_then(|v| v.partial_cmp(value))
                .map(|ord| ord == std::cmp::Ordering::Greater)
                .unwrap_or(false),
            Filter::Lt(field, value) => record
                .get(field)
                .ok()
                .and_then(|v| v.partial_cmp(value))
                .map(|ord| ord == std::cmp::Ordering::Less)
                .unwrap_or(false),
            Filter::IsNull(field) => {
                record.get(field).map(|v| v.is_null()).unwrap_or(false)
            }
            Filter::And(a, b) => a.matches(record) && b.matches(record),
            Filter::Or(a, b) => a.matches(record) || b.matches(record),
            Filter::Not(inner) => !inner.matches(record),
        }
    }

    pub fn and(self, other: Filter) -> Filter {
        Filter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Filter) -> Filter {
        Filter::Or(Box::new(self), Box::new(other))
    }
}

/// Spatial filter: geometry field intersects a bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialFilter {
    pub bbox: BoundingBox,
}

impl SpatialFilter {
    pub fn intersecting(bbox: BoundingBox) -> Self {
        Self { bbox }
    }

    /// Evaluate against the record's designated geometry field. Records
    /// with no geometry field or a null geometry do not match.
    pub fn matches(&self, record: &Record) -> bool {
        let Some(field) = record.schema().geometry_field.clone() else {
            return false;
        };
        record
            .get(&field)
            .ok()
            .and_then(|v| v.as_geometry())
            .map(|g| g.intersects_bbox(&self.bbox))
            .unwrap_or(false)
    }
}

/// Sort direction for one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOrder {
    pub field: String,
    pub ascending: bool,
}

impl SortOrder {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: true,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ascending: false,
        }
    }
}

/// A value object describing what to fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    /// Full schema path of the record type, e.g. `/Public/Roads`.
    pub type_path: String,
    /// Attribute predicate, if any.
    pub filter: Option<Filter>,
    /// Spatial filter on the schema's geometry field, if any.
    pub spatial: Option<SpatialFilter>,
    /// Requested result ordering.
    pub order_by: Vec<SortOrder>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Query {
    pub fn all(type_path: impl Into<String>) -> Self {
        Self {
            type_path: type_path.into(),
            filter: None,
            spatial: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_spatial(mut self, spatial: SpatialFilter) -> Self {
        self.spatial = Some(spatial);
        self
    }

    pub fn order_by(mut self, order: SortOrder) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}
