//! Field value types for stratadb records

mod spatial;

pub use spatial::{BoundingBox, Geometry, Point};

use serde::{Deserialize, Serialize};

/// Unified field value type covering the backends' column modalities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    /// Integer value
    Integer(i64),

    /// Floating point value
    Float(f64),

    /// Boolean value
    Bool(bool),

    /// Text string
    Text(String),

    /// Raw bytes (backend-opaque payloads)
    Bytes(Vec<u8>),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// Spatial geometry data
    Geometry(Geometry),

    /// Null value
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Geometry payload, if this value carries one.
    pub fn as_geometry(&self) -> Option<&Geometry> {
        match self {
            Value::Geometry(g) => Some(g),
            _ => None,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.partial_cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Geometry> for Value {
    fn from(v: Geometry) -> Self {
        Value::Geometry(v)
    }
}

/// Semantic field type declared by a record schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Integer,
    Float,
    Boolean,
    Text,
    Bytes,
    Timestamp,
    Geometry,
}

impl FieldType {
    /// Whether `value` is acceptable for a field of this type. Null is
    /// always acceptable here; required-ness is checked by the schema.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (FieldType::Integer, Value::Integer(_))
                | (FieldType::Float, Value::Float(_))
                | (FieldType::Float, Value::Integer(_))
                | (FieldType::Boolean, Value::Bool(_))
                | (FieldType::Text, Value::Text(_))
                | (FieldType::Bytes, Value::Bytes(_))
                | (FieldType::Timestamp, Value::Timestamp(_))
                | (FieldType::Geometry, Value::Geometry(_))
        )
    }
}
