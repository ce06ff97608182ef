//! Record schema definitions
//!
//! A `RecordSchema` describes one record type: ordered field definitions,
//! id field(s), an optional designated geometry field, and an arbitrary
//! property bag (permissions and the like). Once published into the schema
//! namespace cache a schema is immutable for the rest of the process; only
//! a full namespace refresh replaces it.

use crate::types::FieldType;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Hierarchical schema path: namespace plus local type name, rendered as
/// `/namespace/segments/LocalName`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaPath {
    /// Namespace portion, e.g. `/Public`
    pub namespace: String,
    /// Local type name, e.g. `Roads`
    pub name: String,
}

impl SchemaPath {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: normalize(&namespace.into()),
            name: name.into(),
        }
    }

    /// Parse a full path like `/Public/Roads` into namespace + local name.
    /// Everything before the final segment is the namespace. A trailing
    /// slash means an empty local name and is rejected.
    pub fn parse(full: &str) -> Option<Self> {
        if full.len() > 1 && full.ends_with('/') {
            return None;
        }
        let full = normalize(full);
        let (namespace, name) = full.rsplit_once('/')?;
        if name.is_empty() {
            return None;
        }
        let namespace = if namespace.is_empty() { "/" } else { namespace };
        Some(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    /// Full path string.
    pub fn full(&self) -> String {
        if self.namespace == "/" {
            format!("/{}", self.name)
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

impl std::fmt::Display for SchemaPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full())
    }
}

/// Field definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Semantic field type
    pub field_type: FieldType,
    /// Whether a non-null value is required
    pub required: bool,
    /// Whether the backend generates this field's value (identity columns,
    /// generated keys)
    pub generated: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            generated: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }
}

/// Schema for one record type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSchema {
    /// Hierarchical path identifying this type
    pub path: SchemaPath,
    /// Field definitions (ordered)
    pub fields: Vec<FieldDef>,
    /// Names of the id field(s), a subset of `fields`
    pub id_fields: Vec<String>,
    /// Designated geometry field, if any
    pub geometry_field: Option<String>,
    /// Arbitrary properties (permissions, backend hints)
    pub properties: AHashMap<String, serde_json::Value>,
    /// Field name -> position mapping
    #[serde(skip)]
    field_map: AHashMap<String, usize>,
}

impl RecordSchema {
    /// Create a new record schema
    pub fn new(path: SchemaPath, fields: Vec<FieldDef>) -> Self {
        let mut schema = Self {
            path,
            fields,
            id_fields: Vec::new(),
            geometry_field: None,
            properties: AHashMap::new(),
            field_map: AHashMap::new(),
        };
        schema.rebuild_field_map();
        schema
    }

    /// Set the id field(s)
    pub fn with_id_fields(mut self, ids: Vec<String>) -> Self {
        self.id_fields = ids;
        self
    }

    /// Designate the geometry field
    pub fn with_geometry_field(mut self, name: impl Into<String>) -> Self {
        self.geometry_field = Some(name.into());
        self
    }

    /// Attach a property
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Get field definition by name
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.field_map.get(name).map(|&pos| &self.fields[pos])
    }

    /// Get field position by name
    pub fn field_position(&self, name: &str) -> Option<usize> {
        self.field_map.get(name).copied()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Local type name
    pub fn type_name(&self) -> &str {
        &self.path.name
    }

    /// Whether every id field is marked backend-generated. Drives the
    /// writer's choice between the explicit-id and generated-key insert
    /// forms.
    pub fn ids_generated(&self) -> bool {
        !self.id_fields.is_empty()
            && self.id_fields.iter().all(|id| {
                self.field(id).map(|f| f.generated).unwrap_or(false)
            })
    }

    /// Rebuild field map (call after deserialization)
    pub fn rebuild_field_map(&mut self) {
        self.field_map.clear();
        for (pos, field) in self.fields.iter().enumerate() {
            self.field_map.insert(field.name.clone(), pos);
        }
    }
}
