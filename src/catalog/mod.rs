//! Schema catalog: the per-store namespace cache
//!
//! Maps namespace paths to lazily-loaded `SchemaNamespace` instances.
//! Creating a namespace entry is cheap; the actual metadata load happens on
//! that namespace's first schema lookup.

mod namespace;

pub use namespace::SchemaNamespace;
pub(crate) use namespace::CatalogLink;

use crate::error::Result;
use crate::schema::{RecordSchema, SchemaPath};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

/// Per-store namespace cache.
pub struct SchemaCatalog {
    link: Weak<CatalogLink>,
    namespaces: RwLock<AHashMap<String, Arc<SchemaNamespace>>>,
}

impl SchemaCatalog {
    pub(crate) fn new(link: Weak<CatalogLink>) -> Self {
        Self {
            link,
            namespaces: RwLock::new(AHashMap::new()),
        }
    }

    /// Get (or lazily create) the namespace for `path`. Creation does not
    /// load it.
    pub fn namespace(&self, path: &str) -> Arc<SchemaNamespace> {
        if let Some(ns) = self.namespaces.read().get(path) {
            return ns.clone();
        }
        let mut namespaces = self.namespaces.write();
        namespaces
            .entry(path.to_string())
            .or_insert_with(|| {
                Arc::new(SchemaNamespace::new(path.to_string(), self.link.clone()))
            })
            .clone()
    }

    /// Resolve a full schema path like `/Public/Roads`. Returns `None` for
    /// unknown local names; loads the owning namespace on first use.
    pub fn get_schema(&self, full_path: &str) -> Result<Option<Arc<RecordSchema>>> {
        let Some(path) = SchemaPath::parse(full_path) else {
            return Ok(None);
        };
        self.namespace(&path.namespace).get_schema(&path.name)
    }

    /// Invalidate every cached namespace.
    pub fn refresh_all(&self) {
        for ns in self.namespaces.read().values() {
            ns.refresh();
        }
    }
}
