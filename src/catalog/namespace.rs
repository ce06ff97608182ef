//! Schema namespaces
//!
//! A namespace is a path-keyed container of record schemas, analogous to a
//! database catalog/schema. It is lazily populated: empty until the first
//! lookup, then bulk-loaded once under a lock so concurrent first-lookups
//! block rather than double-load. The namespace holds only a weak
//! back-reference to store-shared state, so a namespace handle kept by a
//! caller never keeps a torn-down store alive.

use crate::backend::{NamespaceHook, StoreBackend};
use crate::error::{Result, StoreError};
use crate::schema::RecordSchema;
use ahash::AHashMap;
use log::warn;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};

/// Store-shared state a namespace needs to load itself: the backend and the
/// registered extension hooks. Owned by the record store; namespaces hold
/// it weakly.
pub(crate) struct CatalogLink {
    pub backend: Arc<dyn StoreBackend>,
    pub hooks: Vec<Arc<dyn NamespaceHook>>,
}

/// One namespace's schema cache.
pub struct SchemaNamespace {
    path: String,
    store: Weak<CatalogLink>,
    /// `None` until the first successful load.
    schemas: RwLock<Option<AHashMap<String, Arc<RecordSchema>>>>,
    /// Serializes the load-and-populate step.
    load_lock: Mutex<()>,
}

impl SchemaNamespace {
    pub(crate) fn new(path: String, store: Weak<CatalogLink>) -> Self {
        Self {
            path,
            store,
            schemas: RwLock::new(None),
            load_lock: Mutex::new(()),
        }
    }

    /// Namespace path, e.g. `/Public`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Look up a schema by local name. Triggers the namespace load on first
    /// use. Names outside this namespace are simply not found; namespaces
    /// are never searched transitively.
    pub fn get_schema(&self, name: &str) -> Result<Option<Arc<RecordSchema>>> {
        self.ensure_loaded()?;
        let schemas = self.schemas.read();
        Ok(schemas
            .as_ref()
            .and_then(|map| map.get(name).cloned()))
    }

    /// All schemas in this namespace, loading it if necessary.
    pub fn list_schemas(&self) -> Result<Vec<Arc<RecordSchema>>> {
        self.ensure_loaded()?;
        let schemas = self.schemas.read();
        Ok(schemas
            .as_ref()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Invalidate the cache. The next lookup reloads from scratch; there is
    /// no partial refresh, matching the all-or-nothing nature of backend
    /// metadata enumeration.
    pub fn refresh(&self) {
        *self.schemas.write() = None;
    }

    /// Whether the namespace has been populated.
    pub fn is_loaded(&self) -> bool {
        self.schemas.read().is_some()
    }

    fn ensure_loaded(&self) -> Result<()> {
        // Fast path: already populated.
        if self.schemas.read().is_some() {
            return Ok(());
        }

        let _guard = self.load_lock.lock();
        // Double-check: another thread may have loaded while we waited.
        if self.schemas.read().is_some() {
            return Ok(());
        }

        let link = self.store.upgrade().ok_or(StoreError::StoreClosed)?;

        for hook in &link.hooks {
            if let Err(err) = hook.pre_process(&self.path) {
                warn!("pre-process hook failed for namespace '{}': {}", self.path, err);
            }
        }

        // A loader failure propagates and leaves the namespace unloaded, so
        // the next lookup retries the whole load.
        let mut loaded = link.backend.metadata().load_namespace(&self.path)?;

        for hook in &link.hooks {
            if let Err(err) = hook.post_process(&self.path, &mut loaded) {
                warn!("post-process hook failed for namespace '{}': {}", self.path, err);
            }
        }

        let mut map = AHashMap::with_capacity(loaded.len());
        for schema in loaded {
            map.insert(schema.path.name.clone(), Arc::new(schema));
        }
        *self.schemas.write() = Some(map);
        Ok(())
    }
}
