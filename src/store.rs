//! The record store façade
//!
//! Owns the schema catalog and the transaction coordinator for one backend
//! adapter, dispatches queries to the iterator pipeline, and vends writers
//! through the transaction binding protocol. The store itself holds no
//! record data; everything flows through the backend traits.

use crate::backend::{NamespaceHook, StoreBackend};
use crate::catalog::{CatalogLink, SchemaCatalog, SchemaNamespace};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::query::pipeline::QueryPipeline;
use crate::query::Query;
use crate::record::Record;
use crate::schema::RecordSchema;
use crate::writer::binding::{Transaction, TransactionCoordinator, WriterHandle};
use std::sync::Arc;

/// Configures and builds a [`RecordStore`]. Namespace hooks must be
/// registered here; they are fixed for the life of the store.
pub struct StoreBuilder {
    backend: Arc<dyn StoreBackend>,
    config: StoreConfig,
    hooks: Vec<Arc<dyn NamespaceHook>>,
}

impl StoreBuilder {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend,
            config: StoreConfig::default(),
            hooks: Vec::new(),
        }
    }

    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an extension hook, run around every namespace load in
    /// registration order.
    pub fn hook(mut self, hook: Arc<dyn NamespaceHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn build(self) -> RecordStore {
        let link = Arc::new(CatalogLink {
            backend: self.backend.clone(),
            hooks: self.hooks,
        });
        let catalog = SchemaCatalog::new(Arc::downgrade(&link));
        let coordinator =
            TransactionCoordinator::new(self.backend, self.config.writer.clone());
        RecordStore {
            link,
            catalog,
            coordinator,
        }
    }
}

/// Top-level façade over one backend adapter.
///
/// Dropping the store tears down the catalog's shared state; namespace
/// handles kept by callers observe this as [`StoreError::StoreClosed`]
/// rather than keeping the store alive.
pub struct RecordStore {
    /// Strong owner of the state namespaces reference weakly.
    link: Arc<CatalogLink>,
    catalog: SchemaCatalog,
    coordinator: TransactionCoordinator,
}

impl RecordStore {
    /// Open a store over `backend` with default configuration and no hooks.
    pub fn open(backend: Arc<dyn StoreBackend>) -> Self {
        StoreBuilder::new(backend).build()
    }

    pub fn builder(backend: Arc<dyn StoreBackend>) -> StoreBuilder {
        StoreBuilder::new(backend)
    }

    /// Resolve a full schema path like `/Public/Roads`, loading the owning
    /// namespace on first use.
    pub fn get_schema(&self, full_path: &str) -> Result<Option<Arc<RecordSchema>>> {
        self.catalog.get_schema(full_path)
    }

    /// The namespace handle for `path` (created lazily, loaded on first
    /// schema lookup).
    pub fn namespace(&self, path: &str) -> Arc<SchemaNamespace> {
        self.catalog.namespace(path)
    }

    /// Invalidate every cached namespace; subsequent lookups reload.
    pub fn refresh(&self) {
        self.catalog.refresh_all();
    }

    /// Run one query as a lazy record iterator.
    pub fn query(&self, query: Query) -> Result<QueryPipeline> {
        self.query_all(vec![query])
    }

    /// Run several queries as one logical cursor, consumed in submission
    /// order. Every type path is resolved up front; the backend cursors
    /// themselves open lazily as the pipeline advances.
    pub fn query_all(&self, queries: Vec<Query>) -> Result<QueryPipeline> {
        let mut resolved = Vec::with_capacity(queries.len());
        for query in queries {
            let schema = self.get_schema(&query.type_path)?.ok_or_else(|| {
                StoreError::Schema(format!("unknown type path '{}'", query.type_path))
            })?;
            resolved.push((schema, query));
        }
        Ok(QueryPipeline::new(self.link.backend.clone(), resolved))
    }

    /// Begin an explicit transaction.
    pub fn begin(&self) -> Transaction {
        self.coordinator.begin()
    }

    /// Acquire a writer, standalone or bound to `tx`. See
    /// [`TransactionCoordinator::acquire_writer`].
    pub fn acquire_writer(&self, tx: Option<&Transaction>, strict: bool) -> Result<WriterHandle> {
        self.coordinator.acquire_writer(tx, strict)
    }

    /// Write one record as a single logical operation: a fresh writer is
    /// acquired, the record dispatched by state, and the writer closed
    /// (flushing and committing) before this returns.
    pub fn write(&self, record: &mut Record) -> Result<()> {
        let writer = self.acquire_writer(None, true)?;
        writer.write(record)?;
        writer.close()
    }

    /// Write one record inside `tx`. The statement is buffered on the
    /// transaction's strict writer and executes at the batch threshold or
    /// at commit; a failure marks the transaction rollback-only before
    /// propagating.
    pub fn write_in(&self, tx: &Transaction, record: &mut Record) -> Result<()> {
        let writer = self.acquire_writer(Some(tx), true)?;
        writer.write(record)
    }

    /// Number of transactions currently active on this store.
    pub fn active_transactions(&self) -> usize {
        self.coordinator.active_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordState;
    use crate::testutil::MockBackend;
    use crate::types::Value;

    fn store_with_roads() -> (Arc<MockBackend>, RecordStore) {
        let backend = Arc::new(MockBackend::new());
        backend.add_roads_schema();
        let store = RecordStore::open(backend.clone());
        (backend, store)
    }

    #[test]
    fn test_schema_resolution_through_store() {
        let (backend, store) = store_with_roads();

        let schema = store.get_schema("/Public/Roads").unwrap().unwrap();
        assert_eq!(schema.type_name(), "Roads");
        assert!(store.get_schema("/Public/Rivers").unwrap().is_none());
        assert_eq!(backend.load_calls(), 1);
    }

    #[test]
    fn test_query_end_to_end() {
        let (backend, store) = store_with_roads();
        backend.stage_rows(
            "/Public/Roads",
            vec![
                vec![Value::Integer(1), Value::Text("Main St".into()), Value::Null],
                vec![Value::Integer(2), Value::Text("Elm St".into()), Value::Null],
            ],
        );

        let records: Vec<Record> = store
            .query(Query::all("/Public/Roads"))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.state() == RecordState::Persisted));
    }

    #[test]
    fn test_query_unknown_path_is_schema_error() {
        let (_backend, store) = store_with_roads();
        assert!(matches!(
            store.query(Query::all("/Public/Rivers")),
            Err(StoreError::Schema(_))
        ));
    }

    #[test]
    fn test_one_shot_write_commits() {
        let (backend, store) = store_with_roads();
        let schema = store.get_schema("/Public/Roads").unwrap().unwrap();

        let mut record = Record::new(schema);
        record.set("name", "Main St").unwrap();
        store.write(&mut record).unwrap();

        assert_eq!(record.state(), RecordState::Persisted);
        assert_eq!(backend.executed_batches().len(), 1);
        assert_eq!(backend.commits(), 1);
        assert_eq!(backend.connections_released(), 1);
    }

    #[test]
    fn test_transactional_writes_share_one_batch() {
        let (backend, store) = store_with_roads();
        let schema = store.get_schema("/Public/Roads").unwrap().unwrap();

        let tx = store.begin();
        for name in ["A", "B", "C"] {
            let mut record = Record::new(schema.clone());
            record.set("name", name).unwrap();
            store.write_in(&tx, &mut record).unwrap();
        }
        // Buffered on the transaction's writer, nothing executed yet
        assert!(backend.executed_batches().is_empty());
        assert_eq!(backend.connections_acquired(), 1);

        tx.commit().unwrap();
        let batches = backend.executed_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].rows.len(), 3);
        assert_eq!(backend.commits(), 1);
    }

    #[test]
    fn test_refresh_forces_reload() {
        let (backend, store) = store_with_roads();

        store.get_schema("/Public/Roads").unwrap().unwrap();
        store.refresh();
        store.get_schema("/Public/Roads").unwrap().unwrap();
        assert_eq!(backend.load_calls(), 2);
    }

    #[test]
    fn test_namespace_survives_store_teardown() {
        let (_backend, store) = store_with_roads();
        let ns = store.namespace("/Public");
        drop(store);

        assert!(matches!(
            ns.get_schema("Roads"),
            Err(StoreError::StoreClosed)
        ));
    }
}
