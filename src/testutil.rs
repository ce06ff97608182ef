//! In-memory mock backend shared by the unit tests.
//!
//! Implements every backend trait against plain in-memory state, with
//! counters and fault injection hooks so tests can assert on exactly what
//! the core asked the backend to do.

use crate::backend::{
    Connection, ConnectionProvider, CursorFactory, MetadataLoader, MutationStatement,
    RecordCursor, StatementGenerator, StatementHandle, StatementKind, StoreBackend,
};
use crate::error::{Result, StoreError};
use crate::query::Query;
use crate::record::Record;
use crate::schema::{FieldDef, RecordSchema, SchemaPath};
use crate::types::{FieldType, Value};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One batch the mock connection executed: the prepared statement's text
/// plus the bound rows, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedBatch {
    pub statement: String,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Default)]
struct CursorCounters {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

#[derive(Default)]
struct Shared {
    schemas: Mutex<Vec<RecordSchema>>,
    /// Rows returned by cursors, keyed by full type path.
    staged: Mutex<AHashMap<String, Vec<Vec<Value>>>>,

    load_calls: AtomicUsize,
    load_delay_ms: AtomicU64,
    next_load_error: Mutex<Option<String>>,

    last_query: Mutex<Option<Query>>,
    next_cursor_error: Mutex<Option<String>>,
    cursor_log: Mutex<Option<Arc<CursorCounters>>>,

    statement_builds: AtomicUsize,
    prepare_calls: AtomicUsize,
    released_statements: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    connections_acquired: AtomicUsize,
    connections_released: AtomicUsize,

    next_handle: AtomicU64,
    /// handle -> prepared statement text, across all mock connections.
    prepared: Mutex<AHashMap<u64, String>>,
    /// Fail the next execute whose statement text contains the needle.
    execute_failure: Mutex<Option<(String, Vec<String>)>>,
    executed: Mutex<Vec<ExecutedBatch>>,
}

pub struct MockBackend {
    shared: Arc<Shared>,
}

impl MockBackend {
    pub fn new() -> Self {
        // Surface warn!/error! output from the code under test when the
        // suite runs with RUST_LOG set.
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            shared: Arc::new(Shared::default()),
        }
    }

    fn register(&self, schema: RecordSchema) -> Arc<RecordSchema> {
        let arc = Arc::new(schema.clone());
        self.shared.schemas.lock().push(schema);
        arc
    }

    /// `/Public/Roads`: generated integer id, name, geometry.
    pub fn add_roads_schema(&self) -> Arc<RecordSchema> {
        self.register(
            RecordSchema::new(
                SchemaPath::new("/Public", "Roads"),
                vec![
                    FieldDef::new("id", FieldType::Integer).required().generated(),
                    FieldDef::new("name", FieldType::Text),
                    FieldDef::new("geom", FieldType::Geometry),
                ],
            )
            .with_id_fields(vec!["id".into()])
            .with_geometry_field("geom"),
        )
    }

    /// `/Public/Signs`: generated integer id plus a label.
    pub fn add_signs_schema(&self) -> Arc<RecordSchema> {
        self.register(
            RecordSchema::new(
                SchemaPath::new("/Public", "Signs"),
                vec![
                    FieldDef::new("id", FieldType::Integer).required().generated(),
                    FieldDef::new("label", FieldType::Text),
                ],
            )
            .with_id_fields(vec!["id".into()]),
        )
    }

    pub fn roads_schema(&self) -> Arc<RecordSchema> {
        self.schema("Roads")
    }

    pub fn signs_schema(&self) -> Arc<RecordSchema> {
        self.schema("Signs")
    }

    fn schema(&self, name: &str) -> Arc<RecordSchema> {
        self.shared
            .schemas
            .lock()
            .iter()
            .find(|s| s.type_name() == name)
            .cloned()
            .map(Arc::new)
            .unwrap_or_else(|| panic!("schema '{}' not registered", name))
    }

    /// Stage raw rows for cursors over `type_path`, in schema field order.
    pub fn stage_rows(&self, type_path: &str, rows: Vec<Vec<Value>>) {
        self.shared
            .staged
            .lock()
            .insert(type_path.to_string(), rows);
    }

    pub fn load_calls(&self) -> usize {
        self.shared.load_calls.load(Ordering::SeqCst)
    }

    /// Fail the next metadata load with `msg`.
    pub fn fail_next_load(&self, msg: &str) {
        *self.shared.next_load_error.lock() = Some(msg.to_string());
    }

    /// Make every metadata load sleep, to widen concurrency windows.
    pub fn delay_loads_ms(&self, ms: u64) {
        self.shared.load_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Fail the next cursor open with `msg`.
    pub fn fail_next_cursor(&self, msg: &str) {
        *self.shared.next_cursor_error.lock() = Some(msg.to_string());
    }

    /// The query most recently handed to `open_cursor`, after any fallback
    /// rewriting by the pipeline.
    pub fn last_query(&self) -> Option<Query> {
        self.shared.last_query.lock().clone()
    }

    /// Fail the next batch execute whose statement text contains
    /// `needle`, reporting `row_errors`.
    pub fn fail_executes_matching(&self, needle: &str, row_errors: Vec<String>) {
        *self.shared.execute_failure.lock() = Some((needle.to_string(), row_errors));
    }

    pub fn executed_batches(&self) -> Vec<ExecutedBatch> {
        self.shared.executed.lock().clone()
    }

    pub fn statement_builds(&self) -> usize {
        self.shared.statement_builds.load(Ordering::SeqCst)
    }

    pub fn prepare_calls(&self) -> usize {
        self.shared.prepare_calls.load(Ordering::SeqCst)
    }

    pub fn released_statements(&self) -> usize {
        self.shared.released_statements.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.shared.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.shared.rollbacks.load(Ordering::SeqCst)
    }

    pub fn connections_acquired(&self) -> usize {
        self.shared.connections_acquired.load(Ordering::SeqCst)
    }

    pub fn connections_released(&self) -> usize {
        self.shared.connections_released.load(Ordering::SeqCst)
    }
}

impl MetadataLoader for MockBackend {
    fn load_namespace(&self, namespace: &str) -> Result<Vec<RecordSchema>> {
        self.shared.load_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.shared.load_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if let Some(msg) = self.shared.next_load_error.lock().take() {
            return Err(StoreError::Schema(msg));
        }
        Ok(self
            .shared
            .schemas
            .lock()
            .iter()
            .filter(|s| s.path.namespace == namespace)
            .cloned()
            .collect())
    }
}

impl StatementGenerator for MockBackend {
    fn mutation(&self, schema: &RecordSchema, kind: StatementKind) -> Result<MutationStatement> {
        self.shared.statement_builds.fetch_add(1, Ordering::SeqCst);
        let type_name = schema.type_name();
        let is_id = |name: &str| schema.id_fields.iter().any(|id| id == name);

        let (text, bind_fields) = match kind {
            StatementKind::Insert => {
                let cols: Vec<String> =
                    schema.fields.iter().map(|f| f.name.clone()).collect();
                (
                    format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        type_name,
                        cols.join(", "),
                        placeholders(cols.len())
                    ),
                    cols,
                )
            }
            StatementKind::InsertGeneratedKey => {
                let cols: Vec<String> = schema
                    .fields
                    .iter()
                    .filter(|f| !f.generated)
                    .map(|f| f.name.clone())
                    .collect();
                (
                    format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        type_name,
                        cols.join(", "),
                        placeholders(cols.len())
                    ),
                    cols,
                )
            }
            StatementKind::Update => {
                let sets: Vec<String> = schema
                    .fields
                    .iter()
                    .filter(|f| !is_id(&f.name))
                    .map(|f| f.name.clone())
                    .collect();
                let mut bind = sets.clone();
                bind.extend(schema.id_fields.iter().cloned());
                (
                    format!(
                        "UPDATE {} SET {} WHERE {}",
                        type_name,
                        sets.iter()
                            .map(|c| format!("{} = ?", c))
                            .collect::<Vec<_>>()
                            .join(", "),
                        key_clause(&schema.id_fields)
                    ),
                    bind,
                )
            }
            StatementKind::Delete => (
                format!(
                    "DELETE FROM {} WHERE {}",
                    type_name,
                    key_clause(&schema.id_fields)
                ),
                schema.id_fields.clone(),
            ),
        };
        Ok(MutationStatement { text, bind_fields })
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn key_clause(ids: &[String]) -> String {
    ids.iter()
        .map(|c| format!("{} = ?", c))
        .collect::<Vec<_>>()
        .join(" AND ")
}

struct MockConnection {
    shared: Arc<Shared>,
}

impl Connection for MockConnection {
    fn prepare(&mut self, statement: &MutationStatement) -> Result<StatementHandle> {
        self.shared.prepare_calls.fetch_add(1, Ordering::SeqCst);
        let id = self.shared.next_handle.fetch_add(1, Ordering::SeqCst);
        self.shared
            .prepared
            .lock()
            .insert(id, statement.text.clone());
        Ok(StatementHandle(id))
    }

    fn execute_batch(&mut self, handle: StatementHandle, rows: &[Vec<Value>]) -> Result<()> {
        let text = self
            .shared
            .prepared
            .lock()
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| StoreError::Connection("unknown statement handle".into()))?;

        let mut failure = self.shared.execute_failure.lock();
        if failure.as_ref().is_some_and(|(needle, _)| text.contains(needle)) {
            let (_, row_errors) = failure.take().expect("failure config present");
            return Err(StoreError::Backend {
                statement: text,
                message: "batch execute failed".into(),
                row_errors,
            });
        }
        drop(failure);

        self.shared.executed.lock().push(ExecutedBatch {
            statement: text,
            rows: rows.to_vec(),
        });
        Ok(())
    }

    fn release(&mut self, handle: StatementHandle) {
        if self.shared.prepared.lock().remove(&handle.0).is_some() {
            self.shared
                .released_statements
                .fetch_add(1, Ordering::SeqCst);
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ConnectionProvider for MockBackend {
    fn acquire(&self) -> Result<Box<dyn Connection>> {
        self.shared
            .connections_acquired
            .fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            shared: self.shared.clone(),
        }))
    }

    fn release(&self, conn: Box<dyn Connection>) {
        self.shared
            .connections_released
            .fetch_add(1, Ordering::SeqCst);
        drop(conn);
    }
}

struct MockCursor {
    rows: std::vec::IntoIter<Vec<Value>>,
    log: Option<Arc<CursorCounters>>,
    closed: bool,
}

impl RecordCursor for MockCursor {
    fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        Ok(self.rows.next())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Some(log) = &self.log {
                log.closed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

impl CursorFactory for MockBackend {
    fn open_cursor(
        &self,
        schema: &Arc<RecordSchema>,
        query: &Query,
    ) -> Result<Box<dyn RecordCursor>> {
        *self.shared.last_query.lock() = Some(query.clone());
        if let Some(msg) = self.shared.next_cursor_error.lock().take() {
            return Err(StoreError::Query(msg));
        }

        let staged = self
            .shared
            .staged
            .lock()
            .get(&query.type_path)
            .cloned()
            .unwrap_or_default();

        let mut rows: Vec<Vec<Value>> = staged
            .into_iter()
            .filter(|row| row_matches(schema, query, row))
            .collect();
        if let Some(offset) = query.offset {
            rows = rows.into_iter().skip(offset).collect();
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        let log = self.shared.cursor_log.lock().clone();
        if let Some(log) = &log {
            log.opened.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Box::new(MockCursor {
            rows: rows.into_iter(),
            log,
            closed: false,
        }))
    }
}

/// Evaluate a query's predicates against a raw row by materializing a
/// throwaway record.
fn row_matches(schema: &Arc<RecordSchema>, query: &Query, row: &[Value]) -> bool {
    if query.filter.is_none() && query.spatial.is_none() {
        return true;
    }
    let Some(record) = probe_record(schema, row) else {
        return false;
    };
    if let Some(filter) = &query.filter {
        if !filter.matches(&record) {
            return false;
        }
    }
    if let Some(spatial) = &query.spatial {
        if !spatial.matches(&record) {
            return false;
        }
    }
    true
}

fn probe_record(schema: &Arc<RecordSchema>, row: &[Value]) -> Option<Record> {
    if row.len() != schema.field_count() {
        return None;
    }
    let mut record = Record::initializing(schema.clone());
    for (field, value) in schema.fields.iter().zip(row) {
        record.set(&field.name, value.clone()).ok()?;
    }
    record.complete().ok()?;
    Some(record)
}

impl StoreBackend for MockBackend {
    fn metadata(&self) -> &dyn MetadataLoader {
        self
    }

    fn statements(&self) -> &dyn StatementGenerator {
        self
    }

    fn connections(&self) -> &dyn ConnectionProvider {
        self
    }

    fn cursors(&self) -> &dyn CursorFactory {
        self
    }
}

/// Observes cursor opens and closes on one mock backend.
pub struct MockCursorLog {
    counters: Arc<CursorCounters>,
}

impl MockCursorLog {
    pub fn attach(backend: &Arc<MockBackend>) -> Self {
        let counters = Arc::new(CursorCounters::default());
        *backend.shared.cursor_log.lock() = Some(counters.clone());
        Self { counters }
    }

    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }
}
