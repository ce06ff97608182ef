//! Backend adapter contracts
//!
//! The record store core is backend-agnostic; everything that actually
//! touches a relational database or a native geodatabase handle lives
//! behind these traits. Adapters implement them; the core only consumes
//! them. No SQL dialect text or native handle calls belong here.

use crate::error::Result;
use crate::query::Query;
use crate::schema::RecordSchema;
use crate::types::Value;
use std::sync::Arc;

/// Mutation operation kind, keyed with the record type in the writer's
/// statement cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// Insert with explicit id values bound by the caller.
    Insert,
    /// Insert relying on the backend to generate the id.
    InsertGeneratedKey,
    /// Update keyed by id field(s).
    Update,
    /// Delete keyed by id field(s).
    Delete,
}

/// A parameterized mutation produced by the backend's statement generator:
/// the statement text plus the ordered field names to bind per row.
#[derive(Debug, Clone)]
pub struct MutationStatement {
    pub text: String,
    pub bind_fields: Vec<String>,
}

/// Opaque handle to a statement prepared on one connection. Only valid for
/// the connection that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementHandle(pub u64);

/// Backend metadata loader, invoked once per namespace per cache
/// generation.
pub trait MetadataLoader: Send + Sync {
    /// Enumerate every record schema under `namespace`. All-or-nothing:
    /// a failure leaves the namespace unloaded.
    fn load_namespace(&self, namespace: &str) -> Result<Vec<RecordSchema>>;
}

/// Backend statement/text generator.
pub trait StatementGenerator: Send + Sync {
    /// Produce the parameterized mutation for `schema` and `kind`.
    fn mutation(&self, schema: &RecordSchema, kind: StatementKind) -> Result<MutationStatement>;
}

/// One physical backend connection. Not required to be thread-safe; the
/// writer serializes access.
pub trait Connection: Send {
    /// Prepare a statement, returning a handle reusable on this connection.
    fn prepare(&mut self, statement: &MutationStatement) -> Result<StatementHandle>;

    /// Execute one batch of rows against a prepared statement. Atomic per
    /// batch: either every row landed or the backend rejected the batch.
    fn execute_batch(&mut self, handle: StatementHandle, rows: &[Vec<Value>]) -> Result<()>;

    /// Release a prepared statement.
    fn release(&mut self, handle: StatementHandle);

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;
}

/// Connection pool / provider.
pub trait ConnectionProvider: Send + Sync {
    fn acquire(&self) -> Result<Box<dyn Connection>>;
    fn release(&self, conn: Box<dyn Connection>);
}

/// A backend cursor over one query's results. Rows come back in schema
/// field order.
pub trait RecordCursor: Send {
    fn next_row(&mut self) -> Result<Option<Vec<Value>>>;

    /// Release backend resources held by this cursor. Called once, by the
    /// pipeline, when the cursor is exhausted or the pipeline is closed.
    fn close(&mut self);
}

/// Opens backend cursors for queries.
pub trait CursorFactory: Send + Sync {
    fn open_cursor(
        &self,
        schema: &Arc<RecordSchema>,
        query: &Query,
    ) -> Result<Box<dyn RecordCursor>>;

    /// Whether the backend can produce a sorted cursor while also applying
    /// a spatial filter. When false, the pipeline drops the requested
    /// ordering (logged) rather than returning mis-ordered results.
    fn supports_sorted_spatial(&self) -> bool {
        false
    }
}

/// Optional per-field value translation (id <-> display value), consulted
/// when materializing query results.
pub trait CodeTableLookup: Send + Sync {
    /// Translate a stored value for `field` into its display form. `None`
    /// means no translation applies.
    fn translate(&self, schema: &RecordSchema, field: &str, value: &Value) -> Option<Value>;
}

/// Extension hooks run around a namespace load, in registration order.
/// Each hook is fault-isolated: its error is logged and does not abort the
/// other hooks or the load.
pub trait NamespaceHook: Send + Sync {
    /// Runs before the metadata loader.
    fn pre_process(&self, namespace: &str) -> Result<()> {
        let _ = namespace;
        Ok(())
    }

    /// Runs after the metadata loader, with the loaded schemas available
    /// for inspection or adjustment.
    fn post_process(&self, namespace: &str, schemas: &mut Vec<RecordSchema>) -> Result<()> {
        let _ = (namespace, schemas);
        Ok(())
    }
}

/// Aggregate view of a backend adapter, handed to the record store.
pub trait StoreBackend: Send + Sync {
    fn metadata(&self) -> &dyn MetadataLoader;
    fn statements(&self) -> &dyn StatementGenerator;
    fn connections(&self) -> &dyn ConnectionProvider;
    fn cursors(&self) -> &dyn CursorFactory;

    /// Optional code-table lookup; `None` disables translation.
    fn code_tables(&self) -> Option<&dyn CodeTableLookup> {
        None
    }
}
