//! Batched record writer
//!
//! Maps record lifecycle state to backend mutation statements, buffering
//! rows per (record type, operation kind) and flushing by threshold or on
//! request:
//!
//! | record state | action |
//! |---|---|
//! | New | insert (generated-key form when ids are absent and generated) |
//! | Modified | update keyed by id field(s) |
//! | Persisted | no-op |
//! | Deleted | delete by ids; never-flushed inserts are dropped instead |
//! | Initializing | fatal: unknown record state |
//!
//! One parameterized statement plus one prepared handle is cached per
//! (type, operation); subsequent writes of the same type reuse both. The
//! `write` entry point is internally synchronized: a single lock per writer
//! instance serializes concurrent callers sharing one transaction-bound
//! writer, so parameter binding never interleaves.

pub mod binding;

use crate::backend::{Connection, MutationStatement, StatementHandle, StatementKind, StoreBackend};
use crate::config::{FailureMode, WriterConfig};
use crate::error::{Result, StoreError};
use crate::record::{Record, RecordState};
use crate::types::Value;
use ahash::AHashMap;
use log::{debug, error};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Connection a writer executes on: its own, committed and released on
/// close, or one borrowed from an ambient transaction that outlives it.
pub(crate) enum WriterConnection {
    Owned {
        conn: Option<Box<dyn Connection>>,
        backend: Arc<dyn StoreBackend>,
    },
    /// Weak so a writer handle leaked past its transaction cannot keep the
    /// connection alive; the transaction holds the strong reference.
    Borrowed(Weak<Mutex<Box<dyn Connection>>>),
}

impl WriterConnection {
    fn with<R>(&mut self, f: impl FnOnce(&mut dyn Connection) -> Result<R>) -> Result<R> {
        match self {
            WriterConnection::Owned { conn: Some(conn), .. } => f(conn.as_mut()),
            WriterConnection::Owned { conn: None, .. } => {
                Err(StoreError::Connection("writer connection already released".into()))
            }
            WriterConnection::Borrowed(weak) => {
                let conn = weak
                    .upgrade()
                    .ok_or_else(|| StoreError::Connection("ambient transaction completed".into()))?;
                let mut guard = conn.lock();
                f(guard.as_mut())
            }
        }
    }
}

/// One cached statement plus its pending batch.
struct PreparedBatch {
    statement: MutationStatement,
    handle: StatementHandle,
    rows: Vec<Vec<Value>>,
    /// Serials of buffered records, parallel to `rows`. Lets a delete of a
    /// never-flushed insert drop the pending row instead of issuing a
    /// delete statement.
    serials: Vec<u64>,
}

struct WriterState {
    conn: WriterConnection,
    batches: AHashMap<(String, StatementKind), PreparedBatch>,
    /// Batch keys in first-buffer order; flushes execute in this order so
    /// same-type operations reach the backend in write-call order.
    batch_order: Vec<(String, StatementKind)>,
    /// Record serial -> insert batch key, for inserts buffered but not yet
    /// flushed. Only insert batches populate and clear this.
    pending_inserts: AHashMap<u64, (String, StatementKind)>,
    /// Type of the immediately preceding buffered write.
    last_type: Option<String>,
    stats: WriteStats,
    closed: bool,
}

/// Per-type Insert/Update/Delete counters, incremented per successfully
/// executed batch. External bookkeeping, not part of the write contract.
#[derive(Debug, Clone, Default)]
pub struct WriteStats {
    counters: AHashMap<(String, &'static str), u64>,
}

impl WriteStats {
    pub fn count(&self, type_name: &str, operation: &str) -> u64 {
        self.counters
            .iter()
            .filter(|((t, op), _)| t.as_str() == type_name && *op == operation)
            .map(|(_, n)| *n)
            .sum()
    }

    fn add(&mut self, type_name: &str, operation: &'static str, n: u64) {
        *self
            .counters
            .entry((type_name.to_string(), operation))
            .or_insert(0) += n;
    }
}

fn counter_name(kind: StatementKind) -> &'static str {
    match kind {
        StatementKind::Insert | StatementKind::InsertGeneratedKey => "Insert",
        StatementKind::Update => "Update",
        StatementKind::Delete => "Delete",
    }
}

fn is_insert(kind: StatementKind) -> bool {
    matches!(
        kind,
        StatementKind::Insert | StatementKind::InsertGeneratedKey
    )
}

/// Transaction-aware batched writer. See the module docs for the dispatch
/// table.
pub struct BatchedWriter {
    backend: Arc<dyn StoreBackend>,
    config: WriterConfig,
    failure_mode: FailureMode,
    state: Mutex<WriterState>,
}

impl BatchedWriter {
    /// Writer with its own connection; `close()` commits and releases it.
    pub(crate) fn owned(
        backend: Arc<dyn StoreBackend>,
        config: WriterConfig,
        failure_mode: FailureMode,
    ) -> Result<Self> {
        let conn = backend.connections().acquire()?;
        Ok(Self::build(
            backend.clone(),
            config,
            failure_mode,
            WriterConnection::Owned { conn: Some(conn), backend },
        ))
    }

    /// Writer borrowing an ambient transaction's connection; `close()`
    /// releases statements but never commits.
    pub(crate) fn borrowed(
        backend: Arc<dyn StoreBackend>,
        config: WriterConfig,
        failure_mode: FailureMode,
        conn: Weak<Mutex<Box<dyn Connection>>>,
    ) -> Self {
        Self::build(backend, config, failure_mode, WriterConnection::Borrowed(conn))
    }

    fn build(
        backend: Arc<dyn StoreBackend>,
        config: WriterConfig,
        failure_mode: FailureMode,
        conn: WriterConnection,
    ) -> Self {
        Self {
            backend,
            config,
            failure_mode,
            state: Mutex::new(WriterState {
                conn,
                batches: AHashMap::new(),
                batch_order: Vec::new(),
                pending_inserts: AHashMap::new(),
                last_type: None,
                stats: WriteStats::default(),
                closed: false,
            }),
        }
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    /// Dispatch one record by its lifecycle state.
    pub fn write(&self, record: &mut Record) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StoreError::Connection("writer is closed".into()));
        }

        match record.state() {
            // Already committed, nothing to do.
            RecordState::Persisted => Ok(()),

            RecordState::New => {
                record.validate()?;
                let schema = record.schema().clone();
                let kind = if record.ids_absent() && schema.ids_generated() {
                    StatementKind::InsertGeneratedKey
                } else {
                    StatementKind::Insert
                };
                self.buffer(&mut state, record, kind)?;
                record.mark_persisted();
                Ok(())
            }

            RecordState::Modified => {
                // Key must be present before anything is buffered.
                record.id_values()?;
                self.buffer(&mut state, record, StatementKind::Update)?;
                record.mark_persisted();
                Ok(())
            }

            RecordState::Deleted => {
                if state.pending_inserts.remove(&record.serial()).is_some() {
                    // Never flushed: drop every buffered row for this
                    // record (the pending insert and any update that
                    // followed it) instead of inserting then deleting.
                    self.drop_buffered_rows(&mut state, record.serial());
                    return Ok(());
                }
                record.id_values()?;
                self.buffer(&mut state, record, StatementKind::Delete)
            }

            RecordState::Initializing => Err(StoreError::State(format!(
                "{:?} for type '{}'",
                record.state(),
                record.type_name()
            ))),
        }
    }

    /// Execute every type's pending batch regardless of size.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_all(&mut state)
    }

    /// Flush, release every prepared statement and, if this writer owns its
    /// connection, commit and release it. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.shutdown(true)
    }

    /// Discard pending batches and release resources without executing or
    /// committing anything. Used on transaction rollback.
    pub(crate) fn abandon(&self) {
        // Discarding cannot fail meaningfully; resource release errors are
        // logged inside shutdown.
        let _ = self.shutdown(false);
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> WriteStats {
        self.state.lock().stats.clone()
    }

    /// Buffered-but-unflushed row count for one type, across operation
    /// kinds.
    pub fn pending_count(&self, type_name: &str) -> usize {
        let state = self.state.lock();
        state
            .batches
            .iter()
            .filter(|((t, _), _)| t.as_str() == type_name)
            .map(|(_, batch)| batch.rows.len())
            .sum()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn shutdown(&self, flush: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }

        let flush_result = if flush {
            self.flush_all(&mut state)
        } else {
            for batch in state.batches.values_mut() {
                batch.rows.clear();
                batch.serials.clear();
            }
            Ok(())
        };

        // Release prepared statements even when the flush failed.
        let batches = std::mem::take(&mut state.batches);
        state.batch_order.clear();
        state.pending_inserts.clear();
        for (_, batch) in batches {
            if let Err(err) = state.conn.with(|conn| {
                conn.release(batch.handle);
                Ok(())
            }) {
                debug!("statement release skipped: {}", err);
            }
        }

        if let WriterConnection::Owned { conn, backend } = &mut state.conn {
            if let Some(mut owned) = conn.take() {
                if flush_result.is_ok() && flush {
                    owned.commit()?;
                }
                backend.connections().release(owned);
            }
        }

        state.closed = true;
        flush_result
    }

    /// Buffer one row for (type, kind), flushing by threshold and, when
    /// configured, on type change.
    fn buffer(
        &self,
        state: &mut WriterState,
        record: &Record,
        kind: StatementKind,
    ) -> Result<()> {
        let schema = record.schema().clone();
        let type_name = schema.type_name().to_string();

        if self.config.flush_between_types
            && state.last_type.as_deref().is_some_and(|last| last != type_name.as_str())
        {
            self.flush_all(state)?;
        }

        let key = (type_name.clone(), kind);
        if !state.batches.contains_key(&key) {
            let statement = self.backend.statements().mutation(&schema, kind)?;
            let handle = state.conn.with(|conn| conn.prepare(&statement))?;
            state.batches.insert(
                key.clone(),
                PreparedBatch {
                    statement,
                    handle,
                    rows: Vec::new(),
                    serials: Vec::new(),
                },
            );
            state.batch_order.push(key.clone());
        }

        let serial = record.serial();
        let batch = state.batches.get_mut(&key).expect("batch was just inserted");
        let mut row = Vec::with_capacity(batch.statement.bind_fields.len());
        for field in &batch.statement.bind_fields {
            row.push(record.get(field)?.clone());
        }
        batch.rows.push(row);
        batch.serials.push(serial);
        // Tracked before the threshold check: an auto-flush below clears
        // the marker again, so it is only ever set for unflushed inserts.
        if is_insert(kind) {
            state.pending_inserts.insert(serial, key.clone());
        }
        state.last_type = Some(type_name);

        if batch.rows.len() >= self.config.batch_size {
            self.execute(state, &key)?;
        }
        Ok(())
    }

    /// Remove every buffered row for `serial`, whatever its operation
    /// kind. A deleted never-flushed record must produce zero statements.
    fn drop_buffered_rows(&self, state: &mut WriterState, serial: u64) {
        for batch in state.batches.values_mut() {
            while let Some(pos) = batch.serials.iter().position(|&s| s == serial) {
                batch.rows.remove(pos);
                batch.serials.remove(pos);
            }
        }
    }

    fn flush_all(&self, state: &mut WriterState) -> Result<()> {
        // First-buffer order, never map iteration order.
        let keys: Vec<_> = state
            .batch_order
            .iter()
            .filter(|key| {
                state
                    .batches
                    .get(*key)
                    .is_some_and(|batch| !batch.rows.is_empty())
            })
            .cloned()
            .collect();
        for key in keys {
            self.execute(state, &key)?;
        }
        Ok(())
    }

    /// Execute one pending batch. The batch is cleared whether execution
    /// succeeds or fails; the backend's batch execute is atomic per batch.
    fn execute(&self, state: &mut WriterState, key: &(String, StatementKind)) -> Result<()> {
        let Some(batch) = state.batches.get_mut(key) else {
            return Ok(());
        };
        if batch.rows.is_empty() {
            return Ok(());
        }

        let rows = std::mem::take(&mut batch.rows);
        let serials = std::mem::take(&mut batch.serials);
        let handle = batch.handle;
        let text = batch.statement.text.clone();

        let outcome = state.conn.with(|conn| conn.execute_batch(handle, &rows));
        if is_insert(key.1) {
            // These inserts left the buffer (executed or dropped with the
            // failed batch); a later delete must issue a real statement.
            for serial in serials {
                state.pending_inserts.remove(&serial);
            }
        }

        match outcome {
            Ok(()) => {
                state
                    .stats
                    .add(&key.0, counter_name(key.1), rows.len() as u64);
                Ok(())
            }
            Err(err) => {
                let err = attach_statement(err, &text);
                if let StoreError::Backend { row_errors, .. } = &err {
                    for cause in row_errors {
                        error!("batch row failed for `{}`: {}", text, cause);
                    }
                }
                match self.failure_mode {
                    FailureMode::Strict => Err(err),
                    FailureMode::BestEffort => {
                        // Swallowed after logging; the failed batch's
                        // statistics are not incremented.
                        error!("best-effort batch dropped: {}", err);
                        Ok(())
                    }
                }
            }
        }
    }
}

/// Ensure a backend failure carries the failing statement text.
fn attach_statement(err: StoreError, text: &str) -> StoreError {
    match err {
        StoreError::Backend { message, row_errors, .. } => StoreError::Backend {
            statement: text.to_string(),
            message,
            row_errors,
        },
        other => StoreError::Backend {
            statement: text.to_string(),
            message: other.to_string(),
            row_errors: Vec::new(),
        },
    }
}
