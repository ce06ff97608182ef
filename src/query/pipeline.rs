//! Lazy query iterator pipeline
//!
//! Composes the per-query cursors for one or more queries into a single
//! logical cursor over records. Cursors are created lazily, one at a time:
//! query *i* is fully exhausted and closed before the backend is asked to
//! open query *i+1*, so backend resources for later queries are never held
//! while an earlier cursor is open.
//!
//! Records come off the wire in state `Initializing`, are populated
//! field-by-field (with optional code-table translation), then published as
//! `Persisted` before the consumer ever sees them.

use crate::backend::{RecordCursor, StoreBackend};
use crate::error::{Result, StoreError};
use crate::query::Query;
use crate::record::Record;
use crate::schema::RecordSchema;
use crate::types::Value;
use log::warn;
use std::collections::VecDeque;
use std::sync::Arc;

/// One logical cursor over the results of multiple queries, consumed in
/// submission order.
pub struct QueryPipeline {
    backend: Arc<dyn StoreBackend>,
    /// Queries not yet opened, with their resolved schemas.
    pending: VecDeque<(Arc<RecordSchema>, Query)>,
    /// The currently-open cursor, if any.
    current: Option<OpenCursor>,
    closed: bool,
}

struct OpenCursor {
    schema: Arc<RecordSchema>,
    cursor: Box<dyn RecordCursor>,
}

impl QueryPipeline {
    /// Build a pipeline over resolved (schema, query) pairs. No backend
    /// cursor is opened until the first `next()`.
    pub(crate) fn new(
        backend: Arc<dyn StoreBackend>,
        queries: Vec<(Arc<RecordSchema>, Query)>,
    ) -> Self {
        Self {
            backend,
            pending: queries.into(),
            current: None,
            closed: false,
        }
    }

    /// Close the pipeline, releasing the currently-open cursor's backend
    /// resources. Subsequent cursors are never opened. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut open) = self.current.take() {
            open.cursor.close();
        }
        self.pending.clear();
        self.closed = true;
    }

    /// Open the next pending query's cursor, applying the sorted-spatial
    /// fallback when the backend cannot express both at once.
    fn open_next(&mut self) -> Result<bool> {
        let Some((schema, mut query)) = self.pending.pop_front() else {
            return Ok(false);
        };

        if !query.order_by.is_empty()
            && query.spatial.is_some()
            && !self.backend.cursors().supports_sorted_spatial()
        {
            // Fall back to an unsorted filter+scan plan. Loudly: silently
            // returning mis-ordered results is worse than no ordering.
            warn!(
                "backend cannot sort while spatially filtering; ignoring requested ordering for '{}'",
                query.type_path
            );
            query.order_by.clear();
        }

        let cursor = self.backend.cursors().open_cursor(&schema, &query)?;
        self.current = Some(OpenCursor { schema, cursor });
        Ok(true)
    }

    /// Materialize one raw row into a record.
    fn materialize(&self, schema: &Arc<RecordSchema>, row: Vec<Value>) -> Result<Record> {
        if row.len() != schema.field_count() {
            return Err(StoreError::Query(format!(
                "backend returned {} values for type '{}' with {} fields",
                row.len(),
                schema.type_name(),
                schema.field_count()
            )));
        }
        let mut record = Record::initializing(schema.clone());
        let code_tables = self.backend.code_tables();
        for (field, value) in schema.fields.iter().zip(row.into_iter()) {
            let value = match code_tables.and_then(|ct| ct.translate(schema, &field.name, &value)) {
                Some(translated) => translated,
                None => value,
            };
            record.set(&field.name, value)?;
        }
        record.complete()?;
        Ok(record)
    }

    fn advance(&mut self) -> Result<Option<Record>> {
        loop {
            if self.closed {
                return Ok(None);
            }
            if self.current.is_none() && !self.open_next()? {
                self.closed = true;
                return Ok(None);
            }
            let open = self.current.as_mut().expect("cursor was just opened");
            match open.cursor.next_row()? {
                Some(row) => {
                    let schema = open.schema.clone();
                    return self.materialize(&schema, row).map(Some);
                }
                None => {
                    // Exhausted: release this cursor before touching the
                    // next query.
                    if let Some(mut done) = self.current.take() {
                        done.cursor.close();
                    }
                }
            }
        }
    }
}

impl Iterator for QueryPipeline {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(err) => {
                // A backend failure ends the pipeline; resources for the
                // failing cursor are released here.
                self.close();
                Some(Err(err))
            }
        }
    }
}

impl Drop for QueryPipeline {
    fn drop(&mut self) {
        self.close();
    }
}
