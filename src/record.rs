//! Records and their lifecycle state machine
//!
//! A record is an ordered bag of named field values for one schema plus a
//! lifecycle state:
//!
//! ```text
//! Initializing -> { New, Persisted } -> Modified -> Persisted
//! any non-terminal state -> Deleted
//! ```
//!
//! `Initializing` exists only while the query pipeline populates a record
//! field-by-field; `complete()` publishes it as `Persisted` so consumers
//! never observe a half-read record. State transitions are explicit methods
//! so illegal moves are rejected at the call site rather than discovered at
//! write time.

use crate::error::{Result, StoreError};
use crate::schema::RecordSchema;
use crate::types::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordState {
    /// Being populated field-by-field by a reader; not writable.
    Initializing,
    /// Created by the caller, never stored.
    New,
    /// Matches the backend's stored row.
    Persisted,
    /// Stored, then changed by the caller.
    Modified,
    /// Scheduled for removal. Terminal.
    Deleted,
}

impl RecordState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecordState::Deleted)
    }
}

/// Process-wide record serial allocator. Serials identify records inside a
/// writer's pending batches (a deleted never-flushed insert is dropped from
/// the pending batch by serial).
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

fn allocate_serial() -> u64 {
    NEXT_SERIAL.fetch_add(1, Ordering::Relaxed)
}

/// One instance of data conforming to a `RecordSchema`.
///
/// The field set is exactly the schema's field set; unknown field names are
/// rejected. Missing fields read as `Value::Null`.
#[derive(Debug, Clone)]
pub struct Record {
    schema: Arc<RecordSchema>,
    values: Vec<Value>,
    state: RecordState,
    serial: u64,
}

impl Record {
    /// Create a caller-owned record in state `New`, all fields null.
    pub fn new(schema: Arc<RecordSchema>) -> Self {
        let values = vec![Value::Null; schema.field_count()];
        Self {
            schema,
            values,
            state: RecordState::New,
            serial: allocate_serial(),
        }
    }

    /// Create a record in state `Initializing` for population by a reader.
    pub fn initializing(schema: Arc<RecordSchema>) -> Self {
        let mut record = Self::new(schema);
        record.state = RecordState::Initializing;
        record
    }

    pub fn schema(&self) -> &Arc<RecordSchema> {
        &self.schema
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    /// Writer-internal identity for pending-batch bookkeeping.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Record type name (the schema's local name).
    pub fn type_name(&self) -> &str {
        self.schema.type_name()
    }

    /// Get a field value by name. Unknown names are a schema error.
    pub fn get(&self, name: &str) -> Result<&Value> {
        let pos = self.field_position(name)?;
        Ok(&self.values[pos])
    }

    /// Set a field value by name.
    ///
    /// - unknown field names are rejected
    /// - type-incompatible values are rejected
    /// - setting a field on a `Persisted` record moves it to `Modified`
    /// - `Deleted` records are not writable
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let pos = self.field_position(name)?;
        let field = &self.schema.fields[pos];
        if !field.field_type.accepts(&value) {
            return Err(StoreError::Schema(format!(
                "Value {:?} not acceptable for field '{}' of type {:?}",
                value, name, field.field_type
            )));
        }
        match self.state {
            RecordState::Deleted => {
                return Err(StoreError::State(format!(
                    "cannot set field '{}' on a deleted record",
                    name
                )));
            }
            RecordState::Persisted => self.state = RecordState::Modified,
            RecordState::Initializing | RecordState::New | RecordState::Modified => {}
        }
        self.values[pos] = value;
        Ok(())
    }

    /// All values in schema field order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Values of the schema's id fields, in declaration order. Errors if the
    /// schema has no id fields or any id value is null (update/delete need a
    /// key).
    pub fn id_values(&self) -> Result<Vec<Value>> {
        if self.schema.id_fields.is_empty() {
            return Err(StoreError::Schema(format!(
                "type '{}' has no id fields",
                self.type_name()
            )));
        }
        let mut ids = Vec::with_capacity(self.schema.id_fields.len());
        for name in &self.schema.id_fields {
            let value = self.get(name)?;
            if value.is_null() {
                return Err(StoreError::Schema(format!(
                    "id field '{}' of type '{}' is null",
                    name,
                    self.type_name()
                )));
            }
            ids.push(value.clone());
        }
        Ok(ids)
    }

    /// Whether every id field is currently null. A `New` record with absent
    /// ids on a generated-id schema takes the generated-key insert form.
    pub fn ids_absent(&self) -> bool {
        self.schema
            .id_fields
            .iter()
            .all(|name| self.get(name).map(|v| v.is_null()).unwrap_or(true))
    }

    /// Finish populating an `Initializing` record, publishing it as
    /// `Persisted`.
    pub fn complete(&mut self) -> Result<()> {
        if self.state != RecordState::Initializing {
            return Err(StoreError::State(format!(
                "complete() on record in state {:?}",
                self.state
            )));
        }
        self.state = RecordState::Persisted;
        Ok(())
    }

    /// Mark this record `Deleted`. Allowed from any non-terminal state.
    pub fn mark_deleted(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(StoreError::State(
                "record is already deleted".to_string(),
            ));
        }
        self.state = RecordState::Deleted;
        Ok(())
    }

    /// Mark this record `Persisted` after its mutation was accepted by a
    /// writer.
    pub(crate) fn mark_persisted(&mut self) {
        self.state = RecordState::Persisted;
    }

    /// Validate required fields against the schema (null check only; type
    /// compatibility is enforced on `set`).
    pub fn validate(&self) -> Result<()> {
        for field in &self.schema.fields {
            if field.required && !field.generated {
                let pos = self
                    .schema
                    .field_position(&field.name)
                    .expect("schema field map is consistent");
                if self.values[pos].is_null() {
                    return Err(StoreError::Schema(format!(
                        "required field '{}' of type '{}' is null",
                        field.name,
                        self.type_name()
                    )));
                }
            }
        }
        Ok(())
    }

    fn field_position(&self, name: &str) -> Result<usize> {
        self.schema.field_position(name).ok_or_else(|| {
            StoreError::Schema(format!(
                "unknown field '{}' for type '{}'",
                name,
                self.type_name()
            ))
        })
    }
}
