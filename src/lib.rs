//! stratadb — a backend-agnostic record store
//!
//! A uniform façade over heterogeneous tabular/spatial backends that
//! presents records, typed schemas, queries and writers through one
//! contract. Backend adapters implement the traits in [`backend`]; this
//! crate owns everything above them.
//!
//! ## Core pieces
//! - Schema catalog: lazily-loaded, refreshable per-namespace schema cache
//! - Query pipeline: lazy sequential cursor composition over many queries
//! - Batched writer: per-type prepared statements, threshold flushing
//! - Transaction binding: one writer per (transaction, strictness flag),
//!   flushed and closed exactly once at transaction completion

pub mod backend;
pub mod catalog;
pub mod config;
pub mod query;
pub mod record;
pub mod schema;
pub mod store;
pub mod types;
pub mod writer;

mod error;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{FailureMode, StoreConfig, WriterConfig};
pub use error::{Result, StoreError};

pub use catalog::SchemaNamespace;
pub use query::pipeline::QueryPipeline;
pub use query::{Filter, Query, SortOrder, SpatialFilter};
pub use record::{Record, RecordState};
pub use schema::{FieldDef, RecordSchema, SchemaPath};
pub use store::{RecordStore, StoreBuilder};
pub use types::{BoundingBox, FieldType, Geometry, Point, Value};
pub use writer::binding::{Transaction, TransactionCoordinator, WriterHandle};
pub use writer::{BatchedWriter, WriteStats};
