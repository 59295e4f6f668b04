//! The record store seam.
//!
//! The relational engine is reached only through [`RecordStore`]: fetch rows,
//! write rows, apply a per-table batch atomically and manage foreign keys.
//! [`MemoryStore`] is the in-process implementation used by the service, the
//! migration console and the tests.

pub mod memory;
pub mod schema;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::Record;

pub use memory::MemoryStore;
pub use schema::{plaintext_foreign_keys, ForeignKey, Table};

/// Primary key of a row. Unique across the whole store.
pub type RowId = u64;

/// A stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub record: Record,
}

impl Row {
    /// The string value of `column`, if present and a string.
    pub fn str_field(&self, column: &str) -> Option<&str> {
        self.record.get(column).and_then(Value::as_str)
    }
}

/// Errors produced by a [`RecordStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// No row with this id exists in the table.
    #[error("{table} row {id} not found")]
    NotFound { table: Table, id: RowId },

    /// A write would leave a referencing value without its referenced row.
    #[error("foreign key {constraint} on {table} violated by row {id}")]
    ForeignKeyViolation {
        table: Table,
        constraint: String,
        id: RowId,
    },

    /// The store could not be read from or written to disk.
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted store could not be (de)serialised.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend is not reachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Storage backend for entity records.
///
/// Writes are atomic per call; [`RecordStore::apply_batch`] is the per-table
/// transaction the migration jobs rely on.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every row of `table`, in id order.
    async fn rows(&self, table: Table) -> Result<Vec<Row>, StoreError>;

    /// Rows of `table` whose plaintext `column` equals `value`.
    async fn rows_where(
        &self,
        table: Table,
        column: &str,
        value: &Value,
    ) -> Result<Vec<Row>, StoreError>;

    /// A single row by id.
    async fn get(&self, table: Table, id: RowId) -> Result<Option<Row>, StoreError>;

    /// Insert a new row and return it with its assigned id.
    async fn insert(&self, table: Table, record: Record) -> Result<Row, StoreError>;

    /// Merge `changes` into an existing row and return the result.
    async fn update(&self, table: Table, id: RowId, changes: Record) -> Result<Row, StoreError>;

    /// Delete a row.
    async fn delete(&self, table: Table, id: RowId) -> Result<(), StoreError>;

    /// Merge every `(id, changes)` pair into `table` as one unit. Either all
    /// updates are applied or none are. Returns the number of rows updated.
    async fn apply_batch(
        &self,
        table: Table,
        updates: Vec<(RowId, Record)>,
    ) -> Result<usize, StoreError>;

    /// Foreign keys declared on `table`.
    async fn foreign_keys(&self, table: Table) -> Result<Vec<ForeignKey>, StoreError>;

    /// Drop a foreign key and its dependent index. Returns `false` if it did
    /// not exist.
    async fn drop_foreign_key(&self, table: Table, name: &str) -> Result<bool, StoreError>;

    /// Declare a foreign key after checking existing rows satisfy it. Returns
    /// `false` if a constraint with that name already exists.
    async fn add_foreign_key(&self, fk: ForeignKey) -> Result<bool, StoreError>;

    /// Cheap readiness probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn str_field_ignores_non_strings() {
        let row = Row {
            id: 1,
            record: json!({ "email": "a@b.com", "mark": 3, "gone": null })
                .as_object()
                .cloned()
                .unwrap(),
        };
        assert_eq!(row.str_field("email"), Some("a@b.com"));
        assert_eq!(row.str_field("mark"), None);
        assert_eq!(row.str_field("gone"), None);
        assert_eq!(row.str_field("missing"), None);
    }
}
