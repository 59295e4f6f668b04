//! In-process [`RecordStore`] with optional JSON file persistence.
//!
//! Readers load an immutable snapshot through [`ArcSwap`] and never block.
//! Writers are serialised by a mutex: each write clones the snapshot, applies
//! its changes, checks every foreign key, persists the result and only then
//! publishes it. A failed write therefore leaves nothing behind.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ForeignKey, RecordStore, Row, RowId, StoreError, Table};
use crate::persist::atomic_write;
use crate::Record;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    next_id: RowId,
    tables: BTreeMap<Table, BTreeMap<RowId, Record>>,
    foreign_keys: Vec<ForeignKey>,
}

impl Snapshot {
    fn table(&self, table: Table) -> impl Iterator<Item = Row> + '_ {
        self.tables.get(&table).into_iter().flat_map(|rows| {
            rows.iter().map(|(id, record)| Row {
                id: *id,
                record: record.clone(),
            })
        })
    }

    fn merge(&mut self, table: Table, id: RowId, changes: Record) -> Result<Row, StoreError> {
        let record = self
            .tables
            .get_mut(&table)
            .and_then(|rows| rows.get_mut(&id))
            .ok_or(StoreError::NotFound { table, id })?;
        record.extend(changes);
        Ok(Row {
            id,
            record: record.clone(),
        })
    }

    fn check_foreign_key(&self, fk: &ForeignKey) -> Result<(), StoreError> {
        let referenced: HashSet<String> = self
            .tables
            .get(&fk.references)
            .into_iter()
            .flat_map(|rows| rows.values())
            .filter_map(|r| key_of(r.get(&fk.referenced_column)))
            .collect();

        let Some(rows) = self.tables.get(&fk.table) else {
            return Ok(());
        };
        for (id, record) in rows {
            if let Some(value) = key_of(record.get(&fk.column)) {
                if !referenced.contains(&value) {
                    return Err(StoreError::ForeignKeyViolation {
                        table: fk.table,
                        constraint: fk.name.clone(),
                        id: *id,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_foreign_keys(&self) -> Result<(), StoreError> {
        self.foreign_keys
            .iter()
            .try_for_each(|fk| self.check_foreign_key(fk))
    }
}

/// Comparable form of a column value; `None` for null or missing.
fn key_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Copy-on-write in-memory store.
///
/// Cloning the handle shares the underlying data.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    state: Arc<ArcSwap<Snapshot>>,
    writer: Arc<Mutex<()>>,
    path: Option<Arc<PathBuf>>,
}

impl MemoryStore {
    /// An empty, non-persistent store with no foreign keys.
    pub fn new() -> Self {
        Self::from_snapshot(Snapshot::default(), None)
    }

    /// An empty, non-persistent store declaring the plaintext-email foreign keys
    /// of the pre-encryption schema.
    pub fn with_plaintext_foreign_keys() -> Self {
        let snapshot = Snapshot {
            foreign_keys: super::plaintext_foreign_keys(),
            ..Snapshot::default()
        };
        Self::from_snapshot(snapshot, None)
    }

    /// Open a store persisted at `path`, creating an empty one if the file does
    /// not exist yet. Every committed write is flushed back to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] or [`StoreError::Serialization`] if an
    /// existing file cannot be read or parsed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };
        info!(
            path = %path.display(),
            tables = snapshot.tables.len(),
            foreign_keys = snapshot.foreign_keys.len(),
            "record store opened"
        );
        Ok(Self::from_snapshot(snapshot, Some(path)))
    }

    fn from_snapshot(snapshot: Snapshot, path: Option<PathBuf>) -> Self {
        Self {
            state: Arc::new(ArcSwap::from_pointee(snapshot)),
            writer: Arc::new(Mutex::new(())),
            path: path.map(Arc::new),
        }
    }

    /// Run `change` against a private copy of the current snapshot, validate,
    /// persist and publish it.
    async fn commit<T>(
        &self,
        change: impl FnOnce(&mut Snapshot) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.writer.lock().await;
        let mut next = Snapshot::clone(&self.state.load());
        let out = change(&mut next)?;
        next.check_foreign_keys()?;
        if let Some(path) = &self.path {
            let bytes = serde_json::to_vec_pretty(&next)?;
            atomic_write(path, &bytes).await?;
        }
        self.state.store(Arc::new(next));
        Ok(out)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn rows(&self, table: Table) -> Result<Vec<Row>, StoreError> {
        Ok(self.state.load().table(table).collect())
    }

    async fn rows_where(
        &self,
        table: Table,
        column: &str,
        value: &Value,
    ) -> Result<Vec<Row>, StoreError> {
        Ok(self
            .state
            .load()
            .table(table)
            .filter(|row| row.record.get(column) == Some(value))
            .collect())
    }

    async fn get(&self, table: Table, id: RowId) -> Result<Option<Row>, StoreError> {
        let snapshot = self.state.load();
        Ok(snapshot
            .tables
            .get(&table)
            .and_then(|rows| rows.get(&id))
            .map(|record| Row {
                id,
                record: record.clone(),
            }))
    }

    async fn insert(&self, table: Table, record: Record) -> Result<Row, StoreError> {
        self.commit(|s| {
            s.next_id += 1;
            let id = s.next_id;
            s.tables.entry(table).or_default().insert(id, record.clone());
            Ok(Row { id, record })
        })
        .await
    }

    async fn update(&self, table: Table, id: RowId, changes: Record) -> Result<Row, StoreError> {
        self.commit(|s| s.merge(table, id, changes)).await
    }

    async fn delete(&self, table: Table, id: RowId) -> Result<(), StoreError> {
        self.commit(|s| {
            s.tables
                .get_mut(&table)
                .and_then(|rows| rows.remove(&id))
                .map(|_| ())
                .ok_or(StoreError::NotFound { table, id })
        })
        .await
    }

    async fn apply_batch(
        &self,
        table: Table,
        updates: Vec<(RowId, Record)>,
    ) -> Result<usize, StoreError> {
        let count = self
            .commit(|s| {
                let count = updates.len();
                for (id, changes) in updates {
                    s.merge(table, id, changes)?;
                }
                Ok(count)
            })
            .await?;
        debug!(%table, rows = count, "batch committed");
        Ok(count)
    }

    async fn foreign_keys(&self, table: Table) -> Result<Vec<ForeignKey>, StoreError> {
        Ok(self
            .state
            .load()
            .foreign_keys
            .iter()
            .filter(|fk| fk.table == table)
            .cloned()
            .collect())
    }

    async fn drop_foreign_key(&self, table: Table, name: &str) -> Result<bool, StoreError> {
        let dropped = self
            .commit(|s| {
                let before = s.foreign_keys.len();
                s.foreign_keys
                    .retain(|fk| !(fk.table == table && fk.name == name));
                Ok(s.foreign_keys.len() != before)
            })
            .await?;
        if dropped {
            info!(%table, constraint = name, "foreign key dropped");
        }
        Ok(dropped)
    }

    async fn add_foreign_key(&self, fk: ForeignKey) -> Result<bool, StoreError> {
        let (table, name) = (fk.table, fk.name.clone());
        let added = self
            .commit(|s| {
                if s.foreign_keys
                    .iter()
                    .any(|existing| existing.table == fk.table && existing.name == fk.name)
                {
                    return Ok(false);
                }
                s.foreign_keys.push(fk);
                Ok(true)
            })
            .await?;
        if added {
            info!(%table, constraint = %name, "foreign key created");
        }
        Ok(added)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
