//! Durable snapshots of every encrypted column, taken before any row changes.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::MigrationError;
use crate::persist::{atomic_write, now_epoch};
use crate::store::{RecordStore, Row, RowId, Table};
use crate::Record;

const FILE_PREFIX: &str = "encryption_backup_";

/// Contents of one backup file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    /// Unix epoch seconds.
    pub created_at: u64,
    pub description: String,
    /// For every encrypted table, each row's id and encrypted columns.
    pub tables: BTreeMap<Table, Vec<Row>>,
    pub record_counts: BTreeMap<Table, usize>,
}

/// Snapshot every encrypted column of every encrypted table into a new file
/// under `dir` and return its path.
///
/// The file is complete on disk before this returns.
///
/// # Errors
///
/// Any store, serialisation or filesystem error. Nothing is mutated in the
/// store either way.
pub async fn create_backup(
    store: &dyn RecordStore,
    dir: &Path,
    description: &str,
) -> Result<(PathBuf, Backup), MigrationError> {
    let mut tables = BTreeMap::new();
    let mut record_counts = BTreeMap::new();

    for table in Table::ENCRYPTED {
        let rows: Vec<Row> = store
            .rows(table)
            .await?
            .into_iter()
            .map(|row| Row {
                id: row.id,
                record: project(&row.record, table.encrypted_columns()),
            })
            .collect();
        debug!(%table, rows = rows.len(), "table snapshotted");
        record_counts.insert(table, rows.len());
        tables.insert(table, rows);
    }

    let backup = Backup {
        created_at: now_epoch(),
        description: description.to_owned(),
        tables,
        record_counts,
    };

    let id = Uuid::new_v4().simple().to_string();
    let path = dir.join(format!(
        "{FILE_PREFIX}{}_{}.json",
        backup.created_at,
        &id[..8]
    ));
    atomic_write(&path, &serde_json::to_vec_pretty(&backup)?).await?;

    info!(
        path = %path.display(),
        rows = backup.record_counts.values().sum::<usize>(),
        "backup written"
    );
    Ok((path, backup))
}

/// Backup files in `dir`, oldest first. A missing directory has none.
///
/// # Errors
///
/// Filesystem errors other than the directory not existing.
pub async fn list_backups(dir: &Path) -> Result<Vec<PathBuf>, MigrationError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(FILE_PREFIX) && name.ends_with(".json") {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

/// Read a backup file.
///
/// # Errors
///
/// [`MigrationError::BackupNotFound`] if `path` does not exist, otherwise any
/// read or parse error.
pub async fn load_backup(path: &Path) -> Result<Backup, MigrationError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(MigrationError::BackupNotFound(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&bytes)?)
}

/// Write the snapshotted columns of `rows` back into `table` as one batch.
///
/// Rows that no longer exist are skipped. Returns `(restored, skipped)`.
///
/// # Errors
///
/// Any store error; the batch is then not applied.
pub async fn restore_table(
    store: &dyn RecordStore,
    table: Table,
    rows: &[Row],
) -> Result<(usize, usize), MigrationError> {
    let existing: HashSet<RowId> = store.rows(table).await?.iter().map(|r| r.id).collect();
    let updates: Vec<(RowId, Record)> = rows
        .iter()
        .filter(|row| existing.contains(&row.id))
        .map(|row| (row.id, row.record.clone()))
        .collect();
    let skipped = rows.len() - updates.len();
    let restored = store.apply_batch(table, updates).await?;
    info!(%table, restored, skipped, "table restored from backup");
    Ok((restored, skipped))
}

fn project(record: &Record, columns: &[&str]) -> Record {
    columns
        .iter()
        .filter_map(|c| record.get(*c).map(|v| ((*c).to_owned(), v.clone())))
        .collect()
}
