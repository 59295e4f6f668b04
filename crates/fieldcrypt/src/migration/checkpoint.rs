//! Run log for the multi-table migration.
//!
//! The store only guarantees atomicity per table. The checkpoint records which
//! tables a run has completed so an interrupted `migrate-all` resumes with the
//! first unfinished table.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::MigrationError;
use crate::persist::{atomic_write, now_epoch};
use crate::store::Table;

/// Checkpoint file name inside the backup directory.
pub const FILE_NAME: &str = "checkpoint.json";

/// Where a table is in the migration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    Unmigrated,
    BackedUp,
    Migrating,
    Migrated,
    RolledBack,
}

impl TableState {
    /// Whether moving from `self` to `next` is a legal step.
    pub fn allows(self, next: TableState) -> bool {
        use TableState::*;
        matches!(
            (self, next),
            (_, RolledBack)
                | (Unmigrated | RolledBack | BackedUp, BackedUp)
                | (BackedUp | Migrated, Migrating)
                | (Migrating, Migrated | BackedUp)
        )
    }
}

/// Persistent state of the current migration run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Option<String>,
    /// Latest backup taken before an invocation of this run mutated rows.
    pub backup: Option<PathBuf>,
    pub tables: BTreeMap<Table, TableState>,
    pub updated_at: u64,
}

impl Checkpoint {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(FILE_NAME)
    }

    /// Load the checkpoint from `dir`; a missing file is a fresh checkpoint.
    ///
    /// # Errors
    ///
    /// Read or parse errors of an existing file.
    pub async fn load(dir: &Path) -> Result<Self, MigrationError> {
        match tokio::fs::read(Self::path(dir)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist to `dir`.
    ///
    /// # Errors
    ///
    /// Serialisation or filesystem errors.
    pub async fn save(&mut self, dir: &Path) -> Result<(), MigrationError> {
        self.updated_at = now_epoch();
        atomic_write(&Self::path(dir), &serde_json::to_vec_pretty(self)?).await?;
        Ok(())
    }

    pub fn state(&self, table: Table) -> TableState {
        self.tables
            .get(&table)
            .copied()
            .unwrap_or(TableState::Unmigrated)
    }

    /// Move `table` to `next`.
    ///
    /// # Errors
    ///
    /// [`MigrationError::InvalidTransition`] if the step is not allowed.
    pub fn transition(&mut self, table: Table, next: TableState) -> Result<(), MigrationError> {
        let from = self.state(table);
        if from != next && !from.allows(next) {
            return Err(MigrationError::InvalidTransition {
                table,
                from,
                to: next,
            });
        }
        self.tables.insert(table, next);
        Ok(())
    }

    /// A forward run needs a fresh backup when none was taken yet or when a
    /// rollback happened since.
    pub fn needs_new_run(&self) -> bool {
        self.backup.is_none()
            || self
                .tables
                .values()
                .any(|s| *s == TableState::RolledBack)
    }

    /// Point the current run at a newer `backup`, keeping its table states.
    pub fn record_backup(&mut self, backup: PathBuf) {
        self.backup = Some(backup);
    }

    /// Begin a new run protected by `backup`. Every encrypted table becomes
    /// `BackedUp`.
    pub fn start_run(&mut self, backup: PathBuf) {
        self.run_id = Some(Uuid::new_v4().to_string());
        self.backup = Some(backup);
        self.tables = Table::ENCRYPTED
            .into_iter()
            .map(|t| (t, TableState::BackedUp))
            .collect();
    }
}
