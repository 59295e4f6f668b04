//! Operator batch jobs that move the encrypted tables between plaintext and
//! ciphertext.
//!
//! # Forward migration, per table
//!
//! 1. A fresh backup of every encrypted column is taken on every invocation
//!    that may change rows. If the backup fails nothing is mutated.
//! 2. The checkpoint marks the table `Migrating`.
//! 3. Foreign keys that join on plaintext email are dropped.
//! 4. Every non-empty string in an encrypted column that does not already look
//!    encrypted is encrypted; the changes are applied as one batch.
//! 5. The checkpoint marks the table `Migrated`.
//!
//! A failure in steps 3-4 aborts that table only; earlier tables stay
//! migrated. Re-running is always safe: values that already look encrypted are
//! skipped, and `migrate_all` skips tables the checkpoint records as done.
//!
//! # Rollback
//!
//! Takes a fresh backup, decrypts every encrypted column in place, re-creates
//! the plaintext foreign keys and marks the tables `RolledBack`. Values that
//! look encrypted but open under no key are reported and left untouched.

pub mod backup;
pub mod checkpoint;
pub mod constraints;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::crypto::{CipherError, Decryption, FieldCipher};
use crate::store::{RecordStore, Row, RowId, StoreError, Table};
use crate::Record;

pub use backup::Backup;
pub use checkpoint::{Checkpoint, TableState};
pub use constraints::ConstraintRepair;

/// Default number of values per column sampled by the verify jobs.
pub const DEFAULT_SAMPLE_SIZE: usize = 10;

const SELF_TEST_VALUE: &str = "verification-probe@example.invalid";

/// Errors that stop a migration job.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error("migration io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("migration serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("table {0} has no encrypted columns")]
    NotEncrypted(Table),

    #[error("backup not found: {}", .0.display())]
    BackupNotFound(PathBuf),

    #[error("table {table} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        table: Table,
        from: TableState,
        to: TableState,
    },
}

/// What happened to one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReport {
    pub table: Table,
    pub rows_scanned: usize,
    pub rows_changed: usize,
    pub fields_changed: usize,
    /// Fields already in the target form.
    pub fields_skipped: usize,
    /// Backed-up rows that no longer exist (restore only).
    pub rows_missing: usize,
    /// Whether the table's batch was committed.
    pub committed: bool,
    pub failures: Vec<String>,
}

impl TableReport {
    fn new(table: Table) -> Self {
        Self {
            table,
            rows_scanned: 0,
            rows_changed: 0,
            fields_changed: 0,
            fields_skipped: 0,
            rows_missing: 0,
            committed: false,
            failures: Vec::new(),
        }
    }

    fn aborted(table: Table, err: &MigrationError) -> Self {
        let mut report = Self::new(table);
        report.failures.push(err.to_string());
        report
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of a multi-table job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    /// Backup protecting this job.
    pub backup: Option<PathBuf>,
    pub tables: Vec<TableReport>,
    /// Tables the checkpoint already recorded as done.
    pub skipped: Vec<Table>,
    /// Foreign-key repair, for jobs that re-create constraints.
    pub constraints: Option<ConstraintRepair>,
}

impl MigrationSummary {
    pub fn is_success(&self) -> bool {
        self.tables.iter().all(TableReport::is_success)
            && self.constraints.as_ref().map_or(true, ConstraintRepair::is_success)
    }
}

/// Sample check of one encrypted column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnCheck {
    pub table: Table,
    pub column: &'static str,
    pub sampled: usize,
    /// Rows whose value is in the wrong form.
    pub offending: Vec<RowId>,
}

/// Result of a verify job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub columns: Vec<ColumnCheck>,
    /// Encrypt/decrypt round trip with the configured keys; `None` when not run.
    pub self_test: Option<bool>,
}

impl VerifyReport {
    pub fn is_success(&self) -> bool {
        self.self_test != Some(false) && self.columns.iter().all(|c| c.offending.is_empty())
    }
}

/// Runs the migration, verification, backup and rollback jobs.
#[derive(Clone)]
pub struct Migrator {
    store: Arc<dyn RecordStore>,
    cipher: Arc<FieldCipher>,
    backup_dir: PathBuf,
}

impl Migrator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cipher: Arc<FieldCipher>,
        backup_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            cipher,
            backup_dir: backup_dir.into(),
        }
    }

    /// Snapshot every encrypted column. When no run is in progress the new
    /// backup becomes the one protecting the next forward run.
    ///
    /// # Errors
    ///
    /// Store, serialisation or filesystem errors.
    pub async fn create_backup(&self) -> Result<PathBuf, MigrationError> {
        let mut cp = Checkpoint::load(&self.backup_dir).await?;
        let (path, _) =
            backup::create_backup(self.store.as_ref(), &self.backup_dir, "manual backup").await?;
        if cp.needs_new_run() {
            cp.start_run(path.clone());
            cp.save(&self.backup_dir).await?;
        }
        Ok(path)
    }

    /// Encrypt one table. Always makes an idempotent pass, even when the
    /// checkpoint already records the table as migrated.
    ///
    /// Failures inside the table are returned in the report.
    ///
    /// # Errors
    ///
    /// [`MigrationError::NotEncrypted`] for a table without encrypted columns,
    /// or any error taking the backup or writing the checkpoint. In those cases
    /// no row has been touched.
    pub async fn migrate_table(&self, table: Table) -> Result<TableReport, MigrationError> {
        if !table.is_encrypted() {
            return Err(MigrationError::NotEncrypted(table));
        }
        let mut cp = Checkpoint::load(&self.backup_dir).await?;
        self.backup_before_run(&mut cp).await?;
        self.migrate_with(&mut cp, table).await
    }

    /// Encrypt every encrypted table in catalogue order, resuming after the
    /// last table the checkpoint records as migrated. No backup is taken when
    /// every table is already migrated.
    ///
    /// # Errors
    ///
    /// Backup or checkpoint errors. Per-table failures are in the summary.
    pub async fn migrate_all(&self) -> Result<MigrationSummary, MigrationError> {
        let mut cp = Checkpoint::load(&self.backup_dir).await?;
        let pending = cp.needs_new_run()
            || Table::ENCRYPTED
                .into_iter()
                .any(|t| cp.state(t) != TableState::Migrated);
        if pending {
            self.backup_before_run(&mut cp).await?;
        }

        let mut summary = MigrationSummary {
            backup: cp.backup.clone(),
            ..MigrationSummary::default()
        };
        for table in Table::ENCRYPTED {
            if cp.state(table) == TableState::Migrated {
                info!(%table, "already migrated in this run; skipping");
                summary.skipped.push(table);
                continue;
            }
            summary.tables.push(self.migrate_with(&mut cp, table).await?);
        }

        info!(
            tables = summary.tables.len(),
            skipped = summary.skipped.len(),
            success = summary.is_success(),
            "migration finished"
        );
        Ok(summary)
    }

    /// Check that the first `sample` non-empty values of every encrypted column
    /// are ciphertext that opens under the configured keys, after a round-trip
    /// self-test of the keys.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn verify_migration(&self, sample: usize) -> Result<VerifyReport, MigrationError> {
        let self_test = self.self_test();
        if !self_test {
            error!("encryption self-test failed");
        }
        let columns = self
            .check_columns(sample, |value| {
                matches!(self.cipher.decrypt_tagged(value), Decryption::Decrypted(_))
            })
            .await?;
        Ok(VerifyReport {
            columns,
            self_test: Some(self_test),
        })
    }

    /// Decrypt every encrypted column back to plaintext and re-create the
    /// plaintext foreign keys.
    ///
    /// # Errors
    ///
    /// Errors taking the pre-rollback backup (nothing is mutated then) or
    /// writing the checkpoint. Per-table failures are in the summary.
    pub async fn rollback_to_plaintext(&self) -> Result<MigrationSummary, MigrationError> {
        let (path, _) =
            backup::create_backup(self.store.as_ref(), &self.backup_dir, "pre-rollback").await?;
        let mut cp = Checkpoint::load(&self.backup_dir).await?;
        let mut summary = MigrationSummary {
            backup: Some(path),
            ..MigrationSummary::default()
        };

        for table in Table::ENCRYPTED {
            let report = match self.decrypt_table(table).await {
                Ok(report) => report,
                Err(e) => {
                    error!(%table, error = %e, "rollback aborted for table");
                    TableReport::aborted(table, &e)
                }
            };
            if report.is_success() {
                cp.transition(table, TableState::RolledBack)?;
            }
            summary.tables.push(report);
        }
        cp.save(&self.backup_dir).await?;

        summary.constraints =
            Some(constraints::restore_plaintext_foreign_keys(self.store.as_ref()).await);
        info!(success = summary.is_success(), "rollback finished");
        Ok(summary)
    }

    /// Check that the first `sample` non-empty values of every encrypted column
    /// no longer look encrypted.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn verify_rollback(&self, sample: usize) -> Result<VerifyReport, MigrationError> {
        let columns = self
            .check_columns(sample, |value| !self.cipher.is_encrypted(value))
            .await?;
        Ok(VerifyReport {
            columns,
            self_test: None,
        })
    }

    /// Write the values in the backup at `path` back into the store.
    ///
    /// Rows deleted since the backup are skipped. When every restored value is
    /// plaintext the foreign keys are re-created and the tables are marked
    /// `RolledBack`.
    ///
    /// # Errors
    ///
    /// [`MigrationError::BackupNotFound`] or other errors reading the backup or
    /// writing the checkpoint. Per-table failures are in the summary.
    pub async fn restore_backup(&self, path: &Path) -> Result<MigrationSummary, MigrationError> {
        let snapshot = backup::load_backup(path).await?;
        let mut cp = Checkpoint::load(&self.backup_dir).await?;
        let mut summary = MigrationSummary {
            backup: Some(path.to_path_buf()),
            ..MigrationSummary::default()
        };
        let mut all_plaintext = true;

        for (table, rows) in &snapshot.tables {
            let table = *table;
            let plaintext = rows.iter().all(|row| {
                row.record
                    .values()
                    .filter_map(Value::as_str)
                    .all(|v| !self.cipher.is_encrypted(v))
            });
            all_plaintext &= plaintext;

            let mut report = TableReport::new(table);
            report.rows_scanned = rows.len();
            match backup::restore_table(self.store.as_ref(), table, rows).await {
                Ok((restored, missing)) => {
                    report.rows_changed = restored;
                    report.rows_missing = missing;
                    report.committed = true;
                    if plaintext {
                        cp.transition(table, TableState::RolledBack)?;
                    }
                }
                Err(e) => {
                    error!(%table, error = %e, "restore failed for table");
                    report.failures.push(e.to_string());
                }
            }
            summary.tables.push(report);
        }
        cp.save(&self.backup_dir).await?;

        if all_plaintext {
            summary.constraints =
                Some(constraints::restore_plaintext_foreign_keys(self.store.as_ref()).await);
        } else {
            warn!("backup holds ciphertext; foreign keys left as they are");
        }
        Ok(summary)
    }

    async fn backup_before_run(&self, cp: &mut Checkpoint) -> Result<(), MigrationError> {
        let (path, _) =
            backup::create_backup(self.store.as_ref(), &self.backup_dir, "pre-migration").await?;
        if cp.needs_new_run() {
            cp.start_run(path);
            info!(run_id = cp.run_id.as_deref().unwrap_or_default(), "migration run started");
        } else {
            cp.record_backup(path);
            info!(
                run_id = cp.run_id.as_deref().unwrap_or_default(),
                "resuming migration run under a new backup"
            );
        }
        cp.save(&self.backup_dir).await?;
        Ok(())
    }

    async fn migrate_with(
        &self,
        cp: &mut Checkpoint,
        table: Table,
    ) -> Result<TableReport, MigrationError> {
        let previous = cp.state(table);
        cp.transition(table, TableState::Migrating)?;
        cp.save(&self.backup_dir).await?;

        match self.encrypt_table(table).await {
            Ok(report) => {
                cp.transition(table, TableState::Migrated)?;
                cp.save(&self.backup_dir).await?;
                Ok(report)
            }
            Err(e) => {
                error!(%table, error = %e, "migration aborted for table; no rows changed");
                let back = if previous == TableState::Migrated {
                    TableState::Migrated
                } else {
                    TableState::BackedUp
                };
                cp.transition(table, back)?;
                cp.save(&self.backup_dir).await?;
                Ok(TableReport::aborted(table, &e))
            }
        }
    }

    async fn encrypt_table(&self, table: Table) -> Result<TableReport, MigrationError> {
        let dropped = constraints::drop_plaintext_foreign_keys(self.store.as_ref(), table).await?;
        if !dropped.is_empty() {
            info!(%table, constraints = dropped.len(), "plaintext foreign keys dropped");
        }

        let rows = self.store.rows(table).await?;
        let mut report = TableReport::new(table);
        report.rows_scanned = rows.len();

        let mut updates = Vec::new();
        for row in &rows {
            let changes = self.transform_row(row, table, &mut report, |value| {
                if self.cipher.is_encrypted(value) {
                    Ok(None)
                } else {
                    self.cipher.encrypt_str(value).map(Some)
                }
            })?;
            if let Some(changes) = changes {
                updates.push((row.id, changes));
            }
        }

        report.rows_changed = self.store.apply_batch(table, updates).await?;
        report.committed = true;
        info!(
            %table,
            rows = report.rows_scanned,
            changed = report.rows_changed,
            fields = report.fields_changed,
            skipped = report.fields_skipped,
            "table encrypted"
        );
        Ok(report)
    }

    async fn decrypt_table(&self, table: Table) -> Result<TableReport, MigrationError> {
        let rows = self.store.rows(table).await?;
        let mut report = TableReport::new(table);
        report.rows_scanned = rows.len();

        let mut updates = Vec::new();
        let mut corrupt = Vec::new();
        for row in &rows {
            let changes = self.transform_row(row, table, &mut report, |value| {
                Ok(match self.cipher.decrypt_tagged(value) {
                    Decryption::Decrypted(plain) => Some(plain),
                    Decryption::LegacyPlaintext(_) => None,
                    Decryption::Corrupt { error, .. } => {
                        corrupt.push(format!("row {}: {error}", row.id));
                        None
                    }
                })
            })?;
            if let Some(changes) = changes {
                updates.push((row.id, changes));
            }
        }

        report.rows_changed = self.store.apply_batch(table, updates).await?;
        report.committed = true;
        for failure in &corrupt {
            warn!(%table, failure = %failure, "value left encrypted");
        }
        report.failures.extend(corrupt);
        info!(
            %table,
            rows = report.rows_scanned,
            changed = report.rows_changed,
            fields = report.fields_changed,
            "table decrypted"
        );
        Ok(report)
    }

    /// Apply `convert` to every non-empty string in the encrypted columns of
    /// `row`. `convert` returns the replacement, or `None` to leave the value.
    fn transform_row(
        &self,
        row: &Row,
        table: Table,
        report: &mut TableReport,
        mut convert: impl FnMut(&str) -> Result<Option<String>, CipherError>,
    ) -> Result<Option<Record>, MigrationError> {
        let mut changes = Record::new();
        for column in table.encrypted_columns() {
            let Some(value) = row.str_field(column).filter(|v| !v.is_empty()) else {
                continue;
            };
            match convert(value)? {
                Some(converted) => {
                    changes.insert((*column).to_owned(), Value::String(converted));
                }
                None => report.fields_skipped += 1,
            }
        }

        if changes.is_empty() {
            debug!(%table, id = row.id, "row unchanged");
            return Ok(None);
        }
        info!(%table, id = row.id, fields = changes.len(), "row converted");
        report.fields_changed += changes.len();
        Ok(Some(changes))
    }

    async fn check_columns(
        &self,
        sample: usize,
        accept: impl Fn(&str) -> bool,
    ) -> Result<Vec<ColumnCheck>, MigrationError> {
        let mut checks = Vec::new();
        for table in Table::ENCRYPTED {
            let rows = self.store.rows(table).await?;
            for &column in table.encrypted_columns() {
                let values: Vec<(RowId, &str)> = rows
                    .iter()
                    .filter_map(|row| row.str_field(column).map(|v| (row.id, v)))
                    .filter(|(_, v)| !v.is_empty())
                    .take(sample)
                    .collect();
                let offending: Vec<RowId> = values
                    .iter()
                    .filter(|(_, v)| !accept(*v))
                    .map(|(id, _)| *id)
                    .collect();
                if !offending.is_empty() {
                    warn!(%table, column, rows = ?offending, "verification failed");
                }
                checks.push(ColumnCheck {
                    table,
                    column,
                    sampled: values.len(),
                    offending,
                });
            }
        }
        Ok(checks)
    }

    fn self_test(&self) -> bool {
        match self.cipher.encrypt_str(SELF_TEST_VALUE) {
            Ok(ct) => self.cipher.decrypt_tagged(&ct).as_str() == SELF_TEST_VALUE,
            Err(_) => false,
        }
    }
}

/// Row counts per encrypted table, for progress output.
///
/// # Errors
///
/// Store errors.
pub async fn table_counts(store: &dyn RecordStore) -> Result<BTreeMap<Table, usize>, StoreError> {
    let mut counts = BTreeMap::new();
    for table in Table::ENCRYPTED {
        counts.insert(table, store.rows(table).await?.len());
    }
    Ok(counts)
}
