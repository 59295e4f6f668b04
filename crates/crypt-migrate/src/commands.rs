//! Execution of each console command and the reports it prints.
//!
//! Reports go to `out`; progress is traced through `tracing` to stderr. Row
//! ids appear in reports, field values never do.

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use fieldcrypt::migration::{
    backup, table_counts, Checkpoint, MigrationSummary, Migrator, TableReport, VerifyReport,
};
use fieldcrypt::{EncryptionKey, FieldCipher, KeyPolicy, KeyRing, MemoryStore, Table};
use tracing::info;

use crate::cli::Command;
use crate::config::Config;

/// Run `command`. Returns `false` when the job finished with failures.
pub async fn run(
    command: Command,
    cfg: &Config,
    input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> Result<bool> {
    match command {
        Command::GenerateKey => generate_key(out),
        Command::Status => status(cfg, out).await,
        Command::CreateBackup => {
            let path = migrator(cfg).await?.create_backup().await?;
            writeln!(out, "Backup written: {}", path.display())?;
            Ok(true)
        }
        Command::MigrateTable { table } => {
            let report = migrator(cfg).await?.migrate_table(table).await?;
            write_table(out, &report)?;
            Ok(report.is_success())
        }
        Command::MigrateAll => {
            let summary = migrator(cfg).await?.migrate_all().await?;
            write_summary(out, "Migration", &summary)?;
            Ok(summary.is_success())
        }
        Command::VerifyMigration { sample } => {
            let sample = sample.unwrap_or(cfg.verify_sample_size);
            let report = migrator(cfg).await?.verify_migration(sample).await?;
            write_verify(out, "encrypted", &report)?;
            Ok(report.is_success())
        }
        Command::Rollback { yes } => {
            let prompt = "Decrypt every encrypted column back to plaintext?";
            if !confirm(prompt, yes, input, out)? {
                writeln!(out, "Rollback cancelled.")?;
                return Ok(true);
            }
            let summary = migrator(cfg).await?.rollback_to_plaintext().await?;
            write_summary(out, "Rollback", &summary)?;
            Ok(summary.is_success())
        }
        Command::VerifyRollback { sample } => {
            let sample = sample.unwrap_or(cfg.verify_sample_size);
            let report = migrator(cfg).await?.verify_rollback(sample).await?;
            write_verify(out, "plaintext", &report)?;
            Ok(report.is_success())
        }
        Command::ListBackups => list_backups(&cfg.backup_dir, out).await,
        Command::RestoreBackup { path, yes } => {
            let prompt = format!("Overwrite encrypted columns with {}?", path.display());
            if !confirm(&prompt, yes, input, out)? {
                writeln!(out, "Restore cancelled.")?;
                return Ok(true);
            }
            let summary = migrator(cfg).await?.restore_backup(&path).await?;
            write_summary(out, "Restore", &summary)?;
            Ok(summary.is_success())
        }
    }
}

async fn open_store(cfg: &Config) -> Result<MemoryStore> {
    MemoryStore::open(&cfg.data_path)
        .await
        .with_context(|| format!("failed to open record store at {}", cfg.data_path.display()))
}

async fn migrator(cfg: &Config) -> Result<Migrator> {
    let keys = KeyRing::load(
        cfg.user_encryption_key.as_deref(),
        cfg.user_encryption_key_rotation.as_deref(),
        KeyPolicy::Require,
    )
    .context("failed to load field encryption keys")?;
    let store = open_store(cfg).await?;
    Ok(Migrator::new(
        Arc::new(store),
        Arc::new(FieldCipher::new(keys)),
        cfg.backup_dir.clone(),
    ))
}

fn confirm(
    prompt: &str,
    assume_yes: bool,
    input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    write!(out, "{prompt} (yes/no): ")?;
    out.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}

fn generate_key(out: &mut dyn Write) -> Result<bool> {
    let key = EncryptionKey::generate();
    writeln!(out, "USER_ENCRYPTION_KEY={}", key.to_base64())?;
    writeln!(out, "fingerprint: {}", key.fingerprint())?;
    writeln!(out)?;
    writeln!(
        out,
        "To rotate, move the current key to USER_ENCRYPTION_KEY_ROTATION and set this one as USER_ENCRYPTION_KEY."
    )?;
    info!(fingerprint = %key.fingerprint(), "generated encryption key");
    Ok(true)
}

async fn status(cfg: &Config, out: &mut dyn Write) -> Result<bool> {
    let store = open_store(cfg).await?;
    let counts = table_counts(&store).await?;
    let cp = Checkpoint::load(&cfg.backup_dir).await?;

    writeln!(out, "Store: {}", cfg.data_path.display())?;
    match (&cp.run_id, &cp.backup) {
        (Some(run), Some(backup)) => {
            writeln!(out, "Run:   {run} (backup {})", backup.display())?
        }
        _ => writeln!(out, "Run:   none")?,
    }
    for table in Table::ENCRYPTED {
        writeln!(
            out,
            "  {:<18} {:>7} rows  {:?}",
            table.sql_name(),
            counts.get(&table).copied().unwrap_or(0),
            cp.state(table)
        )?;
    }
    Ok(true)
}

async fn list_backups(dir: &Path, out: &mut dyn Write) -> Result<bool> {
    let paths = backup::list_backups(dir).await?;
    if paths.is_empty() {
        writeln!(out, "No backups in {}", dir.display())?;
        return Ok(true);
    }
    for path in paths {
        match backup::load_backup(&path).await {
            Ok(b) => {
                let rows: usize = b.record_counts.values().sum();
                writeln!(
                    out,
                    "{}  created {}  {} rows  {}",
                    path.display(),
                    b.created_at,
                    rows,
                    b.description
                )?;
            }
            Err(e) => writeln!(out, "{}  unreadable: {e}", path.display())?,
        }
    }
    Ok(true)
}

fn write_table(out: &mut dyn Write, report: &TableReport) -> Result<()> {
    writeln!(
        out,
        "  {:<18} scanned {:>6}  rows changed {:>6}  fields changed {:>6}  skipped {:>6}{}",
        report.table.sql_name(),
        report.rows_scanned,
        report.rows_changed,
        report.fields_changed,
        report.fields_skipped,
        if report.committed { "" } else { "  (not committed)" }
    )?;
    if report.rows_missing > 0 {
        writeln!(out, "      {} backed-up rows no longer exist", report.rows_missing)?;
    }
    for failure in &report.failures {
        writeln!(out, "      FAILED: {failure}")?;
    }
    Ok(())
}

fn write_summary(out: &mut dyn Write, job: &str, summary: &MigrationSummary) -> Result<()> {
    if let Some(backup) = &summary.backup {
        writeln!(out, "Backup: {}", backup.display())?;
    }
    for report in &summary.tables {
        write_table(out, report)?;
    }
    for table in &summary.skipped {
        writeln!(out, "  {:<18} already migrated", table.sql_name())?;
    }
    if let Some(repair) = &summary.constraints {
        writeln!(
            out,
            "Foreign keys: {} created, {} already present",
            repair.created.len(),
            repair.present.len()
        )?;
        for (name, reason) in &repair.failed {
            writeln!(out, "      FAILED: {name}: {reason}")?;
        }
    }
    let outcome = if summary.is_success() {
        "completed"
    } else {
        "completed with failures"
    };
    writeln!(out, "{job} {outcome}.")?;
    Ok(())
}

fn write_verify(out: &mut dyn Write, expected: &str, report: &VerifyReport) -> Result<()> {
    if let Some(passed) = report.self_test {
        writeln!(
            out,
            "Key self-test: {}",
            if passed { "passed" } else { "FAILED" }
        )?;
    }
    for check in &report.columns {
        if check.offending.is_empty() {
            writeln!(
                out,
                "  {}.{}: {} sampled, all {expected}",
                check.table, check.column, check.sampled
            )?;
        } else {
            writeln!(
                out,
                "  {}.{}: {} sampled, {} not {expected} (ids {:?})",
                check.table,
                check.column,
                check.sampled,
                check.offending.len(),
                check.offending
            )?;
        }
    }
    let outcome = if report.is_success() { "passed" } else { "FAILED" };
    writeln!(out, "Verification {outcome}.")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use fieldcrypt::RecordStore;
    use serde_json::json;

    async fn seeded(dir: &Path) -> Config {
        let cfg = test_config(dir, Some(EncryptionKey::generate().to_base64()));
        let store = MemoryStore::open(&cfg.data_path).await.unwrap();
        for (email, first) in [("ann@uni.edu", "Ann"), ("bob@uni.edu", "Bob")] {
            let record = json!({ "email": email, "firstName": first, "lastName": "Lee" });
            store
                .insert(Table::User, record.as_object().cloned().unwrap())
                .await
                .unwrap();
        }
        cfg
    }

    async fn exec(cfg: &Config, command: Command, answer: &str) -> (bool, String) {
        let mut input = answer.as_bytes();
        let mut out = Vec::new();
        let ok = run(command, cfg, &mut input, &mut out).await.unwrap();
        (ok, String::from_utf8(out).unwrap())
    }

    #[tokio::test]
    async fn generate_key_prints_a_loadable_key() {
        let (ok, out) = exec(&test_config(Path::new("."), None), Command::GenerateKey, "").await;
        assert!(ok);
        let line = out.lines().next().unwrap();
        let encoded = line.strip_prefix("USER_ENCRYPTION_KEY=").unwrap();
        assert!(EncryptionKey::from_base64(encoded).is_ok());
    }

    #[tokio::test]
    async fn migrate_verify_rollback_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = seeded(dir.path()).await;

        let (ok, out) = exec(&cfg, Command::MigrateAll, "").await;
        assert!(ok, "{out}");
        assert!(out.contains("Migration completed."));
        assert!(!out.contains("ann@uni.edu"));

        let (ok, out) = exec(&cfg, Command::VerifyMigration { sample: None }, "").await;
        assert!(ok, "{out}");
        assert!(out.contains("Key self-test: passed"));

        let (ok, out) = exec(&cfg, Command::Rollback { yes: false }, "no\n").await;
        assert!(ok);
        assert!(out.contains("Rollback cancelled."));
        let (ok, _) = exec(&cfg, Command::VerifyRollback { sample: Some(5) }, "").await;
        assert!(!ok, "data is still encrypted");

        let (ok, out) = exec(&cfg, Command::Rollback { yes: false }, "yes\n").await;
        assert!(ok, "{out}");
        assert!(out.contains("Foreign keys:"));
        let (ok, _) = exec(&cfg, Command::VerifyRollback { sample: None }, "").await;
        assert!(ok);

        let store = MemoryStore::open(&cfg.data_path).await.unwrap();
        let rows = store.rows(Table::User).await.unwrap();
        assert_eq!(rows[0].str_field("email"), Some("ann@uni.edu"));
    }

    #[tokio::test]
    async fn jobs_that_touch_ciphertext_require_a_key() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path(), None);
        let mut input: &[u8] = b"";
        let mut out = Vec::new();
        assert!(run(Command::MigrateAll, &cfg, &mut input, &mut out).await.is_err());
    }

    #[tokio::test]
    async fn list_and_status_work_without_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = seeded(dir.path()).await;
        exec(&cfg, Command::CreateBackup, "").await;

        let keyless = Config {
            user_encryption_key: None,
            ..cfg.clone()
        };
        let (ok, out) = exec(&keyless, Command::ListBackups, "").await;
        assert!(ok);
        assert!(out.contains("encryption_backup_"));
        assert!(out.contains("2 rows"));

        let (ok, out) = exec(&keyless, Command::Status, "").await;
        assert!(ok);
        assert!(out.contains("USER"));
        assert!(out.contains("BackedUp"));
    }
}
