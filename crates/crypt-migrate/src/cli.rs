//! Command-line surface of the migration console.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fieldcrypt::Table;

#[derive(Parser, Debug)]
#[command(
    name = "crypt-migrate",
    version,
    about = "Encrypt, verify and roll back PII columns of the annotator store",
    long_about = "crypt-migrate: operator jobs for field-level encryption at rest.\n\
                  Keys, store path and backup directory come from the environment \
                  (USER_ENCRYPTION_KEY, USER_ENCRYPTION_KEY_ROTATION, DATA_PATH, BACKUP_DIR)."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print a new random key for USER_ENCRYPTION_KEY
    GenerateKey,

    /// Show row counts and the checkpoint state of every encrypted table
    Status,

    /// Snapshot every encrypted column to a new backup file
    CreateBackup,

    /// Encrypt one table (safe to repeat)
    MigrateTable {
        /// Table name, e.g. USER or feedback-request
        table: Table,
    },

    /// Encrypt every table, resuming after the last completed one
    MigrateAll,

    /// Check that sampled values are ciphertext readable with the current keys
    VerifyMigration {
        /// Values per column to sample (overrides VERIFY_SAMPLE_SIZE)
        #[arg(long)]
        sample: Option<usize>,
    },

    /// Decrypt every table back to plaintext and re-create foreign keys
    Rollback {
        /// Do not ask for confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Check that sampled values are plaintext again
    VerifyRollback {
        /// Values per column to sample (overrides VERIFY_SAMPLE_SIZE)
        #[arg(long)]
        sample: Option<usize>,
    },

    /// List backups in BACKUP_DIR, oldest first
    ListBackups,

    /// Write the values of a backup file back into the store
    RestoreBackup {
        /// Backup file, as printed by list-backups
        path: PathBuf,
        /// Do not ask for confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Command {
        Cli::try_parse_from(std::iter::once("crypt-migrate").chain(args.iter().copied()))
            .unwrap()
            .command
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn table_names_parse_case_insensitively() {
        assert_eq!(
            parse(&["migrate-table", "feedback-request"]),
            Command::MigrateTable {
                table: Table::FeedbackRequest
            }
        );
        assert!(Cli::try_parse_from(["crypt-migrate", "migrate-table", "nope"]).is_err());
    }

    #[test]
    fn destructive_commands_take_yes() {
        assert_eq!(parse(&["rollback", "-y"]), Command::Rollback { yes: true });
        assert_eq!(
            parse(&["restore-backup", "b.json"]),
            Command::RestoreBackup {
                path: "b.json".into(),
                yes: false
            }
        );
    }
}
