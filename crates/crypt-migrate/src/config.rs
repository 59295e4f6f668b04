//! Configuration loading and validation for the migration console.

use std::path::PathBuf;

use anyhow::{Context, Result};
use fieldcrypt::migration::DEFAULT_SAMPLE_SIZE;
use serde::Deserialize;

/// Validated console configuration, read from the same environment as the
/// service.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Base64 primary field-encryption key. Required by every job that reads
    /// or writes ciphertext.
    #[serde(default)]
    pub user_encryption_key: Option<String>,

    /// Base64 previous key, accepted for decryption only.
    #[serde(default)]
    pub user_encryption_key_rotation: Option<String>,

    /// JSON file backing the record store.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Directory holding backups and the run checkpoint.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Values per column sampled by the verify jobs.
    #[serde(default = "default_verify_sample_size")]
    pub verify_sample_size: usize,

    /// Tracing log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_data_path() -> PathBuf {
    "data/annotator.json".into()
}
fn default_backup_dir() -> PathBuf {
    "migration_backups".into()
}
fn default_verify_sample_size() -> usize {
    DEFAULT_SAMPLE_SIZE
}
fn default_log_level() -> String {
    "info".into()
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |k: &Option<String>| k.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("Config")
            .field("user_encryption_key", &redact(&self.user_encryption_key))
            .field(
                "user_encryption_key_rotation",
                &redact(&self.user_encryption_key_rotation),
            )
            .field("data_path", &self.data_path)
            .field("backup_dir", &self.backup_dir)
            .field("verify_sample_size", &self.verify_sample_size)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl Config {
    /// Load and validate configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build crypt-migrate configuration")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise crypt-migrate configuration")?;

        c.validate()?;
        Ok(c)
    }

    fn validate(&self) -> Result<()> {
        if self.data_path.as_os_str().is_empty() {
            anyhow::bail!("DATA_PATH must not be empty");
        }
        if self.backup_dir.as_os_str().is_empty() {
            anyhow::bail!("BACKUP_DIR must not be empty");
        }
        if self.verify_sample_size == 0 {
            anyhow::bail!("VERIFY_SAMPLE_SIZE must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config(dir: &std::path::Path, key: Option<String>) -> Config {
    Config {
        user_encryption_key: key,
        user_encryption_key_rotation: None,
        data_path: dir.join("store.json"),
        backup_dir: dir.join("backups"),
        verify_sample_size: default_verify_sample_size(),
        log_level: default_log_level(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        assert_eq!(default_data_path(), PathBuf::from("data/annotator.json"));
        assert_eq!(default_backup_dir(), PathBuf::from("migration_backups"));
        assert_eq!(default_verify_sample_size(), 10);
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn validate_rejects_zero_sample() {
        let dir = std::env::temp_dir();
        let cfg = Config {
            verify_sample_size: 0,
            ..test_config(&dir, None)
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_missing_key() {
        // generate-key and list-backups run without one.
        let dir = std::env::temp_dir();
        assert!(test_config(&dir, None).validate().is_ok());
    }

    #[test]
    fn debug_redacts_keys() {
        let dir = std::env::temp_dir();
        let printed = format!("{:?}", test_config(&dir, Some("c2VjcmV0".into())));
        assert!(!printed.contains("c2VjcmV0"));
        assert!(printed.contains("REDACTED"));
    }
}
