//! Configuration loading and validation for the annotator service.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any variable is invalid.

use anyhow::{Context, Result};
use fieldcrypt::KeyPolicy;
use serde::Deserialize;

/// Validated annotator service configuration.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Base64 primary field-encryption key. Required unless
    /// `allow_ephemeral_key` is set.
    #[serde(default)]
    pub user_encryption_key: Option<String>,

    /// Base64 previous key, accepted for decryption only.
    #[serde(default)]
    pub user_encryption_key_rotation: Option<String>,

    /// Generate a throwaway key when none is configured. Development only.
    #[serde(default)]
    pub allow_ephemeral_key: bool,

    /// JSON file backing the record store.
    #[serde(default = "default_data_path")]
    pub data_path: String,

    /// Port the HTTP server listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// OTLP endpoint for span export. Spans are not exported when unset.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// HTTP header carrying the caller's email address.
    #[serde(default = "default_user_header")]
    pub user_header_name: String,
}

fn default_data_path() -> String {
    "data/annotator.json".into()
}
fn default_listen_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".into()
}
fn default_user_header() -> String {
    "X-User-Email".into()
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
            .field("allow_ephemeral_key", &self.allow_ephemeral_key)
            .field("data_path", &self.data_path)
            .field("listen_port", &self.listen_port)
            .field("otel_exporter_otlp_endpoint", &self.otel_exporter_otlp_endpoint)
            .field("log_level", &self.log_level)
            .field("user_header_name", &self.user_header_name)
            .finish()
    }
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable cannot be parsed or fails validation.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// What to do when `USER_ENCRYPTION_KEY` is absent.
    pub fn key_policy(&self) -> KeyPolicy {
        if self.allow_ephemeral_key {
            KeyPolicy::GenerateIfMissing
        } else {
            KeyPolicy::Require
        }
    }

    /// The OTLP endpoint, treating an empty value as unset.
    pub fn otlp_endpoint(&self) -> Option<&str> {
        self.otel_exporter_otlp_endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
    }

    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.data_path, "DATA_PATH")?;
        ensure_non_empty(&self.user_header_name, "USER_HEADER_NAME")?;
        if self.listen_port == 0 {
            anyhow::bail!("LISTEN_PORT must be > 0");
        }
        let key_missing = self
            .user_encryption_key
            .as_deref()
            .map_or(true, |k| k.trim().is_empty());
        if key_missing && !self.allow_ephemeral_key {
            anyhow::bail!(
                "USER_ENCRYPTION_KEY is required; generate one with `crypt-migrate generate-key` \
                 or set ALLOW_EPHEMERAL_KEY=true for development"
            );
        }
        Ok(())
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
