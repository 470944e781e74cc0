//! Configuration loading
//!
//! A missing or partial config file never prevents startup: absent fields
//! fall back to compiled defaults and a warning is logged.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cache subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Freshness window for cached entries, in seconds.
    #[serde(default = "default_entry_ttl_seconds")]
    pub entry_ttl_seconds: u64,

    /// Upper bound on ids per remote batch call.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Deadline for one confirmation, in seconds. Past it the caller is
    /// told the write timed out even if the network call is still in
    /// flight.
    #[serde(default = "default_confirmation_timeout_seconds")]
    pub confirmation_timeout_seconds: u64,

    /// Attempts per confirmation before a transient failure turns
    /// terminal.
    #[serde(default = "default_confirmation_attempts")]
    pub confirmation_attempts: u32,

    /// Initial retry backoff in milliseconds; doubles per attempt,
    /// capped at 5000.
    #[serde(default = "default_confirmation_backoff_initial_ms")]
    pub confirmation_backoff_initial_ms: u64,

    /// Master switch for the persistent tier.
    #[serde(default = "default_persistence_enabled")]
    pub persistence_enabled: bool,

    /// Sqlite database path for the persistent tier; `None` uses an
    /// in-memory database (no cross-session survival).
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

fn default_entry_ttl_seconds() -> u64 {
    300
}
fn default_max_batch_size() -> usize {
    100
}
fn default_confirmation_timeout_seconds() -> u64 {
    45
}
fn default_confirmation_attempts() -> u32 {
    5
}
fn default_confirmation_backoff_initial_ms() -> u64 {
    200
}
fn default_persistence_enabled() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entry_ttl_seconds: default_entry_ttl_seconds(),
            max_batch_size: default_max_batch_size(),
            confirmation_timeout_seconds: default_confirmation_timeout_seconds(),
            confirmation_attempts: default_confirmation_attempts(),
            confirmation_backoff_initial_ms: default_confirmation_backoff_initial_ms(),
            persistence_enabled: default_persistence_enabled(),
            database_path: None,
        }
    }
}

impl CacheConfig {
    /// Load from a TOML file. A missing file yields defaults with a
    /// warning; a present-but-malformed file is a hard error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: CacheConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::Config("max_batch_size must be at least 1".into()));
        }
        if self.confirmation_attempts == 0 {
            return Err(Error::Config("confirmation_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_seconds)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_seconds)
    }

    pub fn confirmation_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.confirmation_backoff_initial_ms)
    }
}
