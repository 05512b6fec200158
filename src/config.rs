//! Host configuration.
//!
//! Loaded from a TOML file or constructed programmatically; every field
//! beyond the data directory and master secret has a sensible default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::protocol::{EXECUTE_TIMEOUT_MS, READY_TIMEOUT_MS, REQUEST_TIMEOUT_MS};

/// Configuration for an [`ExtensionHost`](crate::host::ExtensionHost).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Root directory for databases and per-extension storage paths.
    pub data_dir: PathBuf,

    /// Master secret used to derive the secrets encryption key.
    pub master_secret: String,

    /// Deadline for generic request/response exchanges, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Deadline for tool and action execution, in milliseconds.
    #[serde(default = "default_execute_timeout_ms")]
    pub execute_timeout_ms: u64,

    /// How long activation waits for the worker's ready handshake.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// Buffered events per provider stream before backpressure applies.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

fn default_request_timeout_ms() -> u64 {
    REQUEST_TIMEOUT_MS
}

fn default_execute_timeout_ms() -> u64 {
    EXECUTE_TIMEOUT_MS
}

fn default_ready_timeout_ms() -> u64 {
    READY_TIMEOUT_MS
}

fn default_stream_buffer() -> usize {
    64
}

impl HostConfig {
    /// Build a config with default timeouts.
    pub fn new(data_dir: impl Into<PathBuf>, master_secret: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            master_secret: master_secret.into(),
            request_timeout_ms: default_request_timeout_ms(),
            execute_timeout_ms: default_execute_timeout_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            stream_buffer: default_stream_buffer(),
        }
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    /// Platform data directory (`~/.local/share/proassist` on Linux).
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("proassist")
    }

    pub fn storage_db_path(&self) -> PathBuf {
        self.data_dir.join("storage.db")
    }

    pub fn secrets_db_path(&self) -> PathBuf {
        self.data_dir.join("secrets.db")
    }

    /// Per-extension scratch directory, created on load.
    pub fn extension_storage_path(&self, extension_id: &str) -> PathBuf {
        self.data_dir.join("extensions").join(extension_id)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.request_timeout_ms)
    }

    pub fn execute_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.execute_timeout_ms)
    }

    pub fn ready_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ready_timeout_ms)
    }
}
