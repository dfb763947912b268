//! Service configuration.
//!
//! JSON on disk, serde in memory, defaults that match the tuning the
//! driver shipped with. Unknown fields are rejected so typos surface at
//! load time instead of silently falling back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use openstill_engine::EngineTuning;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Where the daemon looks for its config unless told otherwise.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/openstill/config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServiceConfig {
    /// Directory for the per-device sockets (`still0.sock`, ...).
    pub socket_dir: PathBuf,
    /// Fail a second open while a handle is live. Off by default: a
    /// dangling client holding the socket would otherwise lock the
    /// camera out until restart.
    pub exclusive_access: bool,
    /// Transfer buffers preallocated per device.
    pub initial_pool_buffers: usize,
    /// Hard cap on transfer buffers per device.
    pub pool_buffer_limit: usize,
    /// Frame reassembly capacity, in 4 KiB pages.
    pub frame_buf_pages: usize,
    /// Control transfer timeout in milliseconds.
    pub ctrl_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let tuning = EngineTuning::default();
        Self {
            socket_dir: PathBuf::from("/run/openstill"),
            exclusive_access: tuning.exclusive_access,
            initial_pool_buffers: tuning.initial_pool_buffers,
            pool_buffer_limit: tuning.pool_buffer_limit,
            frame_buf_pages: tuning.frame_buf_pages,
            ctrl_timeout_ms: tuning.ctrl_timeout.as_millis() as u64,
        }
    }
}

impl ServiceConfig {
    /// Load from the default path, falling back to defaults if the file
    /// does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("parsing config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self).context("serializing config")?;
        std::fs::write(path, content)
            .with_context(|| format!("writing config to {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.pool_buffer_limit >= self.initial_pool_buffers,
            "pool_buffer_limit must be >= initial_pool_buffers"
        );
        anyhow::ensure!(self.frame_buf_pages > 0, "frame_buf_pages must be positive");
        anyhow::ensure!(self.ctrl_timeout_ms > 0, "ctrl_timeout_ms must be positive");
        Ok(())
    }

    /// The engine-side view of this config.
    pub fn engine_tuning(&self) -> EngineTuning {
        EngineTuning {
            exclusive_access: self.exclusive_access,
            initial_pool_buffers: self.initial_pool_buffers,
            pool_buffer_limit: self.pool_buffer_limit,
            frame_buf_pages: self.frame_buf_pages,
            ctrl_timeout: Duration::from_millis(self.ctrl_timeout_ms),
        }
    }

    /// Socket path for device `id`.
    pub fn socket_path(&self, id: u32) -> PathBuf {
        self.socket_dir.join(format!("still{id}.sock"))
    }
}
