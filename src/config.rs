use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Value of the `kind` field carried by every command envelope.
pub const PROTOCOL_KIND: &str = "twainlocalscanner";

/// Header carrying the capability token obtained from `/privet/infoex`.
pub const PRIVET_TOKEN_HEADER: &str = "X-Privet-Token";

/// Content type sent and accepted on every JSON command.
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Scanners number image blocks from 1.
pub const FIRST_IMAGE_BLOCK: u64 = 1;

/// Upper end of the range used to release everything still held by the scanner.
pub const RELEASE_ALL_LAST_BLOCK: u64 = i32::MAX as u64;

/// Read size when appending later parts onto an image file (128 KB).
pub const CONCAT_CHUNK_SIZE: usize = 128 * 1024;

/// Largest JSON metadata part accepted in a readImageBlock response (1 MB).
pub const MAX_METADATA_BYTES: usize = 1024 * 1024;

/// Largest header block accepted for one multipart body part (16 KB).
pub const MAX_PART_HEADER_BYTES: usize = 16 * 1024;

/// Top-level configuration for a scanner session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Maximum number of image blocks downloading at once.
    pub window_size: usize,
    /// Consecutive failed long-polls tolerated before polling stops.
    pub poll_retry_limit: u32,
    /// Pause between failed long-polls, in milliseconds.
    pub poll_retry_delay_ms: u64,
    /// Pause before a failed block download is offered to the window again.
    pub download_retry_delay_ms: u64,
    /// Parent directory for the per-session scratch directory.
    pub scratch_root: Option<PathBuf>,
    /// Directory that assembled image files are moved into.
    pub delivery_dir: PathBuf,
    /// Buffer size of the session event channel.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            window_size: 3,
            poll_retry_limit: 3,
            poll_retry_delay_ms: 250,
            download_retry_delay_ms: 500,
            scratch_root: None,
            delivery_dir: std::env::temp_dir().join("twain-direct-scans"),
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Load a config from a JSON file. Missing keys take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.window_size > 0, "window_size must be > 0");
        anyhow::ensure!(self.poll_retry_limit > 0, "poll_retry_limit must be > 0");
        anyhow::ensure!(self.event_capacity > 0, "event_capacity must be > 0");
        Ok(())
    }

    pub fn poll_retry_delay(&self) -> Duration {
        Duration::from_millis(self.poll_retry_delay_ms)
    }

    pub fn download_retry_delay(&self) -> Duration {
        Duration::from_millis(self.download_retry_delay_ms)
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}
