//! Ingest server configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_poll_interval_secs() -> f64 {
    5.0
}

fn default_resubmit_delay_secs() -> f64 {
    15.0
}

fn default_target_video_bitrate() -> u32 {
    2_500_000
}

fn default_owner() -> String {
    "admin".to_string()
}

/// Configuration for the ingest pipeline.
///
/// All fields have defaults; [`IngestConfig::from_env`] overlays environment
/// variables on top of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Root of the data area holding `incoming/`, `videos/` and `rejected/`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// SQLite database URL. Empty means `<data_dir>/reelvault.db`.
    #[serde(default)]
    pub database_url: String,

    /// Worker cap per pool. 0 = use the pool default (half the cores).
    #[serde(default)]
    pub max_workers: usize,

    /// Incoming directory scan interval, in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,

    /// Cool-down before a still-unconsumed incoming file is resubmitted,
    /// in seconds.
    #[serde(default = "default_resubmit_delay_secs")]
    pub resubmit_delay_secs: f64,

    /// Target maximum video bitrate after transcoding, bits per second.
    #[serde(default = "default_target_video_bitrate")]
    pub target_video_bitrate: u32,

    /// Owner attributed to files found in `incoming/` without an explicit
    /// upload request.
    #[serde(default = "default_owner")]
    pub default_owner: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_url: String::new(),
            max_workers: 0,
            poll_interval_secs: default_poll_interval_secs(),
            resubmit_delay_secs: default_resubmit_delay_secs(),
            target_video_bitrate: default_target_video_bitrate(),
            default_owner: default_owner(),
        }
    }
}

impl IngestConfig {
    /// Build a config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("REELVAULT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(v) = std::env::var("REELVAULT_MAX_WORKERS") {
            config.max_workers = v
                .parse()
                .map_err(|_| Error::config(format!("invalid REELVAULT_MAX_WORKERS: {v}")))?;
        }
        if let Ok(v) = std::env::var("REELVAULT_POLL_INTERVAL_SECS") {
            config.poll_interval_secs = v
                .parse()
                .map_err(|_| Error::config(format!("invalid REELVAULT_POLL_INTERVAL_SECS: {v}")))?;
        }
        if let Ok(v) = std::env::var("REELVAULT_RESUBMIT_DELAY_SECS") {
            config.resubmit_delay_secs = v.parse().map_err(|_| {
                Error::config(format!("invalid REELVAULT_RESUBMIT_DELAY_SECS: {v}"))
            })?;
        }
        if let Ok(v) = std::env::var("REELVAULT_TARGET_BITRATE") {
            config.target_video_bitrate = v
                .parse()
                .map_err(|_| Error::config(format!("invalid REELVAULT_TARGET_BITRATE: {v}")))?;
        }
        if let Ok(owner) = std::env::var("REELVAULT_DEFAULT_OWNER") {
            config.default_owner = owner;
        }

        Ok(config)
    }

    /// The effective database URL.
    pub fn database_url(&self) -> String {
        if self.database_url.is_empty() {
            format!(
                "sqlite:{}?mode=rwc",
                self.data_dir.join("reelvault.db").display()
            )
        } else {
            self.database_url.clone()
        }
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.data_dir.join("incoming")
    }

    pub fn videos_dir(&self) -> PathBuf {
        self.data_dir.join("videos")
    }

    pub fn rejected_dir(&self) -> PathBuf {
        self.data_dir.join("rejected")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn resubmit_delay(&self) -> Duration {
        Duration::from_secs_f64(self.resubmit_delay_secs)
    }
}
