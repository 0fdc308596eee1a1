//! Daemon configuration
//!
//! Stored as JSON, by default at `<config dir>/config.json`. Every field has a
//! default, so an empty object (or no file at all) is a valid configuration.

use crate::core::error::{Error, Result};
use crate::core::nft::DEFAULT_TABLE;
use crate::core::watchdog::{DEFAULT_CHECK_INTERVAL, DEFAULT_HANDOFF_TIMEOUT, WatchdogConfig};
use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Upper bound for the stop hand-off; the hand-off must stay short
const MAX_HANDOFF_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Netfilter queue that receives intercepted traffic. Left unset, the
    /// status store keeps queue 0.
    #[serde(default)]
    pub queue_number: Option<i64>,
    /// nftables table (family `inet`) holding the interception rules
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_handoff_timeout")]
    pub handoff_timeout_ms: u64,
    /// Write daemon logs here instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Record rule installs, reloads and removals in the audit log
    #[serde(default = "default_true")]
    pub audit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_number: None,
            table: default_table(),
            check_interval_secs: default_check_interval(),
            handoff_timeout_ms: default_handoff_timeout(),
            log_file: None,
            audit: true,
        }
    }
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_check_interval() -> u64 {
    DEFAULT_CHECK_INTERVAL.as_secs()
}

#[allow(clippy::cast_possible_truncation)]
fn default_handoff_timeout() -> u64 {
    DEFAULT_HANDOFF_TIMEOUT.as_millis() as u64
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Watchdog tunables, clamped to usable values
    pub fn watchdog(&self) -> WatchdogConfig {
        WatchdogConfig {
            check_interval: Duration::from_secs(self.check_interval_secs.max(1)),
            handoff_timeout: Duration::from_millis(
                self.handoff_timeout_ms.clamp(1, MAX_HANDOFF_TIMEOUT_MS),
            ),
        }
    }
}

/// Default location of the config file
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Loads the config from `path` (or the default location).
///
/// A missing file yields the defaults. An unreadable or invalid file also
/// yields the defaults, with a warning.
pub async fn load_config(path: Option<&Path>) -> Config {
    let Some(path) = path.map(Path::to_path_buf).or_else(default_config_path) else {
        return Config::default();
    };

    match tokio::fs::read_to_string(&path).await {
        Ok(json) => match serde_json::from_str::<Config>(&json) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring invalid config {}: {e}", path.display());
                Config::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => {
            warn!("Failed to read config {}: {e}", path.display());
            Config::default()
        }
    }
}

/// Saves the config using an atomic write pattern.
///
/// The JSON is written to a temporary file in the target directory (created
/// with mode 0o600 on Unix), flushed, then renamed over the target.
///
/// # Errors
///
/// Returns `Err` if the directory is not writable or the rename fails
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(config)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(json.as_bytes())?;
    temp.write_all(b"\n")?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            Error::Config("Disk full: cannot save configuration".to_string())
        } else {
            Error::Io(e.error)
        }
    })?;

    Ok(())
}
