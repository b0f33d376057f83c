//! Linker configuration, read from an optional TOML file.

use personlink_core::{Error, ListSortOrder, Result, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkerConfig {
    /// Ordering used when building person sort keys
    pub list_sort_order: ListSortOrder,
    /// Page size used when enumerating contacts
    pub page_size: usize,
    pub watch_poll_interval_ms: u64,
    pub snapshot_interval_secs: u64,
    pub data_dir: PathBuf,
    pub http_port: u16,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            list_sort_order: ListSortOrder::default(),
            page_size: DEFAULT_PAGE_SIZE,
            watch_poll_interval_ms: 1000,
            snapshot_interval_secs: 300,
            data_dir: PathBuf::from("./data"),
            http_port: 6340,
        }
    }
}

impl LinkerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: LinkerConfig =
            toml::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::InvalidConfig("page_size must be positive".to_string()));
        }
        if self.watch_poll_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "watch_poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch_poll_interval_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}
