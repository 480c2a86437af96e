//! Configuration for the component manager.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdaterError};
use crate::version::Version;

/// Allowed poll interval, in hours.
pub const POLL_INTERVAL_HOURS: std::ops::RangeInclusive<u64> = 3..=24;

/// Settings shared by the service, the controller and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Directory URL holding `repository.json`
    pub base_url: String,
    /// Directory the host loads components from
    pub components_dir: PathBuf,
    /// Version of the host application
    pub host_version: Version,
    /// Hours between repository polls
    pub poll_interval_hours: u64,
    /// Consider alpha/beta/rc releases during automatic resolution
    pub show_unstable: bool,
    /// Install available updates on every poll
    pub auto_install: bool,
    pub request_timeout_secs: u64,
    pub download_timeout_secs: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            components_dir: PathBuf::from("custom_components"),
            host_version: Version::new(0, 0, 0),
            poll_interval_hours: 6,
            show_unstable: false,
            auto_install: false,
            request_timeout_secs: 5,
            download_timeout_secs: 10,
        }
    }
}

impl UpdaterConfig {
    /// Create a config for the given repository and host.
    pub fn new(
        base_url: impl Into<String>,
        components_dir: impl Into<PathBuf>,
        host_version: Version,
    ) -> Self {
        Self::default()
            .base_url(base_url)
            .components_dir(components_dir)
            .host_version(host_version)
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|err| UpdaterError::filesystem(path, err))?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|err| {
            UpdaterError::InvalidConfig(format!("{}: {err}", path.display()))
        })?;
        let base_url = config.base_url.clone();
        Ok(config.base_url(base_url))
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn components_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.components_dir = dir.into();
        self
    }

    pub fn host_version(mut self, version: Version) -> Self {
        self.host_version = version;
        self
    }

    pub fn poll_interval_hours(mut self, hours: u64) -> Self {
        self.poll_interval_hours = hours;
        self
    }

    pub fn show_unstable(mut self, enabled: bool) -> Self {
        self.show_unstable = enabled;
        self
    }

    pub fn auto_install(mut self, enabled: bool) -> Self {
        self.auto_install = enabled;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.download_timeout_secs = secs;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_hours * 60 * 60)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// Reject values the manager cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(UpdaterError::InvalidConfig("base_url is required".into()));
        }
        if !POLL_INTERVAL_HOURS.contains(&self.poll_interval_hours) {
            return Err(UpdaterError::InvalidConfig(format!(
                "poll_interval_hours must be between {} and {}, got {}",
                POLL_INTERVAL_HOURS.start(),
                POLL_INTERVAL_HOURS.end(),
                self.poll_interval_hours
            )));
        }
        if self.request_timeout_secs == 0 || self.download_timeout_secs == 0 {
            return Err(UpdaterError::InvalidConfig("timeouts must be positive".into()));
        }
        Ok(())
    }
}
