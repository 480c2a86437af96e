//! Read-only inspection of the host's component directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, UpdaterError};
use crate::version::Version;

/// Marker written by the installer inside every managed component directory.
pub const INSTALL_MARKER: &str = ".component-version.json";

/// Contents of [`INSTALL_MARKER`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallMarker {
    pub component: String,
    pub version: Version,
    pub release_file: String,
    /// Hex SHA-256 of the archive the directory was extracted from.
    pub archive_sha256: String,
    /// Unix timestamp (seconds) of the swap.
    pub installed_at: u64,
}

/// What is on disk for one component right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledState {
    pub component_id: String,
    pub installed_version: Option<Version>,
    /// The directory exists, whether or not it carries a marker.
    pub present: bool,
}

impl InstalledState {
    /// Present on disk but not installed by this manager.
    pub fn is_unmanaged(&self) -> bool {
        self.present && self.installed_version.is_none()
    }
}

/// Reads installed versions from `<components_dir>/<id>/.component-version.json`.
#[derive(Debug, Clone)]
pub struct Inspector {
    components_dir: PathBuf,
}

impl Inspector {
    pub fn new(components_dir: impl Into<PathBuf>) -> Self {
        Self {
            components_dir: components_dir.into(),
        }
    }

    pub fn components_dir(&self) -> &Path {
        &self.components_dir
    }

    pub fn component_dir(&self, component_id: &str) -> PathBuf {
        self.components_dir.join(component_id)
    }

    /// Determine the installed version of `component_id`.
    ///
    /// A missing directory is not an error. A directory whose marker is missing,
    /// unreadable or written for another component is reported as unmanaged.
    pub fn inspect(&self, component_id: &str) -> Result<InstalledState> {
        let dir = self.component_dir(component_id);
        if !dir.is_dir() {
            debug!(target: "updater", component = component_id, "component is not installed");
            return Ok(InstalledState {
                component_id: component_id.to_string(),
                installed_version: None,
                present: false,
            });
        }

        let installed_version = match read_marker(&dir)? {
            Some(marker) if marker.component == component_id => Some(marker.version),
            Some(marker) => {
                warn!(
                    target: "updater",
                    component = component_id,
                    marker_component = %marker.component,
                    "install marker belongs to another component; treating as unmanaged"
                );
                None
            }
            None => None,
        };

        Ok(InstalledState {
            component_id: component_id.to_string(),
            installed_version,
            present: true,
        })
    }
}

/// Read the marker from a component directory. `Ok(None)` when absent or corrupt.
pub fn read_marker(dir: &Path) -> Result<Option<InstallMarker>> {
    let path = dir.join(INSTALL_MARKER);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(UpdaterError::filesystem(path, err)),
    };

    match serde_json::from_slice(&bytes) {
        Ok(marker) => Ok(Some(marker)),
        Err(err) => {
            warn!(
                target: "updater",
                path = %path.display(),
                error = %err,
                "ignoring unreadable install marker"
            );
            Ok(None)
        }
    }
}
