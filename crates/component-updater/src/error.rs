use std::path::PathBuf;

use crate::version::Version;

/// Convenient result alias for updater operations.
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Errors that can occur while resolving or installing components.
#[derive(thiserror::Error, Debug)]
pub enum UpdaterError {
    /// Manifest request failed at the transport or HTTP-status level.
    #[error("failed to fetch {url}: {reason}")]
    Fetch {
        /// Requested URL.
        url: String,
        /// Transport error, timeout or status description.
        reason: String,
    },
    /// A manifest did not match the expected schema or version grammar.
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),
    /// A version identifier did not match `MAJOR.MINOR.PATCH[-(alpha|beta|rc).N]`.
    #[error("invalid version '{version}': {reason}")]
    InvalidVersion {
        /// The rejected input.
        version: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The repository does not list the component.
    #[error("component '{0}' is not listed in the repository")]
    UnknownComponent(String),
    /// No version of the component is compatible with the host.
    #[error("no compatible version of '{0}' for this host")]
    NoCompatibleVersion(String),
    /// The requested version is not among the compatible versions.
    #[error("version {version} is not available for '{component}'")]
    VersionUnavailable {
        /// Component id.
        component: String,
        /// Requested version.
        version: Version,
    },
    /// Another install of the same component holds the lock.
    #[error("an install of '{0}' is already in progress")]
    InstallInProgress(String),
    /// The release archive could not be downloaded.
    #[error("download of '{component}' failed: {reason}")]
    DownloadFailed {
        /// Component id.
        component: String,
        /// Underlying failure.
        reason: String,
    },
    /// The release archive is not a valid zip or contains unsafe entries.
    #[error("invalid archive for '{component}': {reason}")]
    InvalidArchive {
        /// Component id.
        component: String,
        /// What was wrong with the archive.
        reason: String,
    },
    /// Extraction, marker write or directory swap failed.
    #[error("filesystem operation failed at {path}: {source}")]
    Filesystem {
        /// Path the operation was acting on.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The install was cancelled before the directory swap.
    #[error("install of '{0}' was cancelled")]
    Cancelled(String),
    /// The component on disk does not report the version that was just installed.
    #[error("'{component}' reports {found:?} after installing {expected}")]
    VerificationFailed {
        /// Component id.
        component: String,
        /// Version that should be on disk.
        expected: Version,
        /// Version actually reported by the install marker.
        found: Option<Version>,
    },
    /// Configuration values are out of range or unreadable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl UpdaterError {
    /// Helper for wrapping I/O failures with the path they happened at.
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        UpdaterError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Helper for wrapping manifest validation failures.
    pub fn malformed(msg: impl Into<String>) -> Self {
        UpdaterError::MalformedManifest(msg.into())
    }

    /// Whether this error is a fetch-side failure (transport or manifest content).
    pub fn is_fetch_failure(&self) -> bool {
        matches!(
            self,
            UpdaterError::Fetch { .. } | UpdaterError::MalformedManifest(_)
        )
    }
}
