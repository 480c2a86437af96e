use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::task;
use tracing::{debug, info, warn};

use crate::archive::{self, ExtractSummary};
use crate::error::{Result, UpdaterError};
use crate::fetcher::Fetcher;
use crate::installed::{read_marker, InstallMarker, Inspector, INSTALL_MARKER};
use crate::lock::{InstallGuard, InstallLocks};
use crate::manifest::{validate_component_id, VersionEntry};
use crate::version::Version;

/// Cooperative cancellation for an install.
///
/// Checked before extraction and again before the directory swap. Once the
/// swap has started the install runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A completed install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledVersion {
    pub component_id: String,
    pub version: Version,
    pub path: PathBuf,
    pub archive_sha256: String,
    pub files: usize,
}

/// Downloads release archives and swaps them into the components directory.
#[derive(Clone)]
pub struct Installer {
    inspector: Inspector,
    fetcher: Arc<dyn Fetcher>,
    locks: InstallLocks,
    download_timeout: Duration,
}

impl Installer {
    pub fn new(
        components_dir: impl Into<PathBuf>,
        fetcher: Arc<dyn Fetcher>,
        download_timeout: Duration,
    ) -> Self {
        Self {
            inspector: Inspector::new(components_dir),
            fetcher,
            locks: InstallLocks::new(),
            download_timeout,
        }
    }

    pub fn inspector(&self) -> &Inspector {
        &self.inspector
    }

    pub fn locks(&self) -> &InstallLocks {
        &self.locks
    }

    /// Install `version` of `component_id` from `entry.release_file`.
    pub async fn install(
        &self,
        component_id: &str,
        version: &Version,
        entry: &VersionEntry,
    ) -> Result<InstalledVersion> {
        self.install_with_cancel(component_id, version, entry, &CancelToken::new())
            .await
    }

    pub async fn install_with_cancel(
        &self,
        component_id: &str,
        version: &Version,
        entry: &VersionEntry,
        cancel: &CancelToken,
    ) -> Result<InstalledVersion> {
        let staged = self.prepare(component_id, version, entry, cancel).await?;
        staged.commit(cancel).await
    }

    /// Lock, download and extract into a staging directory without touching the
    /// live component. Dropping the returned [`StagedInstall`] discards the
    /// staging directory and releases the lock.
    pub async fn prepare(
        &self,
        component_id: &str,
        version: &Version,
        entry: &VersionEntry,
        cancel: &CancelToken,
    ) -> Result<StagedInstall> {
        validate_component_id(component_id)?;
        let guard = self.locks.try_acquire(component_id)?;

        info!(
            target: "updater",
            component = component_id,
            version = %version,
            url = %entry.release_file,
            "downloading release archive"
        );
        let bytes = self
            .fetcher
            .fetch_bytes(&entry.release_file, self.download_timeout)
            .await
            .map_err(|err| {
                warn!(
                    target: "updater",
                    component = component_id,
                    error = %err,
                    "download failed"
                );
                UpdaterError::DownloadFailed {
                    component: component_id.to_string(),
                    reason: err.to_string(),
                }
            })?;
        let archive_sha256 = hex::encode(Sha256::digest(&bytes));
        debug!(
            target: "updater",
            component = component_id,
            size = bytes.len(),
            sha256 = %archive_sha256,
            "archive downloaded"
        );

        if cancel.is_cancelled() {
            return Err(UpdaterError::Cancelled(component_id.to_string()));
        }

        let components_dir = self.inspector.components_dir().to_path_buf();
        let live = self.inspector.component_dir(component_id);
        let marker = InstallMarker {
            component: component_id.to_string(),
            version: version.clone(),
            release_file: entry.release_file.to_string(),
            archive_sha256,
            installed_at: unix_now(),
        };

        // The guard travels with the blocking work so the lock outlives a
        // dropped caller future.
        task::spawn_blocking(move || stage(guard, bytes, marker, &components_dir, live))
            .await
            .map_err(|err| UpdaterError::Other(format!("task join error: {err}")))?
    }
}

/// An extracted, not yet committed install. Holds the component lock.
pub struct StagedInstall {
    guard: InstallGuard,
    staging: TempDir,
    live: PathBuf,
    marker: InstallMarker,
    summary: ExtractSummary,
}

impl StagedInstall {
    pub fn component_id(&self) -> &str {
        self.guard.component_id()
    }

    pub fn version(&self) -> &Version {
        &self.marker.version
    }

    pub fn staging_path(&self) -> &Path {
        self.staging.path()
    }

    /// Swap the staged tree into place and check the marker it reports, both
    /// under the component lock.
    pub async fn commit(self, cancel: &CancelToken) -> Result<InstalledVersion> {
        if cancel.is_cancelled() {
            info!(
                target: "updater",
                component = self.component_id(),
                "install cancelled before swap"
            );
            return Err(UpdaterError::Cancelled(self.component_id().to_string()));
        }

        task::spawn_blocking(move || self.swap())
            .await
            .map_err(|err| UpdaterError::Other(format!("task join error: {err}")))?
    }

    fn swap(self) -> Result<InstalledVersion> {
        let StagedInstall {
            guard,
            staging,
            live,
            marker,
            summary,
        } = self;
        let component_id = guard.component_id().to_string();

        let backup = backup_path(&live, &component_id);
        recover_interrupted_swap(&live, &backup)?;
        remove_if_exists(&backup)?;

        let had_live = live.exists();
        if had_live {
            fs::rename(&live, &backup).map_err(|err| UpdaterError::filesystem(&live, err))?;
        }

        if let Err(err) = fs::rename(staging.path(), &live) {
            if had_live {
                if let Err(restore) = fs::rename(&backup, &live) {
                    warn!(
                        target: "updater",
                        component = %component_id,
                        backup = %backup.display(),
                        error = %restore,
                        "failed to restore previous install"
                    );
                }
            }
            return Err(UpdaterError::filesystem(&live, err));
        }

        if had_live {
            if let Err(err) = fs::remove_dir_all(&backup) {
                warn!(
                    target: "updater",
                    component = %component_id,
                    path = %backup.display(),
                    error = %err,
                    "failed to remove previous install"
                );
            }
        }

        verify(&component_id, &live, &marker.version)?;
        info!(
            target: "updater",
            component = %component_id,
            version = %marker.version,
            files = summary.files,
            "component installed"
        );
        drop(guard);

        Ok(InstalledVersion {
            component_id,
            version: marker.version,
            path: live,
            archive_sha256: marker.archive_sha256,
            files: summary.files,
        })
    }
}

fn stage(
    guard: InstallGuard,
    bytes: Vec<u8>,
    mut marker: InstallMarker,
    components_dir: &Path,
    live: PathBuf,
) -> Result<StagedInstall> {
    let component_id = guard.component_id().to_string();
    archive::plan(&component_id, &bytes)?;
    recover_interrupted_swap(&live, &backup_path(&live, &component_id))?;

    fs::create_dir_all(components_dir)
        .map_err(|err| UpdaterError::filesystem(components_dir, err))?;
    let staging = tempfile::Builder::new()
        .prefix(&format!(".{component_id}.staging-"))
        .tempdir_in(components_dir)
        .map_err(|err| UpdaterError::filesystem(components_dir, err))?;

    let summary = archive::extract(&component_id, &bytes, staging.path())?;

    // Reinstalling the same archive keeps the original timestamp.
    if let Some(previous) = read_marker(&live)? {
        if previous.component == marker.component
            && previous.version == marker.version
            && previous.archive_sha256 == marker.archive_sha256
        {
            marker.installed_at = previous.installed_at;
        }
    }

    let marker_path = staging.path().join(INSTALL_MARKER);
    let encoded = serde_json::to_vec_pretty(&marker)
        .map_err(|err| UpdaterError::Other(format!("encoding install marker: {err}")))?;
    fs::write(&marker_path, encoded)
        .map_err(|err| UpdaterError::filesystem(&marker_path, err))?;

    debug!(
        target: "updater",
        component = %component_id,
        staging = %staging.path().display(),
        files = summary.files,
        "archive staged"
    );

    Ok(StagedInstall {
        guard,
        staging,
        live,
        marker,
        summary,
    })
}

fn backup_path(live: &Path, component_id: &str) -> PathBuf {
    live.with_file_name(format!(".{component_id}.previous"))
}

/// A backup with no live directory means a swap died between its two renames.
/// Put the previous install back before anything touches the backup.
fn recover_interrupted_swap(live: &Path, backup: &Path) -> Result<()> {
    if live.exists() || !backup.is_dir() {
        return Ok(());
    }
    warn!(
        target: "updater",
        path = %live.display(),
        backup = %backup.display(),
        "restoring install left behind by an interrupted swap"
    );
    fs::rename(backup, live).map_err(|err| UpdaterError::filesystem(live, err))
}

/// The marker now live must report the version that was staged.
fn verify(component_id: &str, live: &Path, expected: &Version) -> Result<()> {
    let found = read_marker(live)?
        .filter(|marker| marker.component == component_id)
        .map(|marker| marker.version);
    if found.as_ref() == Some(expected) {
        return Ok(());
    }
    warn!(
        target: "updater",
        component = component_id,
        expected = %expected,
        found = ?found.as_ref().map(ToString::to_string),
        "installed version does not match"
    );
    Err(UpdaterError::VerificationFailed {
        component: component_id.to_string(),
        expected: expected.clone(),
        found,
    })
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(UpdaterError::filesystem(path, err)),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
