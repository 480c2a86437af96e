//! Version resolution and atomic installation of repository-hosted components.
//!
//! A repository is a static directory served over HTTP(S): `repository.json`
//! lists the components it publishes and `<id>/custom.json` lists each
//! component's versions together with the host versions they support. This
//! crate parses those manifests, decides which version a host may run, and
//! installs release archives into the host's component directory under a
//! per-component lock, swapping the new tree in only once it is complete.
//!
//! ```ignore
//! use component_updater::{ComponentManager, ResolutionStatus, UpdaterConfig};
//!
//! # async fn demo() -> component_updater::Result<()> {
//! let config = UpdaterConfig::new(
//!     "https://example.com/components",
//!     "/config/custom_components",
//!     "2024.6.0".parse()?,
//! );
//! let manager = ComponentManager::new(config)?;
//!
//! for (id, name) in manager.list_components().await? {
//!     let resolution = manager.resolve(&id).await?;
//!     if resolution.status == ResolutionStatus::UpdateAvailable {
//!         let installed = manager.install(&id, None).await?;
//!         println!("{name} updated to {}", installed.version);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod archive;
mod config;
mod error;
mod fetcher;
mod filter;
mod installed;
mod installer;
mod lock;
mod manifest;
mod resolver;
mod service;
mod snapshot;
mod version;

#[cfg(test)]
mod testing;

pub use archive::{ArchiveEntry, EntryKind, ExtractSummary};
pub use config::{UpdaterConfig, POLL_INTERVAL_HOURS};
pub use error::{Result, UpdaterError};
pub use fetcher::{Fetcher, HttpFetcher, HttpFetcherBuilder, RepositoryClient};
pub use filter::filter;
pub use installed::{read_marker, InstallMarker, InstalledState, Inspector, INSTALL_MARKER};
pub use installer::{CancelToken, InstalledVersion, Installer, StagedInstall};
pub use lock::{InstallGuard, InstallLocks};
pub use manifest::{
    parse_component, parse_repository, validate_component_id, ComponentManifest, Repository,
    VersionEntry, COMPONENT_MANIFEST, REPOSITORY_INDEX,
};
pub use resolver::{resolve, ResolutionResult, ResolutionStatus};
pub use service::ComponentManager;
pub use snapshot::{RepositorySnapshot, SnapshotCell};
pub use version::{compare, is_stable, Channel, PreRelease, Version};
