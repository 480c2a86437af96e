use std::cmp::Ordering;

use serde::Serialize;

use crate::filter::filter;
use crate::installed::InstalledState;
use crate::manifest::ComponentManifest;
use crate::version::Version;

/// Outcome of comparing what is installed against what may be installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResolutionStatus {
    UpToDate,
    UpdateAvailable,
    NotInstalled,
    /// Informational: nothing published is compatible with this host.
    NoCompatibleVersion,
}

/// Resolution for one component. Recomputed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionResult {
    pub component_id: String,
    pub installed_version: Option<Version>,
    pub latest_allowed_version: Option<Version>,
    pub status: ResolutionStatus,
}

/// Decide the status of a component.
///
/// An installed version newer than everything currently allowed resolves to
/// [`ResolutionStatus::UpToDate`]: the resolver never proposes a downgrade.
pub fn resolve(
    manifest: &ComponentManifest,
    installed: &InstalledState,
    host: &Version,
    allow_unstable: bool,
) -> ResolutionResult {
    let latest = filter(&manifest.versions, host, allow_unstable)
        .into_iter()
        .next();

    let status = match (&latest, &installed.installed_version) {
        (None, _) => ResolutionStatus::NoCompatibleVersion,
        (Some(_), None) => ResolutionStatus::NotInstalled,
        (Some(latest), Some(current)) => match current.cmp(latest) {
            Ordering::Less => ResolutionStatus::UpdateAvailable,
            Ordering::Equal | Ordering::Greater => ResolutionStatus::UpToDate,
        },
    };

    ResolutionResult {
        component_id: installed.component_id.clone(),
        installed_version: installed.installed_version.clone(),
        latest_allowed_version: latest,
        status,
    }
}
