//! Host compatibility and channel filtering of published versions.

use std::collections::BTreeMap;

use crate::manifest::VersionEntry;
use crate::version::Version;

/// Versions installable on `host`, newest first.
///
/// A version is kept when it is stable (or `allow_unstable` is set) and `host`
/// lies inside its inclusive `[ha_min, ha_max]` range. An empty result is a
/// normal outcome meaning nothing is compatible.
pub fn filter(
    versions: &BTreeMap<Version, VersionEntry>,
    host: &Version,
    allow_unstable: bool,
) -> Vec<Version> {
    versions
        .iter()
        .rev()
        .filter(|(version, _)| allow_unstable || version.is_stable())
        .filter(|(_, entry)| entry.supports_host(host))
        .map(|(version, _)| version.clone())
        .collect()
}
