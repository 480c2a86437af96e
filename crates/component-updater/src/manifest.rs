use std::collections::BTreeMap;

use reqwest::Url;
use serde::Deserialize;
use tracing::warn;

use crate::error::{Result, UpdaterError};
use crate::version::Version;

/// File name of the repository index, relative to the base URL.
pub const REPOSITORY_INDEX: &str = "repository.json";
/// File name of a component manifest, relative to `<base_url>/<component>/`.
pub const COMPONENT_MANIFEST: &str = "custom.json";

/// Repository index listing the components it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub name: String,
    pub description: Option<String>,
    pub homepage: Option<Url>,
    /// Component id to display name.
    pub customs: BTreeMap<String, String>,
}

impl Repository {
    pub fn contains(&self, component: &str) -> bool {
        self.customs.contains_key(component)
    }

    pub fn display_name(&self, component: &str) -> Option<&str> {
        self.customs.get(component).map(String::as_str)
    }
}

/// Metadata for one published version of a component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    /// Lowest host version supported (inclusive).
    pub ha_min: Version,
    /// Highest host version supported (inclusive), unbounded when absent.
    pub ha_max: Option<Version>,
    /// Location of the zip archive.
    pub release_file: Url,
    pub homepage: Option<Url>,
}

impl VersionEntry {
    /// Whether `host` lies inside `[ha_min, ha_max]`.
    pub fn supports_host(&self, host: &Version) -> bool {
        *host >= self.ha_min && self.ha_max.as_ref().map_or(true, |max| host <= max)
    }

    /// Best link for "learn more" style references: homepage, else the archive.
    pub fn learn_more_url(&self) -> &Url {
        self.homepage.as_ref().unwrap_or(&self.release_file)
    }
}

/// Per-component manifest listing its available versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentManifest {
    pub name: String,
    pub description: Option<String>,
    pub homepage: Option<Url>,
    pub changelog_url: Option<Url>,
    pub versions: BTreeMap<Version, VersionEntry>,
}

impl ComponentManifest {
    pub fn entry(&self, version: &Version) -> Option<&VersionEntry> {
        self.versions.get(version)
    }
}

#[derive(Deserialize)]
struct RawRepository {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    homepage: Option<String>,
    customs: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RawComponent {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    homepage: Option<String>,
    #[serde(default)]
    changelog: Option<String>,
    versions: BTreeMap<String, RawVersionEntry>,
}

#[derive(Deserialize)]
struct RawVersionEntry {
    ha_min: String,
    #[serde(default)]
    ha_max: Option<String>,
    release_file: String,
    #[serde(default)]
    homepage: Option<String>,
}

/// Parse a repository index (`repository.json`).
pub fn parse_repository(bytes: &[u8]) -> Result<Repository> {
    let raw: RawRepository = serde_json::from_slice(bytes)
        .map_err(|err| UpdaterError::malformed(format!("repository index: {err}")))?;

    for id in raw.customs.keys() {
        validate_component_id(id)?;
    }

    Ok(Repository {
        name: raw.name,
        description: raw.description,
        homepage: parse_optional_url("homepage", raw.homepage)?,
        customs: raw.customs,
    })
}

/// Parse a component manifest (`<component>/custom.json`).
///
/// Entries whose `ha_max` is below `ha_min` are dropped with a warning; every
/// other violation rejects the whole manifest.
pub fn parse_component(bytes: &[u8]) -> Result<ComponentManifest> {
    let raw: RawComponent = serde_json::from_slice(bytes)
        .map_err(|err| UpdaterError::malformed(format!("component manifest: {err}")))?;

    let mut versions = BTreeMap::new();
    for (key, entry) in raw.versions {
        let version = Version::parse(&key)
            .map_err(|err| UpdaterError::malformed(format!("version key: {err}")))?;
        let ha_min = parse_field_version(&key, "ha_min", &entry.ha_min)?;
        let ha_max = entry
            .ha_max
            .as_deref()
            .map(|raw| parse_field_version(&key, "ha_max", raw))
            .transpose()?;
        let release_file = parse_url(&format!("{key}.release_file"), &entry.release_file)?;
        let homepage = parse_optional_url(&format!("{key}.homepage"), entry.homepage)?;

        if let Some(max) = &ha_max {
            if *max < ha_min {
                warn!(
                    target: "updater",
                    component = %raw.name,
                    version = %version,
                    ha_min = %ha_min,
                    ha_max = %max,
                    "dropping version entry with inverted compatibility range"
                );
                continue;
            }
        }

        versions.insert(
            version,
            VersionEntry {
                ha_min,
                ha_max,
                release_file,
                homepage,
            },
        );
    }

    Ok(ComponentManifest {
        name: raw.name,
        description: raw.description,
        homepage: parse_optional_url("homepage", raw.homepage)?,
        changelog_url: parse_optional_url("changelog", raw.changelog)?,
        versions,
    })
}

/// Component ids double as directory names under the components directory.
pub fn validate_component_id(id: &str) -> Result<()> {
    let reason = if id.is_empty() {
        Some("empty id")
    } else if id.starts_with('.') {
        Some("id must not start with '.'")
    } else if id.contains(|c: char| matches!(c, '/' | '\\' | ':') || c.is_control()) {
        Some("id must be a single path segment")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(UpdaterError::malformed(format!(
            "component id '{id}': {reason}"
        ))),
        None => Ok(()),
    }
}

fn parse_field_version(key: &str, field: &str, raw: &str) -> Result<Version> {
    Version::parse(raw).map_err(|err| UpdaterError::malformed(format!("{key}.{field}: {err}")))
}

fn parse_url(field: &str, raw: &str) -> Result<Url> {
    Url::parse(raw)
        .map_err(|err| UpdaterError::malformed(format!("{field}: invalid URL '{raw}': {err}")))
}

fn parse_optional_url(field: &str, raw: Option<String>) -> Result<Option<Url>> {
    raw.map(|raw| parse_url(field, &raw)).transpose()
}
