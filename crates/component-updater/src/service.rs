use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::UpdaterConfig;
use crate::error::{Result, UpdaterError};
use crate::fetcher::{Fetcher, HttpFetcher, RepositoryClient};
use crate::filter::filter;
use crate::installed::{InstalledState, Inspector};
use crate::installer::{CancelToken, InstalledVersion, Installer};
use crate::manifest::ComponentManifest;
use crate::resolver::{resolve, ResolutionResult};
use crate::snapshot::{RepositorySnapshot, SnapshotCell};
use crate::version::Version;

/// Entry point for listing, resolving and installing components of one
/// repository on one host.
pub struct ComponentManager {
    config: UpdaterConfig,
    client: RepositoryClient,
    installer: Installer,
    snapshot: SnapshotCell,
}

impl ComponentManager {
    /// Build a manager that talks HTTP(S) to `config.base_url`.
    pub fn new(config: UpdaterConfig) -> Result<Self> {
        Self::with_fetcher(config, Arc::new(HttpFetcher::builder().build()))
    }

    pub fn with_fetcher(config: UpdaterConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        config.validate()?;
        let client =
            RepositoryClient::new(&config.base_url, fetcher.clone(), config.request_timeout())?;
        let installer = Installer::new(
            config.components_dir.clone(),
            fetcher,
            config.download_timeout(),
        );
        Ok(Self {
            config,
            client,
            installer,
            snapshot: SnapshotCell::new(),
        })
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    pub fn inspector(&self) -> &Inspector {
        self.installer.inspector()
    }

    /// Last snapshot published by [`ComponentManager::refresh`].
    pub fn snapshot(&self) -> Option<Arc<RepositorySnapshot>> {
        self.snapshot.load()
    }

    /// Fetch the repository and every manifest, then publish the result.
    pub async fn refresh(&self) -> Result<Arc<RepositorySnapshot>> {
        let snapshot = RepositorySnapshot::fetch(&self.client).await?;
        Ok(self.snapshot.publish(snapshot))
    }

    /// Component id to display name, exactly as the repository lists them.
    pub async fn list_components(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.client.fetch_repository().await?.customs)
    }

    /// Compatible versions of `component_id`, newest first.
    pub async fn list_versions(
        &self,
        component_id: &str,
        include_unstable: bool,
    ) -> Result<Vec<Version>> {
        let manifest = self.listed_manifest(component_id).await?;
        Ok(filter(&manifest.versions, &self.config.host_version, include_unstable))
    }

    /// Fetch the manifest and inspect the disk, then resolve.
    pub async fn resolve(&self, component_id: &str) -> Result<ResolutionResult> {
        let manifest = self.listed_manifest(component_id).await?;
        self.resolve_manifest(component_id, &manifest)
    }

    /// Resolve against an already fetched manifest. The installed state is
    /// always read fresh.
    pub fn resolve_manifest(
        &self,
        component_id: &str,
        manifest: &ComponentManifest,
    ) -> Result<ResolutionResult> {
        let installed = self.inspector().inspect(component_id)?;
        Ok(resolve(
            manifest,
            &installed,
            &self.config.host_version,
            self.config.show_unstable,
        ))
    }

    pub fn installed(&self, component_id: &str) -> Result<InstalledState> {
        self.inspector().inspect(component_id)
    }

    /// Install `version`, or the latest allowed version when `None`.
    pub async fn install(
        &self,
        component_id: &str,
        version: Option<Version>,
    ) -> Result<InstalledVersion> {
        self.install_with_cancel(component_id, version, &CancelToken::new())
            .await
    }

    pub async fn install_with_cancel(
        &self,
        component_id: &str,
        version: Option<Version>,
        cancel: &CancelToken,
    ) -> Result<InstalledVersion> {
        let manifest = self.listed_manifest(component_id).await?;
        let host = &self.config.host_version;

        let target = match version {
            Some(requested) => {
                // Any listed channel may be requested explicitly.
                if !filter(&manifest.versions, host, true).contains(&requested) {
                    return Err(UpdaterError::VersionUnavailable {
                        component: component_id.to_string(),
                        version: requested,
                    });
                }
                requested
            }
            None => filter(&manifest.versions, host, self.config.show_unstable)
                .into_iter()
                .next()
                .ok_or_else(|| UpdaterError::NoCompatibleVersion(component_id.to_string()))?,
        };
        let entry = manifest
            .entry(&target)
            .ok_or_else(|| UpdaterError::VersionUnavailable {
                component: component_id.to_string(),
                version: target.clone(),
            })?;

        // The installer checks the new marker before it releases the lock.
        let installed = self
            .installer
            .install_with_cancel(component_id, &target, entry, cancel)
            .await?;
        info!(target: "updater", component = component_id, version = %target, "install verified");
        Ok(installed)
    }

    /// Changelog text for `component_id`, if it publishes one.
    pub async fn release_notes(&self, component_id: &str) -> Option<String> {
        let manifest = match self.client.fetch_component(component_id).await {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(
                    target: "updater",
                    component = component_id,
                    error = %err,
                    "cannot load release notes"
                );
                return None;
            }
        };
        let url = manifest.changelog_url?;
        match self.client.fetch_text(&url).await {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(
                    target: "updater",
                    component = component_id,
                    %url,
                    error = %err,
                    "cannot load release notes"
                );
                None
            }
        }
    }

    async fn listed_manifest(&self, component_id: &str) -> Result<ComponentManifest> {
        let repository = self.client.fetch_repository().await?;
        if !repository.contains(component_id) {
            return Err(UpdaterError::UnknownComponent(component_id.to_string()));
        }
        self.client.fetch_component(component_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolutionStatus;
    use crate::testing::{zip_archive, MockFetcher};
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    const BASE: &str = "https://example.com/repo";

    fn setup(versions: serde_json::Value) -> (TempDir, Arc<MockFetcher>, ComponentManager) {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.insert_json(
            &format!("{BASE}/repository.json"),
            json!({"name": "Repo", "customs": {"demo": "Demo component"}}),
        );
        fetcher.insert_json(
            &format!("{BASE}/demo/custom.json"),
            json!({
                "name": "Demo",
                "changelog": "https://example.com/demo/CHANGELOG.md",
                "versions": versions
            }),
        );
        for version in ["1.0.0", "1.1.0", "2.0.0-beta.1"] {
            fetcher.insert(
                &format!("https://example.com/demo-{version}.zip"),
                zip_archive(&[("demo/", ""), ("demo/__init__.py", version)]),
            );
        }

        let dir = tempdir().unwrap();
        let config = UpdaterConfig::new(BASE, dir.path(), "2024.6.0".parse().unwrap());
        let manager = ComponentManager::with_fetcher(config, fetcher.clone()).unwrap();
        (dir, fetcher, manager)
    }

    fn version(v: &str, ha_min: &str) -> serde_json::Value {
        json!({"ha_min": ha_min, "release_file": format!("https://example.com/demo-{v}.zip")})
    }

    fn standard() -> serde_json::Value {
        json!({
            "1.0.0": version("1.0.0", "2024.1.0"),
            "1.1.0": version("1.1.0", "2024.1.0"),
            "2.0.0-beta.1": version("2.0.0-beta.1", "2024.1.0"),
        })
    }

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn lists_versions_by_channel() {
        let (_dir, _fetcher, manager) = setup(standard());
        assert_eq!(
            manager.list_versions("demo", false).await.unwrap(),
            vec![v("1.1.0"), v("1.0.0")]
        );
        assert_eq!(
            manager.list_versions("demo", true).await.unwrap(),
            vec![v("2.0.0-beta.1"), v("1.1.0"), v("1.0.0")]
        );
        assert!(matches!(
            manager.list_versions("other", false).await,
            Err(UpdaterError::UnknownComponent(_))
        ));
    }

    #[tokio::test]
    async fn install_latest_then_resolve_up_to_date() {
        let (dir, _fetcher, manager) = setup(standard());
        assert_eq!(
            manager.resolve("demo").await.unwrap().status,
            ResolutionStatus::NotInstalled
        );

        let installed = manager.install("demo", None).await.unwrap();
        assert_eq!(installed.version, v("1.1.0"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("demo/__init__.py")).unwrap(),
            "1.1.0"
        );
        assert_eq!(
            manager.resolve("demo").await.unwrap().status,
            ResolutionStatus::UpToDate
        );
    }

    #[tokio::test]
    async fn explicit_version_may_be_unstable_but_must_be_listed() {
        let (_dir, _fetcher, manager) = setup(standard());
        let installed = manager.install("demo", Some(v("2.0.0-beta.1"))).await.unwrap();
        assert_eq!(installed.version, v("2.0.0-beta.1"));

        let (_dir, fetcher, manager) = setup(standard());
        let err = manager.install("demo", Some(v("3.0.0"))).await.unwrap_err();
        assert!(matches!(err, UpdaterError::VersionUnavailable { .. }), "got {err:?}");
        // Only the two manifests were requested; nothing was downloaded.
        assert_eq!(fetcher.requests(), 2);
    }

    #[tokio::test]
    async fn nothing_compatible_is_reported() {
        let (_dir, _fetcher, manager) = setup(json!({"1.0.0": version("1.0.0", "2030.1.0")}));
        assert_eq!(
            manager.resolve("demo").await.unwrap().status,
            ResolutionStatus::NoCompatibleVersion
        );
        assert!(matches!(
            manager.install("demo", None).await,
            Err(UpdaterError::NoCompatibleVersion(_))
        ));
    }

    #[tokio::test]
    async fn release_notes_fall_back_to_none() {
        let (_dir, fetcher, manager) = setup(standard());
        assert_eq!(manager.release_notes("demo").await, None);

        let changelog = "https://example.com/demo/CHANGELOG.md";
        fetcher.insert(changelog, b"## 1.1.0\n- fixes".to_vec());
        assert_eq!(
            manager.release_notes("demo").await.as_deref(),
            Some("## 1.1.0\n- fixes")
        );

        fetcher.remove(&format!("{BASE}/demo/custom.json"));
        assert_eq!(manager.release_notes("demo").await, None);
    }

    #[tokio::test]
    async fn refresh_publishes_snapshot() {
        let (_dir, _fetcher, manager) = setup(standard());
        assert!(manager.snapshot().is_none());
        let snapshot = manager.refresh().await.unwrap();
        let manifest = snapshot.manifest("demo").unwrap();
        let result = manager.resolve_manifest("demo", manifest).unwrap();
        assert_eq!(result.latest_allowed_version, Some(v("1.1.0")));
        assert!(manager.snapshot().is_some());
    }
}
