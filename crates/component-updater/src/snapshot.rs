use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::Result;
use crate::fetcher::RepositoryClient;
use crate::manifest::{ComponentManifest, Repository};

/// Repository index plus every component manifest, fetched together.
#[derive(Debug, Clone)]
pub struct RepositorySnapshot {
    pub repository: Repository,
    pub manifests: BTreeMap<String, ComponentManifest>,
    /// Components whose manifest could not be fetched or parsed.
    pub failures: BTreeMap<String, String>,
    pub fetched_at: SystemTime,
}

impl RepositorySnapshot {
    /// Fetch the index, then all listed manifests concurrently.
    ///
    /// A failing index fails the snapshot. A failing manifest is recorded in
    /// [`RepositorySnapshot::failures`] and leaves the other components usable.
    pub async fn fetch(client: &RepositoryClient) -> Result<Self> {
        let repository = client.fetch_repository().await?;

        let ids: Vec<String> = repository.customs.keys().cloned().collect();
        let results = join_all(ids.iter().map(|id| client.fetch_component(id))).await;

        let mut manifests = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(manifest) => {
                    manifests.insert(id, manifest);
                }
                Err(err) => {
                    warn!(
                        target: "updater",
                        component = %id,
                        error = %err,
                        "component manifest unavailable"
                    );
                    failures.insert(id, err.to_string());
                }
            }
        }

        info!(
            target: "updater",
            repository = %repository.name,
            components = manifests.len(),
            failed = failures.len(),
            "repository snapshot fetched"
        );

        Ok(Self {
            repository,
            manifests,
            failures,
            fetched_at: SystemTime::now(),
        })
    }

    pub fn manifest(&self, component_id: &str) -> Option<&ComponentManifest> {
        self.manifests.get(component_id)
    }
}

/// Holder for the latest published snapshot.
///
/// Publishing replaces the whole `Arc`; readers clone it and never observe a
/// partially updated snapshot.
#[derive(Debug, Default)]
pub struct SnapshotCell {
    current: RwLock<Option<Arc<RepositorySnapshot>>>,
}

impl SnapshotCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Option<Arc<RepositorySnapshot>> {
        self.current.read().clone()
    }

    pub fn publish(&self, snapshot: RepositorySnapshot) -> Arc<RepositorySnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write() = Some(snapshot.clone());
        snapshot
    }
}
