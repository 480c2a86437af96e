use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use component_updater::{
    ComponentManager, InstalledVersion, RepositorySnapshot, ResolutionResult, ResolutionStatus,
    UpdaterError, Version,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Per-component lifecycle as seen by the controller.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ComponentState {
    /// Not resolved yet, or its manifest could not be loaded.
    Unknown,
    UpToDate,
    UpdateAvailable,
    NotInstalled,
    NoCompatibleVersion,
    Installing,
    /// The last install failed. Only a successful manual install clears it.
    Error,
}

impl From<ResolutionStatus> for ComponentState {
    fn from(status: ResolutionStatus) -> Self {
        match status {
            ResolutionStatus::UpToDate => ComponentState::UpToDate,
            ResolutionStatus::UpdateAvailable => ComponentState::UpdateAvailable,
            ResolutionStatus::NotInstalled => ComponentState::NotInstalled,
            ResolutionStatus::NoCompatibleVersion => ComponentState::NoCompatibleVersion,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ComponentStatus {
    pub component_id: String,
    pub display_name: String,
    pub state: ComponentState,
    pub installed: Option<Version>,
    pub latest: Option<Version>,
    pub last_error: Option<String>,
    /// A new version is on disk and the host must reload it.
    pub restart_required: bool,
}

impl ComponentStatus {
    fn new(component_id: &str, display_name: &str) -> Self {
        Self {
            component_id: component_id.to_string(),
            display_name: display_name.to_string(),
            state: ComponentState::Unknown,
            installed: None,
            latest: None,
            last_error: None,
            restart_required: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ControllerPhase {
    Starting,
    Idle,
    Polling,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub phase: ControllerPhase,
    pub components: BTreeMap<String, ComponentStatus>,
    pub last_poll: Option<SystemTime>,
    /// Repository-level failure from the most recent poll.
    pub last_error: Option<String>,
}

impl Default for ControllerStatus {
    fn default() -> Self {
        Self {
            phase: ControllerPhase::Starting,
            components: BTreeMap::new(),
            last_poll: None,
            last_error: None,
        }
    }
}

impl ControllerStatus {
    pub fn component(&self, component_id: &str) -> Option<&ComponentStatus> {
        self.components.get(component_id)
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("update controller is offline")]
    Offline,
    #[error("failed to send command to update controller")]
    ChannelClosed,
    #[error(transparent)]
    Updater(#[from] UpdaterError),
    /// The repository poll a refresh waited on failed. Shared by every waiter.
    #[error("repository poll failed: {0}")]
    Poll(Arc<UpdaterError>),
    #[error("controller task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

type InstallReply = oneshot::Sender<ControllerResult<InstalledVersion>>;

#[derive(Debug)]
enum ControllerCommand {
    Refresh(oneshot::Sender<ControllerResult<()>>),
    Install {
        component_id: String,
        version: Option<Version>,
        reply: InstallReply,
    },
    PollFinished(Result<Arc<RepositorySnapshot>, UpdaterError>),
    InstallFinished {
        component_id: String,
        manual: bool,
        previous: ComponentState,
        result: Result<InstalledVersion, UpdaterError>,
        reply: Option<InstallReply>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Narrow view of the controller for the host's update surface.
#[async_trait]
pub trait UpdateEntity: Send + Sync {
    /// Current status of one component, if the repository lists it.
    fn component_status(&self, component_id: &str) -> Option<ComponentStatus>;

    /// Install `version`, or the latest allowed one, and wait for the outcome.
    async fn request_install(
        &self,
        component_id: &str,
        version: Option<Version>,
    ) -> ControllerResult<InstalledVersion>;
}

#[derive(Clone)]
pub struct UpdateControllerHandle {
    cmd_tx: mpsc::Sender<ControllerCommand>,
    status_rx: watch::Receiver<ControllerStatus>,
}

impl UpdateControllerHandle {
    /// Poll the repository now and wait until statuses reflect it.
    pub async fn refresh(&self) -> ControllerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ControllerCommand::Refresh(tx))
            .await
            .map_err(|_| ControllerError::ChannelClosed)?;
        rx.await.map_err(|_| ControllerError::Offline)?
    }

    pub async fn install(
        &self,
        component_id: &str,
        version: Option<Version>,
    ) -> ControllerResult<InstalledVersion> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ControllerCommand::Install {
                component_id: component_id.to_string(),
                version,
                reply: tx,
            })
            .await
            .map_err(|_| ControllerError::ChannelClosed)?;
        rx.await.map_err(|_| ControllerError::Offline)?
    }

    pub async fn shutdown(&self) -> ControllerResult<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ControllerCommand::Shutdown(tx))
            .await
            .map_err(|_| ControllerError::ChannelClosed)?;
        rx.await.map_err(|_| ControllerError::Offline)
    }

    pub fn status(&self) -> ControllerStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.status_rx.clone()
    }
}

#[async_trait]
impl UpdateEntity for UpdateControllerHandle {
    fn component_status(&self, component_id: &str) -> Option<ComponentStatus> {
        self.status_rx.borrow().component(component_id).cloned()
    }

    async fn request_install(
        &self,
        component_id: &str,
        version: Option<Version>,
    ) -> ControllerResult<InstalledVersion> {
        self.install(component_id, version).await
    }
}

/// Owns the runtime task that polls the repository and runs installs.
pub struct UpdateController {
    handle: UpdateControllerHandle,
    task: JoinHandle<()>,
}

impl UpdateController {
    /// Start the runtime. The timer first fires one poll interval from now;
    /// call [`UpdateControllerHandle::refresh`] for an initial poll.
    pub fn launch(manager: Arc<ComponentManager>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(ControllerStatus::default());

        let runtime = ControllerRuntime::new(manager, status_tx, cmd_tx.clone());
        let task = tokio::spawn(runtime.run(cmd_rx));

        Self {
            handle: UpdateControllerHandle { cmd_tx, status_rx },
            task,
        }
    }

    pub fn handle(&self) -> UpdateControllerHandle {
        self.handle.clone()
    }

    pub async fn shutdown(self) -> ControllerResult<()> {
        self.handle.shutdown().await?;
        self.task.await?;
        Ok(())
    }
}

struct ControllerRuntime {
    manager: Arc<ComponentManager>,
    status_tx: watch::Sender<ControllerStatus>,
    cmd_tx: mpsc::Sender<ControllerCommand>,
    status: ControllerStatus,
    polling: bool,
    /// Waiting on the poll in flight.
    poll_waiters: Vec<oneshot::Sender<ControllerResult<()>>>,
    /// Arrived while a poll was in flight; served by the next one.
    queued_waiters: Vec<oneshot::Sender<ControllerResult<()>>>,
}

impl ControllerRuntime {
    fn new(
        manager: Arc<ComponentManager>,
        status_tx: watch::Sender<ControllerStatus>,
        cmd_tx: mpsc::Sender<ControllerCommand>,
    ) -> Self {
        Self {
            manager,
            status_tx,
            cmd_tx,
            status: ControllerStatus::default(),
            polling: false,
            poll_waiters: Vec::new(),
            queued_waiters: Vec::new(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ControllerCommand>) {
        let period = self.manager.config().poll_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            target: "update_controller",
            base_url = %self.manager.config().base_url,
            hours = self.manager.config().poll_interval_hours,
            "update controller started"
        );

        loop {
            tokio::select! {
                biased;
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => {
                            if let Err(ControllerError::Offline) = self.handle_command(cmd) {
                                break;
                            }
                        }
                        None => {
                            warn!(
                                target: "update_controller",
                                "command channel closed; shutting down runtime"
                            );
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !self.polling {
                        self.start_poll();
                    } else {
                        debug!(target: "update_controller", "poll still running; skipping tick");
                    }
                }
            }
        }

        for waiter in self.poll_waiters.drain(..).chain(self.queued_waiters.drain(..)) {
            let _ = waiter.send(Err(ControllerError::Offline));
        }
        self.status.phase = ControllerPhase::Stopping;
        self.publish();
        info!(target: "update_controller", "runtime loop exited");
    }

    fn handle_command(&mut self, cmd: ControllerCommand) -> ControllerResult<()> {
        match cmd {
            ControllerCommand::Refresh(reply) => {
                if self.polling {
                    self.queued_waiters.push(reply);
                } else {
                    self.poll_waiters.push(reply);
                    self.start_poll();
                }
            }
            ControllerCommand::Install {
                component_id,
                version,
                reply,
            } => self.start_install(component_id, version, true, Some(reply)),
            ControllerCommand::PollFinished(result) => self.finish_poll(result),
            ControllerCommand::InstallFinished {
                component_id,
                manual,
                previous,
                result,
                reply,
            } => self.finish_install(component_id, manual, previous, result, reply),
            ControllerCommand::Shutdown(reply) => {
                info!(target: "update_controller", "shutdown requested");
                let _ = reply.send(());
                return Err(ControllerError::Offline);
            }
        }

        Ok(())
    }

    fn start_poll(&mut self) {
        self.polling = true;
        self.status.phase = ControllerPhase::Polling;
        self.publish();
        debug!(target: "update_controller", "polling repository");

        let manager = self.manager.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = manager.refresh().await;
            if let Err(err) = cmd_tx.send(ControllerCommand::PollFinished(result)).await {
                error!(target: "update_controller", error = %err, "failed to report poll result");
            }
        });
    }

    fn finish_poll(&mut self, result: Result<Arc<RepositorySnapshot>, UpdaterError>) {
        self.polling = false;
        self.status.phase = ControllerPhase::Idle;
        self.status.last_poll = Some(SystemTime::now());

        let failure = match result {
            Ok(snapshot) => {
                self.apply_snapshot(&snapshot);
                None
            }
            Err(err) => {
                warn!(target: "update_controller", error = %err, "repository poll failed");
                Some(Arc::new(err))
            }
        };
        self.status.last_error = failure.as_ref().map(ToString::to_string);
        self.publish();

        for waiter in self.poll_waiters.drain(..) {
            let reply = match &failure {
                None => Ok(()),
                Some(err) => Err(ControllerError::Poll(err.clone())),
            };
            let _ = waiter.send(reply);
        }
        if !self.queued_waiters.is_empty() {
            self.poll_waiters = std::mem::take(&mut self.queued_waiters);
            self.start_poll();
            return;
        }

        if failure.is_none() && self.manager.config().auto_install {
            let pending: Vec<String> = self
                .status
                .components
                .values()
                .filter(|status| status.state == ComponentState::UpdateAvailable)
                .map(|status| status.component_id.clone())
                .collect();
            for component_id in pending {
                info!(
                    target: "update_controller",
                    component = %component_id,
                    "installing update automatically"
                );
                self.start_install(component_id, None, false, None);
            }
        }
    }

    fn apply_snapshot(&mut self, snapshot: &RepositorySnapshot) {
        let listed = &snapshot.repository.customs;
        self.status
            .components
            .retain(|component_id, _| listed.contains_key(component_id));

        for (component_id, display_name) in listed {
            let entry = self
                .status
                .components
                .entry(component_id.clone())
                .or_insert_with(|| ComponentStatus::new(component_id, display_name));
            entry.display_name = display_name.clone();

            let resolution = match snapshot.manifest(component_id) {
                Some(manifest) => self.manager.resolve_manifest(component_id, manifest),
                None => Err(UpdaterError::Other(
                    snapshot
                        .failures
                        .get(component_id)
                        .cloned()
                        .unwrap_or_else(|| "manifest unavailable".into()),
                )),
            };
            apply_resolution(entry, resolution);
        }
    }

    fn start_install(
        &mut self,
        component_id: String,
        version: Option<Version>,
        manual: bool,
        reply: Option<InstallReply>,
    ) {
        let display_name = self.display_name(&component_id);
        let status = self
            .status
            .components
            .entry(component_id.clone())
            .or_insert_with(|| ComponentStatus::new(&component_id, &display_name));
        if status.state == ComponentState::Installing {
            if let Some(reply) = reply {
                let _ = reply.send(Err(UpdaterError::InstallInProgress(component_id).into()));
            }
            return;
        }
        let previous = std::mem::replace(&mut status.state, ComponentState::Installing);
        self.publish();

        let manager = self.manager.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = manager.install(&component_id, version).await;
            let finished = ControllerCommand::InstallFinished {
                component_id,
                manual,
                previous,
                result,
                reply,
            };
            if let Err(err) = cmd_tx.send(finished).await {
                error!(
                    target: "update_controller",
                    error = %err,
                    "failed to report install result"
                );
            }
        });
    }

    fn finish_install(
        &mut self,
        component_id: String,
        manual: bool,
        previous: ComponentState,
        result: Result<InstalledVersion, UpdaterError>,
        reply: Option<InstallReply>,
    ) {
        let fresh = self
            .manager
            .snapshot()
            .and_then(|snapshot| {
                snapshot
                    .manifest(&component_id)
                    .map(|manifest| self.manager.resolve_manifest(&component_id, manifest))
            });
        let display_name = self.display_name(&component_id);
        let status = self
            .status
            .components
            .entry(component_id.clone())
            .or_insert_with(|| ComponentStatus::new(&component_id, &display_name));

        let outcome = match result {
            Ok(installed) => {
                info!(
                    target: "update_controller",
                    component = %component_id,
                    version = %installed.version,
                    "component updated; host restart required"
                );
                status.state = ComponentState::UpToDate;
                status.installed = Some(installed.version.clone());
                status.last_error = None;
                status.restart_required = true;
                if let Some(resolution) = fresh {
                    apply_resolution(status, resolution);
                }
                Ok(installed)
            }
            Err(err @ (UpdaterError::InstallInProgress(_) | UpdaterError::Cancelled(_))) => {
                debug!(
                    target: "update_controller",
                    component = %component_id,
                    error = %err,
                    "install did not run"
                );
                status.state = previous;
                if let Some(resolution) = fresh {
                    apply_resolution(status, resolution);
                }
                Err(err)
            }
            Err(err) => {
                warn!(
                    target: "update_controller",
                    component = %component_id,
                    manual,
                    error = %err,
                    "install failed"
                );
                status.state = ComponentState::Error;
                status.last_error = Some(err.to_string());
                Err(err)
            }
        };
        self.publish();

        if let Some(reply) = reply {
            let _ = reply.send(outcome.map_err(ControllerError::from));
        }
    }

    fn display_name(&self, component_id: &str) -> String {
        self.manager
            .snapshot()
            .and_then(|snapshot| {
                snapshot
                    .repository
                    .display_name(component_id)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| component_id.to_string())
    }

    fn publish(&self) {
        if self.status_tx.send(self.status.clone()).is_err() {
            warn!(target: "update_controller", "failed to publish status update (no listeners)");
        }
    }
}

/// Fold a fresh resolution into `status`. `Installing` and `Error` are
/// sticky: their versions are refreshed but the state itself is kept, so
/// only the install outcome moves a component out of them.
fn apply_resolution(
    status: &mut ComponentStatus,
    resolution: Result<ResolutionResult, UpdaterError>,
) {
    let sticky = matches!(
        status.state,
        ComponentState::Installing | ComponentState::Error
    );
    match resolution {
        Ok(resolution) => {
            status.installed = resolution.installed_version;
            status.latest = resolution.latest_allowed_version;
            if !sticky {
                status.state = resolution.status.into();
                status.last_error = None;
            }
        }
        Err(err) => {
            warn!(
                target: "update_controller",
                component = %status.component_id,
                error = %err,
                "cannot resolve component"
            );
            if !sticky {
                status.state = ComponentState::Unknown;
            }
            status.last_error = Some(err.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use component_updater::{Fetcher, UpdaterConfig};
    use parking_lot::Mutex;
    use reqwest::Url;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::{Cursor, Write};
    use std::time::Duration;
    use tempfile::TempDir;

    const BASE: &str = "https://example.com";

    #[derive(Default)]
    struct MockFetcher {
        entries: Mutex<HashMap<String, Vec<u8>>>,
        delays: Mutex<HashMap<String, Duration>>,
        requested: Mutex<Vec<String>>,
    }

    impl MockFetcher {
        fn insert(&self, url: &str, body: Vec<u8>) {
            self.entries.lock().insert(url.to_string(), body);
        }

        fn delay(&self, url: &str, delay: Duration) {
            self.delays.lock().insert(url.to_string(), delay);
        }

        fn requests_for(&self, url: &str) -> usize {
            self.requested.lock().iter().filter(|seen| *seen == url).count()
        }

        fn publish(&self, versions: &[&str]) {
            let mut table = serde_json::Map::new();
            for version in versions {
                let url = format!("{BASE}/demo-{version}.zip");
                table.insert(
                    version.to_string(),
                    json!({"ha_min": "2024.1.0", "release_file": url}),
                );
                self.insert(&url, archive(version));
            }
            self.insert(
                &format!("{BASE}/demo/custom.json"),
                json!({"name": "Demo", "versions": table}).to_string().into_bytes(),
            );
        }
    }

    #[async_trait]
    impl Fetcher for MockFetcher {
        async fn fetch_bytes(
            &self,
            url: &Url,
            _timeout: Duration,
        ) -> component_updater::Result<Vec<u8>> {
            self.requested.lock().push(url.to_string());
            let delay = self.delays.lock().get(url.as_str()).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.entries
                .lock()
                .get(url.as_str())
                .cloned()
                .ok_or_else(|| UpdaterError::Fetch {
                    url: url.to_string(),
                    reason: "404 Not Found".into(),
                })
        }
    }

    fn archive(version: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("demo/version.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(version.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    fn launch(fetcher: Arc<MockFetcher>, auto_install: bool) -> (TempDir, UpdateController) {
        fetcher.insert(
            &format!("{BASE}/repository.json"),
            json!({"name": "Repo", "customs": {"demo": "Demo"}}).to_string().into_bytes(),
        );
        let dir = tempfile::tempdir().unwrap();
        let config = UpdaterConfig::new(BASE, dir.path(), "2024.6.0".parse().unwrap())
            .auto_install(auto_install);
        let manager = ComponentManager::with_fetcher(config, fetcher).unwrap();
        (dir, UpdateController::launch(Arc::new(manager)))
    }

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    async fn wait_for_state(
        updates: &mut watch::Receiver<ControllerStatus>,
        state: ComponentState,
    ) {
        tokio::time::timeout(
            Duration::from_secs(5),
            updates.wait_for(|status| {
                status
                    .component("demo")
                    .map_or(false, |demo| demo.state == state)
            }),
        )
        .await
        .expect("component reached state")
        .unwrap();
    }

    #[tokio::test]
    async fn poll_resolves_and_manual_install_updates_status() {
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.publish(&["1.0.0"]);
        let (_dir, controller) = launch(fetcher.clone(), false);
        let handle = controller.handle();

        handle.refresh().await.unwrap();
        let status = handle.component_status("demo").unwrap();
        assert_eq!(status.state, ComponentState::NotInstalled);
        assert_eq!(status.latest, Some(v("1.0.0")));

        let installed = handle.request_install("demo", None).await.unwrap();
        assert_eq!(installed.version, v("1.0.0"));
        let status = handle.component_status("demo").unwrap();
        assert_eq!(status.state, ComponentState::UpToDate);
        assert!(status.restart_required);

        fetcher.publish(&["1.0.0", "1.1.0"]);
        handle.refresh().await.unwrap();
        assert_eq!(
            handle.component_status("demo").unwrap().state,
            ComponentState::UpdateAvailable
        );

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn failed_install_is_sticky_until_manual_success() {
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.publish(&["1.0.0"]);
        fetcher.insert(&format!("{BASE}/demo-1.0.0.zip"), b"not a zip".to_vec());
        let (_dir, controller) = launch(fetcher.clone(), false);
        let handle = controller.handle();
        handle.refresh().await.unwrap();

        let err = handle.install("demo", None).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Updater(UpdaterError::InvalidArchive { .. })
        ));
        let status = handle.component_status("demo").unwrap();
        assert_eq!(status.state, ComponentState::Error);
        assert!(status.last_error.is_some());

        handle.refresh().await.unwrap();
        let status = handle.component_status("demo").unwrap();
        assert_eq!(status.state, ComponentState::Error);
        assert_eq!(status.latest, Some(v("1.0.0")));

        fetcher.insert(&format!("{BASE}/demo-1.0.0.zip"), archive("1.0.0"));
        handle.install("demo", None).await.unwrap();
        let status = handle.component_status("demo").unwrap();
        assert_eq!(status.state, ComponentState::UpToDate);
        assert_eq!(status.last_error, None);

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn auto_install_applies_available_updates() {
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.publish(&["1.0.0"]);
        let (dir, controller) = launch(fetcher, true);
        let handle = controller.handle();
        let mut updates = handle.subscribe();

        handle.refresh().await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            updates.wait_for(|status| {
                status
                    .component("demo")
                    .map_or(false, |demo| demo.restart_required)
            }),
        )
        .await
        .expect("auto install finished")
        .unwrap();

        assert!(dir.path().join("demo/version.txt").is_file());
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unlisted_component_is_dropped_and_repository_errors_are_reported() {
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.publish(&["1.0.0"]);
        let (_dir, controller) = launch(fetcher.clone(), false);
        let handle = controller.handle();
        handle.refresh().await.unwrap();
        assert!(handle.component_status("demo").is_some());

        fetcher.insert(
            &format!("{BASE}/repository.json"),
            json!({"name": "Repo", "customs": {}}).to_string().into_bytes(),
        );
        handle.refresh().await.unwrap();
        assert!(handle.component_status("demo").is_none());

        fetcher.insert(&format!("{BASE}/repository.json"), b"{".to_vec());
        match handle.refresh().await.unwrap_err() {
            ControllerError::Poll(err) => {
                assert!(matches!(*err, UpdaterError::MalformedManifest(_)), "{err:?}")
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(handle.status().last_error.is_some());

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn poll_during_install_keeps_installing_state() {
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.publish(&["1.0.0"]);
        let (_dir, controller) = launch(fetcher.clone(), true);
        let handle = controller.handle();
        let mut updates = handle.subscribe();
        handle.refresh().await.unwrap();
        handle.install("demo", None).await.unwrap();

        fetcher.publish(&["1.0.0", "1.1.0"]);
        fetcher.delay(&format!("{BASE}/demo-1.1.0.zip"), Duration::from_millis(300));
        let installing = tokio::spawn({
            let handle = handle.clone();
            async move { handle.install("demo", None).await }
        });
        wait_for_state(&mut updates, ComponentState::Installing).await;

        // Resolves as UpdateAvailable on disk, but the install owns the state.
        handle.refresh().await.unwrap();
        let status = handle.component_status("demo").unwrap();
        assert_eq!(status.state, ComponentState::Installing);
        assert_eq!(status.latest, Some(v("1.1.0")));

        let err = handle.install("demo", None).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Updater(UpdaterError::InstallInProgress(_))
        ));
        assert_eq!(
            handle.component_status("demo").unwrap().state,
            ComponentState::Installing
        );

        let installed = installing.await.unwrap().unwrap();
        assert_eq!(installed.version, v("1.1.0"));
        let status = handle.component_status("demo").unwrap();
        assert_eq!(status.state, ComponentState::UpToDate);
        assert_eq!(status.installed, Some(v("1.1.0")));
        assert_eq!(fetcher.requests_for(&format!("{BASE}/demo-1.1.0.zip")), 1);

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn error_state_blocks_automatic_retries() {
        let fetcher = Arc::new(MockFetcher::default());
        fetcher.publish(&["1.0.0"]);
        let (_dir, controller) = launch(fetcher.clone(), true);
        let handle = controller.handle();
        let mut updates = handle.subscribe();
        handle.refresh().await.unwrap();
        handle.install("demo", None).await.unwrap();

        fetcher.publish(&["1.0.0", "1.1.0"]);
        fetcher.insert(&format!("{BASE}/demo-1.1.0.zip"), b"not a zip".to_vec());
        handle.refresh().await.unwrap();
        wait_for_state(&mut updates, ComponentState::Error).await;

        fetcher.publish(&["1.0.0", "1.1.0", "1.2.0"]);
        handle.refresh().await.unwrap();
        handle.refresh().await.unwrap();

        let status = handle.component_status("demo").unwrap();
        assert_eq!(status.state, ComponentState::Error);
        assert_eq!(status.installed, Some(v("1.0.0")));
        assert_eq!(status.latest, Some(v("1.2.0")));
        assert_eq!(fetcher.requests_for(&format!("{BASE}/demo-1.2.0.zip")), 0);
        assert_eq!(fetcher.requests_for(&format!("{BASE}/demo-1.1.0.zip")), 1);

        controller.shutdown().await.unwrap();
    }
}
