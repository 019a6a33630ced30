//! Page-side update monitor.
//!
//! Registers the worker, follows new installs until one is parked in the
//! waiting slot, and keeps the pending-update flag for the notification UI.
//! When the controller changes the page is reloaded once.

use std::sync::Arc;
use std::time::Duration;

use casa_common::{CasaError, OptionExt};
use casa_core::PageConfig;
use casa_sw::{ContainerEvent, ServiceWorkerId, ServiceWorkerState, WorkerCommand};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::platform::WorkerPlatform;

/// Monitor settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Origin-root path of the worker script.
    pub script_path: String,

    /// How often to ask the platform for a new build.
    pub update_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from(&PageConfig::default())
    }
}

impl From<&PageConfig> for MonitorConfig {
    fn from(config: &PageConfig) -> Self {
        Self {
            script_path: config.script_path.clone(),
            update_interval: Duration::from_secs(config.update_check_interval_secs),
        }
    }
}

/// The pending-update flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingUpdate {
    /// A new version is installed and waiting.
    pub available: bool,

    /// The waiting worker the flag refers to.
    pub waiting: Option<ServiceWorkerId>,
}

impl PendingUpdate {
    fn waiting(id: ServiceWorkerId) -> Self {
        Self {
            available: true,
            waiting: Some(id),
        }
    }
}

/// The page the monitor runs in.
pub trait PageHost: Send + Sync {
    /// Full reload of the page.
    fn reload(&self);
}

/// Sends skip-waiting to the tracked waiting worker.
#[derive(Clone)]
pub struct UpdateTrigger {
    platform: Arc<dyn WorkerPlatform>,
    pending: Arc<watch::Sender<PendingUpdate>>,
}

impl UpdateTrigger {
    /// Release the waiting worker and clear the flag.
    ///
    /// The reload follows from the controller change, not from here.
    pub fn trigger_update(&self) -> casa_common::Result<()> {
        if !self.platform.is_supported() {
            return Err(CasaError::Unsupported("service workers".into()));
        }

        let waiting = self.pending.borrow().waiting.ok_or_not_found("waiting worker")?;
        let handle = self
            .platform
            .worker(waiting)
            .ok_or_not_found(format!("worker {}", waiting))?;
        handle.post_message(WorkerCommand::SkipWaiting)?;

        log::info!("Applying update, worker {} will take over", waiting);
        self.pending.send_replace(PendingUpdate::default());
        Ok(())
    }
}

impl std::fmt::Debug for UpdateTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateTrigger")
            .field("pending", &*self.pending.borrow())
            .finish_non_exhaustive()
    }
}

/// Watches the registration for updates on behalf of one page load.
pub struct UpdateMonitor {
    pending: watch::Receiver<PendingUpdate>,
    trigger: UpdateTrigger,
    task: Option<JoinHandle<()>>,
}

impl UpdateMonitor {
    /// Register the worker and start watching.
    ///
    /// Without worker support the monitor starts idle and its flag stays
    /// false. Events from the registration itself are not replayed: a page
    /// does not reload because its own first install claimed it.
    pub async fn start(
        platform: Arc<dyn WorkerPlatform>,
        host: Arc<dyn PageHost>,
        config: MonitorConfig,
    ) -> casa_common::Result<Self> {
        let (tx, rx) = watch::channel(PendingUpdate::default());
        let tx = Arc::new(tx);
        let trigger = UpdateTrigger {
            platform: Arc::clone(&platform),
            pending: Arc::clone(&tx),
        };

        if !platform.is_supported() {
            log::info!("Service workers not supported, offline support disabled");
            return Ok(Self {
                pending: rx,
                trigger,
                task: None,
            });
        }

        platform.register(&config.script_path).await?;
        log::info!("Service worker registered: {}", config.script_path);

        let Some(events) = platform.subscribe() else {
            log::warn!("Platform has no event stream, update checks disabled");
            return Ok(Self {
                pending: rx,
                trigger,
                task: None,
            });
        };

        let mut watcher = Watcher {
            platform,
            host,
            pending: tx,
            installing: None,
            reloaded: false,
        };
        // A worker may already be parked from an earlier page load.
        watcher.resync().await;

        let task = tokio::spawn(watcher.run(events, config.update_interval));
        Ok(Self {
            pending: rx,
            trigger,
            task: Some(task),
        })
    }

    /// Current flag value.
    pub fn pending(&self) -> PendingUpdate {
        *self.pending.borrow()
    }

    /// Follow flag changes.
    pub fn subscribe(&self) -> watch::Receiver<PendingUpdate> {
        self.pending.clone()
    }

    pub fn trigger(&self) -> UpdateTrigger {
        self.trigger.clone()
    }

    /// See [`UpdateTrigger::trigger_update`].
    pub fn trigger_update(&self) -> casa_common::Result<()> {
        self.trigger.trigger_update()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the poll timer and the event listener.
    pub fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            log::debug!("Update monitor stopped");
        }
    }
}

impl Drop for UpdateMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Watcher {
    platform: Arc<dyn WorkerPlatform>,
    host: Arc<dyn PageHost>,
    pending: Arc<watch::Sender<PendingUpdate>>,
    /// Newest worker seen installing.
    installing: Option<ServiceWorkerId>,
    reloaded: bool,
}

impl Watcher {
    async fn run(mut self, mut events: broadcast::Receiver<ContainerEvent>, every: Duration) {
        let mut poll = interval_at(Instant::now() + every, every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    match self.platform.update().await {
                        Ok(true) => log::debug!("Update check installed a new worker"),
                        Ok(false) => {}
                        Err(e) => log::warn!("Update check failed: {}", e),
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => self.on_event(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("Missed {} worker events, resyncing", missed);
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    async fn on_event(&mut self, event: ContainerEvent) {
        match event {
            ContainerEvent::UpdateFound { worker } => {
                log::debug!("Update found, worker {} installing", worker);
                self.installing = Some(worker);
            }
            ContainerEvent::StateChange {
                worker,
                state: ServiceWorkerState::Installed,
            } if self.installing == Some(worker) => {
                self.installing = None;
                self.flag_if_waiting(worker).await;
            }
            ContainerEvent::StateChange {
                worker,
                state: ServiceWorkerState::Redundant,
            } => {
                if self.installing == Some(worker) {
                    self.installing = None;
                }
                if self.pending.borrow().waiting == Some(worker) {
                    log::debug!("Waiting worker {} was replaced", worker);
                    self.pending.send_replace(PendingUpdate::default());
                }
            }
            ContainerEvent::StateChange { .. } => {}
            ContainerEvent::ControllerChange => {
                if !self.reloaded {
                    self.reloaded = true;
                    log::info!("Controller changed, reloading page");
                    self.host.reload();
                }
            }
        }
    }

    /// Set the flag for `worker` if it is an update parked behind a controller.
    async fn flag_if_waiting(&self, worker: ServiceWorkerId) {
        if self.platform.controller().await.is_none() {
            // First install: nothing to update from.
            return;
        }
        if self.platform.waiting().await != Some(worker) {
            return;
        }
        log::info!("New version available, worker {} is waiting", worker);
        self.pending.send_replace(PendingUpdate::waiting(worker));
    }

    async fn resync(&mut self) {
        match self.platform.waiting().await {
            Some(worker) => self.flag_if_waiting(worker).await,
            None => {
                self.pending.send_if_modified(|pending| {
                    let had = pending.available;
                    *pending = PendingUpdate::default();
                    had
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::NoServiceWorker;
    use async_trait::async_trait;
    use bytes::Bytes;
    use casa_core::WorkerConfig;
    use casa_net::{Fetcher, NetError, Request, Response};
    use casa_sw::{DeploymentSource, MemoryCacheStorage, ServiceWorkerContainer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use url::Url;

    const ORIGIN: &str = "https://casas.example/";

    struct EchoFetcher;

    #[async_trait]
    impl Fetcher for EchoFetcher {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            Ok(Response::new(
                request.url.clone(),
                200,
                http::HeaderMap::new(),
                Bytes::from(request.url.path().to_string()),
            ))
        }
    }

    #[derive(Default)]
    struct CountingHost {
        reloads: AtomicUsize,
        reloaded: Notify,
    }

    impl PageHost for CountingHost {
        fn reload(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            self.reloaded.notify_one();
        }
    }

    fn build(version: &str) -> WorkerConfig {
        WorkerConfig {
            origin: Url::parse(ORIGIN).unwrap(),
            version: version.to_string(),
            ..WorkerConfig::default()
        }
    }

    fn container(source: Arc<DeploymentSource>) -> Arc<ServiceWorkerContainer> {
        Arc::new(ServiceWorkerContainer::new(
            Url::parse(ORIGIN).unwrap(),
            Arc::new(EchoFetcher),
            Arc::new(MemoryCacheStorage::new()),
            source,
        ))
    }

    fn config(every: Duration) -> MonitorConfig {
        MonitorConfig {
            update_interval: every,
            ..MonitorConfig::default()
        }
    }

    #[test]
    fn test_config_from_page_settings() {
        let config = MonitorConfig::default();
        assert_eq!(config.script_path, "/service-worker.js");
        assert_eq!(config.update_interval, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_unsupported_platform_stays_idle() {
        let host = Arc::new(CountingHost::default());
        let monitor = UpdateMonitor::start(Arc::new(NoServiceWorker), host, MonitorConfig::default())
            .await
            .unwrap();

        assert!(!monitor.is_running());
        assert_eq!(monitor.pending(), PendingUpdate::default());
        assert!(matches!(
            monitor.trigger_update(),
            Err(CasaError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_registration_failure_is_reported() {
        let mut bad = build("v1");
        bad.version = String::new();
        let platform = container(Arc::new(DeploymentSource::new(bad)));

        let result = UpdateMonitor::start(
            platform,
            Arc::new(CountingHost::default()),
            MonitorConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(CasaError::Registration { .. })));
    }

    #[tokio::test]
    async fn test_first_install_sets_no_flag_and_no_reload() {
        let platform = container(Arc::new(DeploymentSource::new(build("v1"))));
        let host = Arc::new(CountingHost::default());

        let monitor = UpdateMonitor::start(platform.clone(), host.clone(), MonitorConfig::default())
            .await
            .unwrap();

        assert!(platform.controller().await.is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!monitor.pending().available);
        assert_eq!(host.reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_trigger_without_waiting_worker() {
        let platform = container(Arc::new(DeploymentSource::new(build("v1"))));
        let monitor = UpdateMonitor::start(
            platform,
            Arc::new(CountingHost::default()),
            MonitorConfig::default(),
        )
        .await
        .unwrap();
        assert!(matches!(
            monitor.trigger_update(),
            Err(CasaError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_finds_new_deployment() {
        let source = Arc::new(DeploymentSource::new(build("v1")));
        let platform = container(source.clone());
        let host = Arc::new(CountingHost::default());
        let monitor = UpdateMonitor::start(platform.clone(), host, config(Duration::from_secs(300)))
            .await
            .unwrap();

        source.deploy(build("v2")).await;
        let mut pending = monitor.subscribe();
        let update = *pending.wait_for(|p| p.available).await.unwrap();

        let waiting = platform.waiting().await.map(|w| w.id);
        assert_eq!(update.waiting, waiting);
        assert_eq!(
            platform.version_of(waiting.unwrap()).await.as_deref(),
            Some("v2")
        );
    }

    #[tokio::test]
    async fn test_existing_waiting_worker_is_flagged_on_start() {
        let source = Arc::new(DeploymentSource::new(build("v1")));
        let platform = container(source.clone());
        platform
            .register(Url::parse(ORIGIN).unwrap().join("/service-worker.js").unwrap())
            .await
            .unwrap();
        source.deploy(build("v2")).await;
        platform.update().await.unwrap();

        let monitor = UpdateMonitor::start(
            platform.clone(),
            Arc::new(CountingHost::default()),
            MonitorConfig::default(),
        )
        .await
        .unwrap();

        let pending = monitor.pending();
        assert!(pending.available);
        assert_eq!(pending.waiting, platform.waiting().await.map(|w| w.id));
    }

    #[tokio::test]
    async fn test_reload_once_per_monitor() {
        let source = Arc::new(DeploymentSource::new(build("v1")));
        let platform = container(source.clone());
        let host = Arc::new(CountingHost::default());
        let monitor = UpdateMonitor::start(platform.clone(), host.clone(), MonitorConfig::default())
            .await
            .unwrap();

        for version in ["v2", "v3"] {
            let mut next = build(version);
            next.skip_waiting_on_install = true;
            source.deploy(next).await;
            platform.update().await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), host.reloaded.notified())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(host.reloads.load(Ordering::SeqCst), 1);
        drop(monitor);
    }

    #[tokio::test]
    async fn test_shutdown_stops_task() {
        let platform = container(Arc::new(DeploymentSource::new(build("v1"))));
        let mut monitor = UpdateMonitor::start(
            platform,
            Arc::new(CountingHost::default()),
            MonitorConfig::default(),
        )
        .await
        .unwrap();
        assert!(monitor.is_running());

        monitor.shutdown();
        assert!(!monitor.is_running());
    }
}
