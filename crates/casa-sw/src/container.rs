//! Host side of the worker lifecycle (`navigator.serviceWorker`).
//!
//! The container owns the registration for one scope, runs each worker's
//! script through install and activate, routes page commands to workers and
//! fans registration changes out to subscribed pages.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use casa_core::{CasaConfig, WorkerConfig};
use casa_net::{Fetcher, Request};
use hashbrown::HashMap;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::message::{ContainerEvent, ControlAction, Envelope, WorkerHandle};
use crate::registration::{Registration, RegistrationEvent, RegistrationNotice, ServiceWorker};
use crate::script::{ClientsClaim, FetchDecision, ServiceWorkerScript};
use crate::{ServiceWorkerError, ServiceWorkerId, ServiceWorkerState};

const EVENT_CAPACITY: usize = 64;

// ==================== Script Sources ====================

/// Where the container gets the current worker build from.
///
/// Loading the build is the equivalent of byte-comparing the script on an
/// update check: a changed `version` means a new worker.
#[async_trait]
pub trait ScriptSource: Send + Sync {
    async fn load(&self, script_url: &Url) -> Result<WorkerConfig, ServiceWorkerError>;
}

/// In-process deployment; `deploy` publishes a new build.
#[derive(Debug)]
pub struct DeploymentSource {
    current: RwLock<WorkerConfig>,
}

impl DeploymentSource {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            current: RwLock::new(config),
        }
    }

    /// Replace the deployed build.
    pub async fn deploy(&self, config: WorkerConfig) {
        info!(version = %config.version, "Deploying worker build");
        *self.current.write().await = config;
    }

    pub async fn current(&self) -> WorkerConfig {
        self.current.read().await.clone()
    }
}

#[async_trait]
impl ScriptSource for DeploymentSource {
    async fn load(&self, _script_url: &Url) -> Result<WorkerConfig, ServiceWorkerError> {
        Ok(self.current().await)
    }
}

/// Reads the build from the `worker` section of a config file on every check.
#[derive(Debug, Clone)]
pub struct FileScriptSource {
    path: PathBuf,
}

impl FileScriptSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl ScriptSource for FileScriptSource {
    async fn load(&self, script_url: &Url) -> Result<WorkerConfig, ServiceWorkerError> {
        let config = CasaConfig::from_file(&self.path).map_err(|e| {
            ServiceWorkerError::ScriptError(format!("{}: {}", script_url, e))
        })?;
        Ok(config.worker)
    }
}

// ==================== Container ====================

struct ContainerState {
    registration: Registration,
    script_url: Option<Url>,
    scripts: HashMap<ServiceWorkerId, Arc<ServiceWorkerScript>>,
}

impl ContainerState {
    /// Drop the scripts of workers that turned redundant.
    fn prune(&mut self, notices: &[RegistrationNotice]) {
        for notice in notices {
            if let RegistrationNotice::StateChanged {
                worker,
                state: ServiceWorkerState::Redundant,
            } = notice
            {
                self.scripts.remove(worker);
            }
        }
    }
}

struct Shared {
    scope: Url,
    fetcher: Arc<dyn Fetcher>,
    caches: Arc<dyn CacheStorage>,
    source: Arc<dyn ScriptSource>,
    state: RwLock<ContainerState>,
    /// Serializes install, activate and skip-waiting.
    lifecycle: Mutex<()>,
    events: broadcast::Sender<ContainerEvent>,
}

/// The pages' view of the worker platform for one scope.
///
/// Must be created inside a Tokio runtime.
pub struct ServiceWorkerContainer {
    shared: Arc<Shared>,
    command_tx: mpsc::UnboundedSender<Envelope>,
    dispatcher: JoinHandle<()>,
}

impl ServiceWorkerContainer {
    pub fn new(
        scope: Url,
        fetcher: Arc<dyn Fetcher>,
        caches: Arc<dyn CacheStorage>,
        source: Arc<dyn ScriptSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            scope: scope.clone(),
            fetcher,
            caches,
            source,
            state: RwLock::new(ContainerState {
                registration: Registration::new(scope),
                script_url: None,
                scripts: HashMap::new(),
            }),
            lifecycle: Mutex::new(()),
            events,
        });

        let dispatcher = tokio::spawn(dispatch(Arc::clone(&shared), command_rx));

        Self {
            shared,
            command_tx,
            dispatcher,
        }
    }

    pub fn scope(&self) -> &Url {
        &self.shared.scope
    }

    pub fn caches(&self) -> Arc<dyn CacheStorage> {
        Arc::clone(&self.shared.caches)
    }

    /// Subscribe to registration events.
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.shared.events.subscribe()
    }

    /// Register the worker script and run the first update check.
    pub async fn register(&self, script_url: Url) -> Result<(), ServiceWorkerError> {
        if script_url.origin() != self.shared.scope.origin() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "script {} is not same-origin with scope {}",
                script_url, self.shared.scope
            )));
        }

        info!(script = %script_url, scope = %self.shared.scope, "Registering service worker");
        self.shared.state.write().await.script_url = Some(script_url);
        self.update().await.map(|_| ())
    }

    /// Check for a new build. Returns whether a new worker was installed.
    pub async fn update(&self) -> Result<bool, ServiceWorkerError> {
        let _guard = self.shared.lifecycle.lock().await;
        self.shared.update().await
    }

    /// Drop the registration and every worker it holds.
    pub async fn unregister(&self) -> Result<bool, ServiceWorkerError> {
        let _guard = self.shared.lifecycle.lock().await;
        let notices = {
            let mut state = self.shared.state.write().await;
            if matches!(
                state.registration.state(),
                crate::RegistrationState::Unregistered
            ) {
                return Ok(false);
            }
            let notices = state.registration.transition(RegistrationEvent::Unregister)?;
            state.scripts.clear();
            state.script_url = None;
            notices
        };
        self.shared.publish(notices);
        info!(scope = %self.shared.scope, "Unregistered service worker");
        Ok(true)
    }

    /// Worker controlling the scope's pages.
    pub async fn controller(&self) -> Option<ServiceWorkerId> {
        self.shared.state.read().await.registration.controller()
    }

    pub async fn installing(&self) -> Option<WorkerHandle> {
        let state = self.shared.state.read().await;
        state.registration.installing().map(|w| self.worker(w.id))
    }

    pub async fn waiting(&self) -> Option<WorkerHandle> {
        let state = self.shared.state.read().await;
        state.registration.waiting().map(|w| self.worker(w.id))
    }

    pub async fn active(&self) -> Option<WorkerHandle> {
        let state = self.shared.state.read().await;
        state.registration.active().map(|w| self.worker(w.id))
    }

    /// Version tag of a worker this registration still holds.
    pub async fn version_of(&self, id: ServiceWorkerId) -> Option<String> {
        let state = self.shared.state.read().await;
        state.scripts.get(&id).map(|s| s.version().to_string())
    }

    /// Message handle for a worker. Commands to workers that are gone are dropped.
    pub fn worker(&self, id: ServiceWorkerId) -> WorkerHandle {
        WorkerHandle::new(id, self.command_tx.clone())
    }

    /// Route a page request through the controlling worker.
    pub async fn fetch(&self, request: &Request) -> FetchDecision {
        let script = {
            let state = self.shared.state.read().await;
            state
                .registration
                .controller()
                .and_then(|id| state.scripts.get(&id).cloned())
        };

        match script {
            Some(script) => script.handle_fetch(request).await,
            None => FetchDecision::Passthrough,
        }
    }

    /// Wait for background cache writes of every live worker.
    pub async fn flush(&self) {
        let scripts: Vec<_> = {
            let state = self.shared.state.read().await;
            state.scripts.values().cloned().collect()
        };
        for script in scripts {
            script.flush().await;
        }
    }
}

impl Drop for ServiceWorkerContainer {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

impl std::fmt::Debug for ServiceWorkerContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorkerContainer")
            .field("scope", &self.shared.scope.as_str())
            .finish_non_exhaustive()
    }
}

// ==================== Lifecycle ====================

/// The host always lets a worker take over open pages.
struct HostClients;

#[async_trait]
impl ClientsClaim for HostClients {
    async fn claim(&self) -> Result<(), ServiceWorkerError> {
        Ok(())
    }
}

impl Shared {
    /// Callers hold the lifecycle lock.
    async fn update(&self) -> Result<bool, ServiceWorkerError> {
        let script_url = self
            .state
            .read()
            .await
            .script_url
            .clone()
            .ok_or_else(|| ServiceWorkerError::RegistrationFailed("no script registered".into()))?;

        let config = self.source.load(&script_url).await?;
        config
            .validate()
            .map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))?;

        let worker = ServiceWorker::new(script_url, config.version.clone());
        let id = worker.id;
        let script = Arc::new(ServiceWorkerScript::new(
            config,
            Arc::clone(&self.fetcher),
            Arc::clone(&self.caches),
        ));

        {
            let mut state = self.state.write().await;
            if state.registration.newest_version() == Some(script.version()) {
                debug!(version = %script.version(), "Worker build unchanged");
                return Ok(false);
            }
            let notices = state
                .registration
                .transition(RegistrationEvent::StartInstall(worker))?;
            state.prune(&notices);
            state.scripts.insert(id, Arc::clone(&script));
            drop(state);
            self.publish(notices);
        }

        info!(worker = %id, version = %script.version(), "Installing new worker");
        let installing = Arc::clone(&script);
        let report = match tokio::spawn(async move { installing.install().await }).await {
            Ok(report) => report,
            Err(e) => {
                warn!(worker = %id, error = %e, "Install handler did not complete");
                self.apply(RegistrationEvent::InstallFailed).await?;
                return Err(ServiceWorkerError::ScriptError(format!(
                    "install of {} did not complete: {}",
                    script.version(),
                    e
                )));
            }
        };
        self.apply(RegistrationEvent::InstallCompleted).await?;

        if report.skip_waiting && self.waiting_id().await == Some(id) {
            self.apply(RegistrationEvent::SkipWaiting).await?;
        }
        self.run_activation().await?;
        Ok(true)
    }

    async fn waiting_id(&self) -> Option<ServiceWorkerId> {
        self.state.read().await.registration.waiting().map(|w| w.id)
    }

    /// Run the activate handler of the activating worker, if any.
    async fn run_activation(&self) -> Result<(), ServiceWorkerError> {
        let script = {
            let state = self.state.read().await;
            match state.registration.state() {
                crate::RegistrationState::Activating { activating } => {
                    state.scripts.get(&activating.id).cloned()
                }
                _ => None,
            }
        };

        let Some(script) = script else {
            return Ok(());
        };
        let report = script.activate(&HostClients).await;
        self.apply(RegistrationEvent::ActivateCompleted {
            claimed: report.claimed,
        })
        .await
    }

    async fn apply(&self, event: RegistrationEvent) -> Result<(), ServiceWorkerError> {
        let notices = {
            let mut state = self.state.write().await;
            let notices = state.registration.transition(event)?;
            state.prune(&notices);
            notices
        };
        self.publish(notices);
        Ok(())
    }

    fn publish(&self, notices: Vec<RegistrationNotice>) {
        for notice in notices {
            let event = match notice {
                RegistrationNotice::UpdateFound(worker) => ContainerEvent::UpdateFound { worker },
                RegistrationNotice::StateChanged { worker, state } => {
                    ContainerEvent::StateChange { worker, state }
                }
                RegistrationNotice::ControllerChanged(worker) => {
                    info!(worker = %worker, "Controller changed");
                    ContainerEvent::ControllerChange
                }
            };
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    async fn deliver(&self, envelope: Envelope) -> Result<(), ServiceWorkerError> {
        let _guard = self.lifecycle.lock().await;

        let script = self.state.read().await.scripts.get(&envelope.target).cloned();
        let Some(script) = script else {
            debug!(worker = %envelope.target, "Dropping message for unknown worker");
            return Ok(());
        };

        match script.handle_message(&envelope.command) {
            Some(ControlAction::SkipWaiting) => {
                if self.waiting_id().await != Some(envelope.target) {
                    debug!(worker = %envelope.target, "Skip waiting ignored, worker is not waiting");
                    return Ok(());
                }
                self.apply(RegistrationEvent::SkipWaiting).await?;
                self.run_activation().await
            }
            None => Ok(()),
        }
    }
}

async fn dispatch(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        let target = envelope.target;
        if let Err(e) = shared.deliver(envelope).await {
            warn!(worker = %target, error = %e, "Failed to handle worker message");
        }
    }
}
