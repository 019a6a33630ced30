//! What a page can see of the worker platform.

use async_trait::async_trait;
use casa_sw::{
    ContainerEvent, ServiceWorkerContainer, ServiceWorkerError, ServiceWorkerId, WorkerHandle,
};
use tokio::sync::broadcast;

/// `navigator.serviceWorker`, reduced to what the update monitor uses.
#[async_trait]
pub trait WorkerPlatform: Send + Sync {
    /// Whether the platform has worker support at all.
    fn is_supported(&self) -> bool {
        true
    }

    /// Register the worker script at an origin-root path.
    async fn register(&self, script_path: &str) -> Result<(), ServiceWorkerError>;

    /// Registration events. `None` without worker support.
    fn subscribe(&self) -> Option<broadcast::Receiver<ContainerEvent>>;

    /// Check for a new build.
    async fn update(&self) -> Result<bool, ServiceWorkerError>;

    async fn controller(&self) -> Option<ServiceWorkerId>;

    async fn waiting(&self) -> Option<ServiceWorkerId>;

    /// Message handle for a worker.
    fn worker(&self, id: ServiceWorkerId) -> Option<WorkerHandle>;
}

#[async_trait]
impl WorkerPlatform for ServiceWorkerContainer {
    async fn register(&self, script_path: &str) -> Result<(), ServiceWorkerError> {
        let script_url = self.scope().join(script_path).map_err(|e| {
            ServiceWorkerError::RegistrationFailed(format!("bad script path '{}': {}", script_path, e))
        })?;
        ServiceWorkerContainer::register(self, script_url).await
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ContainerEvent>> {
        Some(ServiceWorkerContainer::subscribe(self))
    }

    async fn update(&self) -> Result<bool, ServiceWorkerError> {
        ServiceWorkerContainer::update(self).await
    }

    async fn controller(&self) -> Option<ServiceWorkerId> {
        ServiceWorkerContainer::controller(self).await
    }

    async fn waiting(&self) -> Option<ServiceWorkerId> {
        ServiceWorkerContainer::waiting(self).await.map(|w| w.id)
    }

    fn worker(&self, id: ServiceWorkerId) -> Option<WorkerHandle> {
        Some(ServiceWorkerContainer::worker(self, id))
    }
}

/// A platform without worker support.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoServiceWorker;

#[async_trait]
impl WorkerPlatform for NoServiceWorker {
    fn is_supported(&self) -> bool {
        false
    }

    async fn register(&self, _script_path: &str) -> Result<(), ServiceWorkerError> {
        Err(ServiceWorkerError::RegistrationFailed(
            "service workers are not supported".into(),
        ))
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ContainerEvent>> {
        None
    }

    async fn update(&self) -> Result<bool, ServiceWorkerError> {
        Ok(false)
    }

    async fn controller(&self) -> Option<ServiceWorkerId> {
        None
    }

    async fn waiting(&self) -> Option<ServiceWorkerId> {
        None
    }

    fn worker(&self, _id: ServiceWorkerId) -> Option<WorkerHandle> {
        None
    }
}
