//! # Casa Service Worker
//!
//! Offline-caching service worker runtime for the Casa listing site shell.
//!
//! ## Features
//!
//! - **Lifecycle**: install seeds the shell cache, activate prunes stale caches
//!   and claims open pages
//! - **Fetch interception**: network-first with cache fallback
//! - **Registration state machine**: explicit transitions, parked waiting worker
//! - **Control channel**: typed skip-waiting command from pages
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (host platform)
//!     │
//!     ├── Registration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       ├── active (ServiceWorker)
//!     │       └── controller
//!     │
//!     ├── ServiceWorkerScript (one per worker version)
//!     │       ├── install  → CacheStorage
//!     │       ├── activate → CacheStorage, ClientsClaim
//!     │       └── handle_fetch → Fetcher, CacheStorage
//!     │
//!     ├── events ──broadcast──→ pages (ContainerEvent)
//!     └── commands ←──mpsc─── pages (WorkerCommand)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use casa_common::CasaError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cache;
pub mod container;
pub mod message;
pub mod registration;
pub mod script;

pub use cache::{Cache, CacheStorage, CachedResponse, MemoryCacheStorage, RequestKey};
pub use container::{DeploymentSource, FileScriptSource, ScriptSource, ServiceWorkerContainer};
pub use message::{ContainerEvent, ControlAction, WorkerCommand, WorkerHandle};
pub use registration::{
    Registration, RegistrationEvent, RegistrationNotice, RegistrationState, ServiceWorker,
};
pub use script::{
    ActivateReport, ClientsClaim, FetchDecision, FetchResponse, InstallReport, ResponseSource,
    ServiceWorkerScript,
};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Invalid transition: {event} while {state}")]
    InvalidTransition {
        state: &'static str,
        event: &'static str,
    },

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Channel closed")]
    ChannelClosed,
}

impl From<ServiceWorkerError> for CasaError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::CacheError(message) => CasaError::cache(message),
            ServiceWorkerError::NotFound(what) => CasaError::NotFound(what),
            other => CasaError::registration_with_source("service worker", other),
        }
    }
}

// ==================== Types ====================

/// Unique identifier for a service worker.
///
/// Ids are monotonic, so a larger id is always a newer worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sw#{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Initial state, script parsed.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed; parks here while an older worker is active.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and eligible to control pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}
