//! The worker script: install, activate, fetch and message handlers.
//!
//! Handlers never fail a lifecycle event. Every failure is logged and
//! reported back in the handler's report.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use casa_core::WorkerConfig;
use casa_net::{Fetcher, InterceptAction, Request, RequestFilter, Response};
use futures::future::join_all;
use http::{header, HeaderMap, HeaderValue};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, CachedResponse, RequestKey};
use crate::message::{ControlAction, WorkerCommand};
use crate::ServiceWorkerError;

/// Body of the synthesized offline response.
pub const OFFLINE_BODY: &str = "Offline - content not available";

/// Status of the synthesized offline response.
pub const OFFLINE_STATUS: u16 = 503;

// ==================== Reports ====================

/// Outcome of the install handler.
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    pub cache_name: String,
    pub seeded: Vec<Url>,
    pub failed: Vec<(Url, String)>,
    /// Ask the platform to activate without waiting.
    pub skip_waiting: bool,
}

/// Outcome of the activate handler.
#[derive(Debug, Clone, Default)]
pub struct ActivateReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
    pub claimed: bool,
}

/// `clients.claim()`: take control of already-open pages.
#[async_trait]
pub trait ClientsClaim: Send + Sync {
    async fn claim(&self) -> Result<(), ServiceWorkerError>;
}

// ==================== Fetch ====================

/// Where a handled response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    Offline,
}

/// A response produced by the worker.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub response: Response,
    pub source: ResponseSource,
}

impl FetchResponse {
    pub fn from_cache(&self) -> bool {
        self.source == ResponseSource::Cache
    }
}

/// Result of the fetch handler.
#[derive(Debug, Clone)]
pub enum FetchDecision {
    /// The worker did not intercept; default network handling applies.
    Passthrough,
    Respond(FetchResponse),
}

impl FetchDecision {
    pub fn response(&self) -> Option<&FetchResponse> {
        match self {
            FetchDecision::Passthrough => None,
            FetchDecision::Respond(r) => Some(r),
        }
    }
}

// ==================== Script ====================

/// One worker build: its config and the handlers bound to it.
pub struct ServiceWorkerScript {
    config: WorkerConfig,
    cache_name: String,
    filter: RequestFilter,
    fetcher: Arc<dyn Fetcher>,
    caches: Arc<dyn CacheStorage>,
    pending_writes: Mutex<JoinSet<()>>,
}

impl ServiceWorkerScript {
    pub fn new(
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
        caches: Arc<dyn CacheStorage>,
    ) -> Self {
        let cache_name = config.cache_name();
        let filter = RequestFilter::from_patterns(&config.excluded_patterns);
        Self {
            config,
            cache_name,
            filter,
            fetcher,
            caches,
            pending_writes: Mutex::new(JoinSet::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    /// Name of the cache this build owns.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    // -------------------- install --------------------

    /// Seed the shell assets into the current cache.
    pub async fn install(&self) -> InstallReport {
        let mut report = InstallReport {
            cache_name: self.cache_name.clone(),
            skip_waiting: self.config.skip_waiting_on_install,
            ..Default::default()
        };

        if let Err(e) = self.caches.open(&self.cache_name).await {
            warn!(cache = %self.cache_name, error = %e, "Failed to open cache, skipping seeding");
            return report;
        }

        let urls = match self.config.shell_asset_urls() {
            Ok(urls) => urls,
            Err(e) => {
                warn!(error = %e, "Invalid shell asset manifest, skipping seeding");
                return report;
            }
        };

        let results = join_all(urls.into_iter().map(|url| async move {
            let outcome = self.seed_asset(&url).await;
            (url, outcome)
        }))
        .await;

        for (url, outcome) in results {
            match outcome {
                Ok(()) => report.seeded.push(url),
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to cache shell asset");
                    report.failed.push((url, e.to_string()));
                }
            }
        }

        info!(
            cache = %self.cache_name,
            seeded = report.seeded.len(),
            failed = report.failed.len(),
            "Install complete"
        );
        report
    }

    async fn seed_asset(&self, url: &Url) -> Result<(), ServiceWorkerError> {
        let request = Request::get(url.clone());
        let response = self
            .fetcher
            .fetch(&request)
            .await
            .map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))?;

        if !response.ok() {
            return Err(ServiceWorkerError::ScriptError(format!(
                "unexpected status {}",
                response.status
            )));
        }

        self.caches
            .put(
                &self.cache_name,
                RequestKey::from_request(&request),
                CachedResponse::from_response(&response),
            )
            .await
    }

    // -------------------- activate --------------------

    /// Delete every cache but the current one, then claim open pages.
    pub async fn activate(&self, clients: &dyn ClientsClaim) -> ActivateReport {
        let mut report = ActivateReport::default();

        match self.caches.keys().await {
            Ok(names) => {
                for name in names.into_iter().filter(|n| *n != self.cache_name) {
                    match self.caches.delete(&name).await {
                        Ok(_) => {
                            debug!(cache = %name, "Deleted stale cache");
                            report.deleted.push(name);
                        }
                        Err(e) => {
                            warn!(cache = %name, error = %e, "Failed to delete stale cache");
                            report.failed.push(name);
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list caches"),
        }

        match clients.claim().await {
            Ok(()) => report.claimed = true,
            Err(e) => warn!(error = %e, "Failed to claim clients"),
        }

        info!(
            cache = %self.cache_name,
            deleted = report.deleted.len(),
            claimed = report.claimed,
            "Activate complete"
        );
        report
    }

    // -------------------- fetch --------------------

    /// Network first, cache fallback, offline placeholder last.
    pub async fn handle_fetch(&self, request: &Request) -> FetchDecision {
        if self.filter.classify(request) == InterceptAction::Passthrough {
            return FetchDecision::Passthrough;
        }

        let key = RequestKey::from_request(request);

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if self.is_cacheable(&response) {
                    self.spawn_cache_write(key, CachedResponse::from_response(&response));
                }
                FetchDecision::Respond(FetchResponse {
                    response,
                    source: ResponseSource::Network,
                })
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying cache");
                match self.caches.match_request(&self.cache_name, &key).await {
                    Ok(Some(entry)) => FetchDecision::Respond(FetchResponse {
                        response: entry.to_response(),
                        source: ResponseSource::Cache,
                    }),
                    Ok(None) => FetchDecision::Respond(offline_response(request.url.clone())),
                    Err(e) => {
                        warn!(url = %request.url, error = %e, "Cache lookup failed");
                        FetchDecision::Respond(offline_response(request.url.clone()))
                    }
                }
            }
        }
    }

    fn is_cacheable(&self, response: &Response) -> bool {
        match response.status {
            200 => true,
            0 => self.config.cache_opaque_responses,
            _ => false,
        }
    }

    fn spawn_cache_write(&self, key: RequestKey, entry: CachedResponse) {
        let caches = Arc::clone(&self.caches);
        let cache_name = self.cache_name.clone();
        let task = async move {
            if let Err(e) = caches.put(&cache_name, key.clone(), entry).await {
                warn!(key = %key, error = %e, "Failed to cache response");
            }
        };

        let mut writes = match self.pending_writes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Reap finished writes so the set does not grow unbounded.
        while writes.try_join_next().is_some() {}
        writes.spawn(task);
    }

    /// Wait for every cache write started so far.
    pub async fn flush(&self) {
        let mut writes = {
            let mut guard = match self.pending_writes.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        while writes.join_next().await.is_some() {}
    }

    // -------------------- message --------------------

    /// Handle a page command.
    pub fn handle_message(&self, command: &WorkerCommand) -> Option<ControlAction> {
        match command {
            WorkerCommand::SkipWaiting => {
                debug!(version = %self.config.version, "Skip waiting requested");
                Some(ControlAction::SkipWaiting)
            }
        }
    }
}

fn offline_response(url: Url) -> FetchResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    FetchResponse {
        response: Response::new(
            url,
            OFFLINE_STATUS,
            headers,
            Bytes::from_static(OFFLINE_BODY.as_bytes()),
        ),
        source: ResponseSource::Offline,
    }
}
