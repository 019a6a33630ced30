//! Host binary for the Casa offline shell.
//!
//! ## Usage
//!
//! ```bash
//! # Install the worker for the configured origin and fetch pages through it
//! casa fetch / /listings /listings/42
//!
//! # Watch a deployment file and prompt when a new build is waiting
//! casa watch --deployment deploy.json
//!
//! # Print the effective configuration
//! casa config
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use casa_common::{init_logging, CasaError, LogConfig};
use casa_core::CasaConfig;
use casa_net::{Fetcher, LoaderConfig, Request, ResourceLoader};
use casa_page::{MonitorConfig, PageHost, UpdateMonitor, UpdateNotification};
use casa_sw::{
    CacheStorage, DeploymentSource, FetchDecision, FileScriptSource, MemoryCacheStorage,
    ResponseSource, ScriptSource, ServiceWorkerContainer,
};
use clap::{Parser, Subcommand};
use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "casa")]
#[command(about = "Offline shell host for the Casa listing site")]
struct Cli {
    /// Config file (defaults to <config dir>/casa/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the worker, then fetch paths through its interceptor
    Fetch {
        /// Paths or absolute URLs, resolved against the configured origin
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Run the update monitor against a deployment file
    Watch {
        /// JSON file whose `worker` section is the deployed build
        #[arg(short, long)]
        deployment: PathBuf,

        /// Apply updates as soon as they are waiting
        #[arg(long)]
        auto_update: bool,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = CasaConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load configuration")?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    init_logging(LogConfig::from_names(level, &config.log.format))?;

    match cli.command {
        Commands::Fetch { paths } => run_fetch(&config, &paths).await,
        Commands::Watch {
            deployment,
            auto_update,
        } => run_watch(&config, deployment, auto_update).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn loader(config: &CasaConfig) -> Result<Arc<dyn Fetcher>> {
    let loader = ResourceLoader::new(LoaderConfig::from(&config.network))
        .context("Failed to create HTTP client")?;
    Ok(Arc::new(loader))
}

fn container(
    config: &CasaConfig,
    fetcher: Arc<dyn Fetcher>,
    caches: Arc<dyn CacheStorage>,
    source: Arc<dyn ScriptSource>,
) -> ServiceWorkerContainer {
    ServiceWorkerContainer::new(config.worker.origin.clone(), fetcher, caches, source)
}

async fn run_fetch(config: &CasaConfig, paths: &[String]) -> Result<()> {
    let fetcher = loader(config)?;
    let caches = Arc::new(MemoryCacheStorage::new());
    let source = Arc::new(DeploymentSource::new(config.worker.clone()));
    let container = container(config, Arc::clone(&fetcher), caches.clone(), source);

    container
        .register(config.script_url()?)
        .await
        .context("Service worker registration failed")?;

    for path in paths {
        let url = config.worker.resolve(path)?;
        let request = Request::get(url.clone());
        match container.fetch(&request).await {
            FetchDecision::Respond(handled) => {
                println!(
                    "{:<12} {:>3} {}",
                    source_label(handled.source),
                    handled.response.status,
                    url
                );
            }
            FetchDecision::Passthrough => match fetcher.fetch(&request).await {
                Ok(response) => println!("{:<12} {:>3} {}", "passthrough", response.status, url),
                Err(e) => {
                    let err = CasaError::from(e);
                    let hint = if err.is_retryable() { ", retryable" } else { "" };
                    println!("{:<12} {:>3} {} ({}{})", "passthrough", "-", url, err, hint);
                }
            },
        }
    }

    container.flush().await;

    for name in caches.keys().await? {
        let entries = caches.entries(&name).await?;
        println!("{} ({} entries)", name, entries.len());
        for key in entries {
            println!("  {}", key);
        }
    }
    Ok(())
}

fn source_label(source: ResponseSource) -> &'static str {
    match source {
        ResponseSource::Network => "network",
        ResponseSource::Cache => "cache",
        ResponseSource::Offline => "offline",
    }
}

/// Stands in for the browser tab: a reload is logged and signalled.
#[derive(Default)]
struct ConsoleHost {
    reloaded: Notify,
}

impl PageHost for ConsoleHost {
    fn reload(&self) {
        info!("Reloading page");
        self.reloaded.notify_one();
    }
}

async fn run_watch(config: &CasaConfig, deployment: PathBuf, auto_update: bool) -> Result<()> {
    let source = Arc::new(FileScriptSource::new(deployment));
    let container = Arc::new(container(
        config,
        loader(config)?,
        Arc::new(MemoryCacheStorage::new()),
        source.clone(),
    ));
    let host = Arc::new(ConsoleHost::default());

    let monitor = UpdateMonitor::start(
        container.clone(),
        host.clone(),
        MonitorConfig::from(&config.page),
    )
    .await
    .context("Service worker registration failed")?;

    info!(
        deployment = %source.path().display(),
        interval_secs = config.page.update_check_interval_secs,
        "Watching for new builds"
    );

    let mut prompt = UpdateNotification::new(monitor.subscribe(), monitor.trigger());
    loop {
        tokio::select! {
            changed = prompt.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(view) = prompt.view() else {
                    continue;
                };
                println!("{}", view);
                if auto_update {
                    if let Err(e) = prompt.update_now() {
                        warn!(error = %e, "Failed to apply update");
                    }
                }
            }
            _ = host.reloaded.notified() => {
                let controller = container.controller().await;
                let version = match controller {
                    Some(id) => container.version_of(id).await,
                    None => None,
                };
                info!(version = version.as_deref().unwrap_or("none"), "Now running");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    drop(monitor);
    Ok(())
}
