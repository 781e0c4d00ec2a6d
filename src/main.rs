//! Model Cache - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use model_cache::{
    CacheConfig, DownloadEvent, EssentialManifest, HubTransport, ManifestCatalog, ModelCache,
    RepoKind, RepositoryId, StartOutcome, TracingListener, api, metrics, validate,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "model-cache")]
#[command(about = "Local cache and installer for model repositories", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API
    Serve {
        /// Override API port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Download one repository in the foreground
    Fetch {
        /// Repository identifier, e.g. "MNN/Qwen2.5-Omni-3B-MNN"
        id: String,

        #[arg(long, default_value = "model")]
        kind: RepoKind,
    },
    /// Check an installed directory and exit non-zero if it is unusable
    Verify {
        path: PathBuf,

        /// Manifest family to check against
        #[arg(long)]
        manifest: Option<String>,

        /// Extra essential file, may be repeated
        #[arg(long = "file")]
        files: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    let mut config = CacheConfig::load(cli.config)?;

    match cli.command {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.api_port = port;
            }
            serve(config).await
        }
        Command::Fetch { id, kind } => fetch(config, kind, &id).await,
        Command::Verify {
            path,
            manifest,
            files,
        } => verify(&config, &path, manifest.as_deref(), files),
    }
}

fn build_cache(config: &CacheConfig) -> Result<Arc<ModelCache>> {
    config.validate()?;

    tracing::info!(
        cache_root = ?config.cache_root,
        endpoint = %config.endpoint,
        repositories = config.repositories.len(),
        "Configuration loaded"
    );

    let transport = Arc::new(HubTransport::new(config.hub_settings())?);
    let catalog = Arc::new(ManifestCatalog::from_config(config)?);

    Ok(Arc::new(ModelCache::new(
        config.download_settings(),
        transport,
        catalog,
    )))
}

async fn serve(config: CacheConfig) -> Result<()> {
    tracing::info!("Starting Model Cache");

    let cache = build_cache(&config)?;
    cache.add_listener(Arc::new(TracingListener)).await;

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    // Prefetch flagged repositories
    let manager = cache.manager().await;
    for repo in config.repositories.iter().filter(|r| r.prefetch) {
        let id = repo.repository_id()?;
        match manager.start_download(&id) {
            Ok(outcome) => tracing::info!(repo = %id, outcome = ?outcome, "Prefetch requested"),
            Err(e) => tracing::error!(repo = %id, error = %e, "Failed to prefetch"),
        }
    }

    let app_state = api::AppState {
        cache: cache.clone(),
        prometheus_handle,
    };

    let app = api::create_router(app_state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API server")?;

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    tracing::info!("Shutting down...");

    // Partial downloads stay on disk for the next run
    cache.manager().await.shutdown().await;

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn fetch(config: CacheConfig, kind: RepoKind, identifier: &str) -> Result<()> {
    let id = RepositoryId::new(kind, identifier)?;
    let cache = build_cache(&config)?;
    let manager = cache.manager().await;
    manager.add_listener(Arc::new(TracingListener));

    let mut events = manager.subscribe();
    match manager.start_download(&id)? {
        StartOutcome::AlreadyComplete(path) => {
            println!("{}", path.display());
            return Ok(());
        }
        StartOutcome::Started | StartOutcome::AlreadyActive => {}
    }

    let wait = async {
        loop {
            match events.recv().await {
                Ok(DownloadEvent::Finished { repository, path }) if repository == id => {
                    return Ok(path);
                }
                Ok(DownloadEvent::Failed { repository, error }) if repository == id => {
                    anyhow::bail!("Download of {} failed: {}", id, error);
                }
                Ok(DownloadEvent::Paused { repository }) if repository == id => {
                    anyhow::bail!("Download of {} was paused", id);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => anyhow::bail!("Event stream closed"),
            }
        }
    };

    let result = tokio::select! {
        result = wait => result,
        _ = shutdown_signal() => {
            manager.pause_download(&id).await;
            Err(anyhow::anyhow!("Interrupted, partial data kept for resume"))
        }
    };
    manager.flush_events().await;

    let path = result?;
    println!("{}", path.display());
    Ok(())
}

fn verify(
    config: &CacheConfig,
    path: &std::path::Path,
    family: Option<&str>,
    extra_files: Vec<String>,
) -> Result<()> {
    let catalog = ManifestCatalog::from_config(config)?;

    let mut files = match family {
        Some(name) => catalog
            .family(name)
            .map(EssentialManifest::files)
            .map(<[String]>::to_vec)
            .with_context(|| format!("Unknown manifest '{}'", name))?,
        None => Vec::new(),
    };
    files.extend(extra_files);

    validate(path, &files).with_context(|| format!("{} is not a usable model directory", path.display()))?;

    println!("{} is valid", path.display());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
