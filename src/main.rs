//! Shellcache Daemon - offline cache in front of a web application shell
//!
//! This daemon stages the application shell at startup, reconciles it with
//! the previously committed manifest and then answers HTTP requests from the
//! cache or the origin.

mod cache;
mod config;
mod ipc;
mod manifest;
mod origin;
mod proxy;
mod worker;

use anyhow::{anyhow, Result};
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use cache::{CacheStorage, DiskStorage, MemoryStorage};
use config::{DaemonConfig, StorageKind};
use ipc::{send_command, IpcServer, Response};
use manifest::ResourceManifest;
use origin::OriginClient;
use proxy::ProxyServer;
use worker::{ServiceWorker, WorkerOptions};

/// CLI command
#[derive(Debug)]
enum Command {
    /// Run the proxy and IPC servers (default)
    Serve,
    /// Activate a staged worker on a running daemon
    SkipWaiting,
    /// Start the offline sync on a running daemon
    Sync,
    /// Show the running daemon's status
    Status,
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"Shellcache Daemon - Offline cache for a web application shell

USAGE:
    shellcache-daemon [serve]            # Run the daemon (default)
    shellcache-daemon skip-waiting
    shellcache-daemon sync
    shellcache-daemon status
    shellcache-daemon help

COMMANDS:
    serve         Install the shell, activate and serve requests
    skip-waiting  Activate a daemon started with SHELLCACHE_WAIT_FOR_SKIP
    sync          Cache every manifest resource for offline use
    status        Show worker state, cache counters and origin health
    help          Show this help message

ENVIRONMENT:
    SHELLCACHE_ORIGIN         Origin to front, e.g. https://app.example.com (required)
    SHELLCACHE_MANIFEST       Resource manifest JSON file (required)
    SHELLCACHE_SHELL          Comma-separated shell paths fetched on install
    SHELLCACHE_LISTEN         Proxy listen address (default 127.0.0.1:8787)
    SHELLCACHE_SOCKET         IPC socket path (default /tmp/shellcache.sock)
    SHELLCACHE_CACHE_DIR      Cache directory for disk storage
    SHELLCACHE_STORAGE        disk | memory (default disk)
    SHELLCACHE_WAIT_FOR_SKIP  1/true to stay staged until skip-waiting
    RUST_LOG                  Log level (trace, debug, info, warn, error)
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Serve);
    }

    match args[1].as_str() {
        "serve" => Ok(Command::Serve),
        "skip-waiting" => Ok(Command::SkipWaiting),
        "sync" => Ok(Command::Sync),
        "status" => Ok(Command::Status),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(anyhow!("Unknown command: {}", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    match command {
        Command::Serve => serve().await,
        Command::SkipWaiting => control(ipc::Command::SkipWaiting).await,
        Command::Sync => control(ipc::Command::DownloadOffline).await,
        Command::Status => control(ipc::Command::GetStatus).await,
        Command::Help => {
            print_help();
            Ok(())
        }
    }
}

async fn serve() -> Result<()> {
    let config = DaemonConfig::from_env()?;
    info!(origin = %config.origin, "Starting Shellcache daemon");

    let manifest = ResourceManifest::load_file(&config.manifest_path)?;
    info!(
        path = %config.manifest_path.display(),
        resources = manifest.len(),
        "Loaded resource manifest"
    );
    if manifest.is_empty() {
        warn!("Manifest lists no resources, every request will pass through");
    }

    let storage: Arc<dyn CacheStorage> = match config.storage {
        StorageKind::Disk => match &config.cache_dir {
            Some(dir) => Arc::new(DiskStorage::with_root(dir.clone())?),
            None => Arc::new(DiskStorage::new()?),
        },
        StorageKind::Memory => Arc::new(MemoryStorage::new()),
    };

    let origin = Arc::new(OriginClient::new(&config.origin)?);
    let options = WorkerOptions {
        origin: config.origin.clone(),
        shell: config.shell.clone(),
        wait_for_skip: config.wait_for_skip,
    };
    let worker = Arc::new(ServiceWorker::new(
        manifest,
        options,
        storage,
        origin.clone(),
    )?);

    // A shell that cannot be staged leaves the daemon unusable
    if let Err(e) = worker.start().await {
        error!(error = %e, "Failed to install application shell");
        std::process::exit(1);
    }

    let mut proxy = ProxyServer::new(Arc::clone(&worker), config.listen);
    proxy.start().await?;

    let mut ipc_server = IpcServer::new(Arc::clone(&worker), origin, &config.socket_path);
    if let Err(e) = ipc_server.start().await {
        error!(error = %e, "Failed to start IPC server");
        return Err(e);
    }

    info!("Daemon ready");

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    let ipc_server = Arc::new(ipc_server);
    let ipc_task = Arc::clone(&ipc_server);
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = ipc_task.run().await {
            error!(error = %e, "IPC server error");
        }
    });

    tokio::signal::ctrl_c().await?;

    info!("Received shutdown signal");
    proxy_handle.abort();
    ipc_handle.abort();
    ipc_server.stop()?;

    info!("Shutdown complete.");
    Ok(())
}

async fn control(command: ipc::Command) -> Result<()> {
    let socket_path = config::socket_path_from_env();

    match send_command(&socket_path, &command).await? {
        Response::Success { message } => {
            println!("{}", message.unwrap_or_else(|| "OK".to_string()));
        }
        Response::Error { error } => {
            return Err(anyhow!(error));
        }
        Response::Status {
            version,
            state,
            active,
            origin,
            health,
            manifest_entries,
            live_entries,
            hits,
            misses,
            recent_errors,
        } => {
            println!("Shellcache daemon (protocol v{})", version);
            println!("  origin:    {} ({})", origin, health);
            println!("  state:     {}{}", state, if active { ", active" } else { "" });
            println!("  manifest:  {} resources", manifest_entries);
            println!("  cached:    {} resources", live_entries);
            println!("  hits:      {}  misses: {}", hits, misses);
            if !recent_errors.is_empty() {
                println!("Recent origin errors:");
                for entry in recent_errors {
                    println!(
                        "  [{}] {} {}: {}",
                        entry.timestamp, entry.method, entry.path, entry.error
                    );
                }
            }
        }
    }

    Ok(())
}
