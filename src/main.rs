//! execd - interactive command execution for project workspaces
//!
//! Runs allowlisted commands in per-(project, user) sessions and exposes
//! them over HTTP and WebSocket. Idle sessions are reaped in the background.

use clap::{Parser as ClapParser, Subcommand};
use execd::{
    api,
    config::{self, Config, ConfigError},
    reaper::Reaper,
    session::SessionRegistry,
    shutdown::ShutdownCoordinator,
    workspace::DirectoryResolver,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// execd - interactive command execution sessions
#[derive(ClapParser, Debug)]
#[command(name = "execd", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP/WebSocket server
    Server {
        /// Address to bind the HTTP/WebSocket API server
        #[arg(long, env = "EXECD_BIND")]
        bind: Option<SocketAddr>,

        /// Directory containing one subdirectory per project
        #[arg(long, env = "EXECD_WORKSPACE_ROOT")]
        workspace_root: Option<PathBuf>,

        /// Path to the TOML config file
        #[arg(long, env = "EXECD_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[derive(Error, Debug)]
enum ExecdError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid bind address: {0}")]
    InvalidBind(#[from] std::net::AddrParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), ExecdError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Server {
            bind,
            workspace_root,
            config,
        } => run_server(bind, workspace_root, config).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "execd=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_server(
    bind: Option<SocketAddr>,
    workspace_root: Option<PathBuf>,
    config_path: Option<PathBuf>,
) -> Result<(), ExecdError> {
    let config_path = config_path.unwrap_or_else(config::default_config_path);
    let config = Config::load_or_default(&config_path)?;
    tracing::debug!(path = %config_path.display(), "config loaded");

    let bind = match bind.or(config.server.bind) {
        Some(addr) => addr,
        None => DEFAULT_BIND.parse()?,
    };
    let workspace_root = match workspace_root.or(config.server.workspace_root.clone()) {
        Some(root) => root,
        None => std::env::current_dir()?,
    };

    tracing::info!(root = %workspace_root.display(), "execd server starting");

    let sessions = SessionRegistry::with_config(config.sessions.clone());
    let shutdown = ShutdownCoordinator::new();
    let reaper = Reaper::spawn(sessions.clone(), config.reaper.to_reaper_config());
    let state = api::AppState {
        sessions: sessions.clone(),
        resolver: Arc::new(DirectoryResolver::new(workspace_root)),
        shutdown: shutdown.clone(),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %bind, "HTTP/WS server listening");

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                server_shutdown_rx.await.ok();
            })
            .await
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for Ctrl+C, shutting down");
    } else {
        tracing::info!("received Ctrl+C");
    }

    // Signal WebSocket handlers to send close frames
    shutdown.shutdown();
    if !shutdown.wait_for_all_closed(Duration::from_millis(500)).await {
        tracing::debug!(
            remaining = shutdown.active_connections(),
            "websocket connections still open at shutdown"
        );
    }
    let _ = server_shutdown_tx.send(());

    match http_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "HTTP server error"),
        Err(e) => tracing::warn!(?e, "HTTP server task panicked"),
    }

    reaper.shutdown().await;
    let drained = sessions.drain();
    tracing::info!(sessions = drained, "execd server exiting");
    Ok(())
}
