use anyhow::{Context, Result};
use axum::Router;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use tree_sync::api::{self, AppState};
use tree_sync::remote::MemoryStore;
use tree_sync::sync::{
    Phase, SessionController, SessionManager, SyncRequest, TerminalPhase, TransferStatus,
};
use tree_sync::utils::{self, Config};
use tree_sync::web;

#[derive(Parser)]
#[command(name = "tree-sync", version, about = "Incremental tree synchronisation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mirror files and directories into a destination root
    Sync {
        #[arg(required = true)]
        sources: Vec<PathBuf>,
        /// Destination root (defaults to SYNC_DEST)
        #[arg(short, long)]
        dest: Option<PathBuf>,
        /// Worker threads (defaults to SYNC_WORKERS)
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Serve the HTTP and WebSocket front end
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init_tracing();
    let cli = Cli::parse();
    let config = utils::config::load_config()?;

    match cli.command {
        Command::Sync { sources, dest, workers } => {
            let dest_root = dest
                .or_else(|| config.default_dest.clone())
                .context("no destination given; pass --dest or set SYNC_DEST")?;
            let request = SyncRequest {
                sources,
                dest_root,
                workers: workers.unwrap_or(config.workers),
            };
            let phase = sync_once(&config, request).await?;
            if phase == TerminalPhase::Error {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Serve { port } => serve(config, port).await,
    }
}

/// One batch run on the terminal; Ctrl+C cancels.
async fn sync_once(config: &Config, request: SyncRequest) -> Result<TerminalPhase> {
    let (session, events) = SessionController::new("cli", config.session_options());
    let started = Instant::now();
    let handle = session.start(request)?;

    let canceller = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            canceller.cancel();
        }
    });

    let mut events = UnboundedReceiverStream::new(events);
    while let Some(event) = events.next().await {
        match event.phase {
            Phase::Downloading => println!("[{:>3}%] {}", event.percent, event.item_name),
            Phase::Status => {
                if let Some(message) = &event.message {
                    println!("{}", message);
                }
            }
            _ => {}
        }
        if event.phase.is_terminal() {
            break;
        }
    }

    let phase = tokio::task::spawn_blocking(move || handle.join()).await?;
    let status = session.status();
    for result in status.results.iter().filter(|r| r.status == TransferStatus::Error) {
        eprintln!("{}", result.message);
    }
    println!(
        "{:?}: {} in {}",
        phase,
        status.summary,
        humantime::format_duration(Duration::from_millis(started.elapsed().as_millis() as u64))
    );
    Ok(phase)
}

async fn serve(config: Config, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or(config.port);
    info!("Starting tree-sync v{}", env!("CARGO_PKG_VERSION"));
    info!("CPU cores available: {}", num_cpus::get());

    let sessions = SessionManager::new(config.session_options());
    let state = AppState {
        sessions: sessions.clone(),
        store: Arc::new(MemoryStore::new()),
    };

    let app = Router::new()
        .nest("/api", api::routes())
        .nest("/ws", web::websocket::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let stopped = sessions.shutdown().await;
    info!("Server stopped gracefully ({} running session(s) cancelled)", stopped);
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
