//! Cardforge server
//!
//! Streams flashcard-deck generation over WebSocket: each connection is a
//! session that drives an LLM agent through a research-and-package toolset,
//! with the finished deck served back over HTTP.

mod artifacts;
mod download;
mod logging;
mod run;
mod state;
mod tools;
mod websocket;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use axum::{response::IntoResponse, routing::get, Router};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use cardforge_agent::CliBackend;

use crate::download::download_handler;
use crate::logging::init_logging;
use crate::state::AppState;
use crate::websocket::ws_handler;

#[derive(Parser, Debug)]
#[command(name = "cardforge", about = "Flashcard deck generation server")]
struct Cli {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "CARDFORGE_PORT", default_value_t = 4000)]
    port: u16,

    /// Root directory for per-session output directories. Defaults to
    /// ~/.cardforge/outputs.
    #[arg(long, env = "CARDFORGE_ARTIFACT_ROOT")]
    artifact_root: Option<PathBuf>,

    /// Model passed through to the agent CLI
    #[arg(long, env = "CARDFORGE_MODEL")]
    model: Option<String>,

    /// Stream tool input parameters to clients as log lines
    #[arg(long)]
    verbose: bool,
}

fn default_artifact_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".cardforge")
        .join("outputs")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let logging = init_logging()?;

    let artifact_root = cli.artifact_root.unwrap_or_else(default_artifact_root);
    std::fs::create_dir_all(&artifact_root)?;

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        artifact_root = %artifact_root.display(),
        model = ?cli.model,
        verbose = cli.verbose,
        "Starting cardforge server"
    );

    let backend = Arc::new(CliBackend::with_model(cli.model.clone()));
    let state = Arc::new(AppState::new(artifact_root, backend, cli.verbose));

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/download/{session_id}", get(download_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr = SocketAddr::from((cli.host, cli.port));
    info!(
        component = "server",
        event = "server.listening",
        addr = %addr,
        "Listening"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}
