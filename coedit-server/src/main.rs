use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use coedit_server::{ServerConfig, ServerState, server};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Collaboration server for coedit documents.
#[derive(Parser)]
struct Args {
    /// Address to listen on.
    #[clap(long, default_value = "0.0.0.0:3030")]
    listen: SocketAddr,
    /// JSON file mapping bearer tokens to principals; omit to run unsecured.
    #[clap(short, long)]
    auth: Option<PathBuf>,
    /// Directory for persisted documents.
    #[clap(short, long, default_value = "storage")]
    storage: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = ServerConfig::new(args.storage);
    config.auth_tokens = args.auth;
    let state = Arc::new(ServerState::new(config).await.context("server state")?);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!("listening on http://{}", args.listen);

    let app = server(Arc::clone(&state)).layer(TraceLayer::new_for_http());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    // Dirty documents flush before the process exits.
    state.persist().await;
    info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("{}=info,tower_http=info", env!("CARGO_CRATE_NAME")).into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "ctrl-c handler failed; shutting down");
    }
}
