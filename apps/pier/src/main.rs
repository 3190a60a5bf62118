use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pier::cli::Cli;
use pier::config::Config;
use pier::state::AppState;
use pier::{api, ws};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG wins when set; LOG_LEVEL is the documented knob.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Config::log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    let addr = format!("{}:{}", cli.bind, config.port);
    info!(
        adb = %format!("{}:{}", config.adb_host, config.adb_port),
        recordings = %config.recordings_dir.display(),
        uploads = %config.uploads_dir.display(),
        "starting pier"
    );

    let state: Arc<AppState> = AppState::new(config);
    let app = Router::new()
        .merge(ws::router())
        .merge(api::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("pier listening on {addr}");
    axum::serve(listener, app).await.context("server terminated")?;
    Ok(())
}
