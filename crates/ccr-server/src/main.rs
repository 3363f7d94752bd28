//! Process entrypoint, grounded on `goose-server`'s `commands/agent.rs`:
//! set up logging, load configuration, build shared state, wire CORS and
//! the auth middleware around the composed router, then serve with
//! graceful shutdown.

mod api_error;
mod app_state;
mod auth;
mod logging;
mod routes;

use anyhow::{Context, Result};
use axum::middleware;
use ccr_core::config::Config;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use app_state::AppState;

fn config_path() -> String {
    std::env::var("CCR_CONFIG").unwrap_or_else(|_| "./config.json".to_string())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining in-flight requests");
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::setup_logging("ccr-server")?;

    let path = config_path();
    let config = Config::from_file(&path).with_context(|| format!("loading config from {path}"))?;
    config.validate().context("validating configuration")?;

    let host = config.host().to_string();
    let port = config.port();

    let state = AppState::new(config);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::configure(state.clone())
        .layer(middleware::from_fn_with_state(state, auth::check_auth))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, "ccr-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}
