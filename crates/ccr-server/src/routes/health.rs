//! Liveness and landing routes (§6), grounded on `goose-server`'s trivial
//! `routes/health.rs`.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};

use crate::app_state::AppState;

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
}

async fn health() -> Json<StatusResponse> {
    Json(StatusResponse { status: "ok" })
}

async fn root(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = state.config();
    Json(json!({
        "name": "ccr-server",
        "providers": config.providers().len(),
    }))
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health)).route("/", get(root))
}
